//! Randomized browser fingerprints and request shaping.
//!
//! A [`FingerprintContext`] is drawn once per login or session and reused for
//! every request so the portal sees one consistent browser.

mod evasion;
mod tables;

use std::sync::Arc;

use rand::seq::IndexedRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use evasion::{apply_patches, EvasionError, EvasionProvider, ManualEvasion, ScriptDirEvasion};
pub use tables::{LOCALES, TIMEZONES, USER_AGENTS, VIEWPORTS};

use tables::GEO_JITTER_DEGREES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in meters.
    pub accuracy: f64,
}

/// One browser identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintContext {
    pub viewport: Viewport,
    pub user_agent: String,
    pub locale: String,
    pub timezone: String,
    pub geolocation: Geolocation,
}

impl FingerprintContext {
    /// `navigator.platform` matching the user agent.
    pub fn platform(&self) -> &'static str {
        if self.user_agent.contains("Windows") {
            "Win32"
        } else if self.user_agent.contains("Macintosh") {
            "MacIntel"
        } else {
            "Linux x86_64"
        }
    }

    /// `navigator.languages` for the locale.
    pub fn languages(&self) -> Vec<String> {
        let primary = self.locale.split('-').next().unwrap_or("en").to_string();
        if primary == self.locale {
            vec![primary]
        } else {
            vec![self.locale.clone(), primary]
        }
    }

    pub fn accept_language(&self) -> String {
        let langs = self.languages();
        match langs.as_slice() {
            [only] => only.clone(),
            [first, second, ..] => format!("{},{};q=0.9", first, second),
            [] => "en-US,en;q=0.9".to_string(),
        }
    }

    fn is_chromium(&self) -> bool {
        self.user_agent.contains("Chrome/") && !self.user_agent.contains("Firefox/")
    }

    /// Headers that make a plain HTTP request look like this browser.
    pub fn request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut insert = |name: HeaderName, value: &str| {
            if let Ok(v) = HeaderValue::from_str(value) {
                headers.insert(name, v);
            }
        };
        insert(USER_AGENT, &self.user_agent);
        insert(ACCEPT_LANGUAGE, &self.accept_language());
        insert(ACCEPT, "application/json, text/plain, */*");
        if self.is_chromium() {
            let platform = match self.platform() {
                "Win32" => "\"Windows\"",
                "MacIntel" => "\"macOS\"",
                _ => "\"Linux\"",
            };
            insert(HeaderName::from_static("sec-ch-ua-platform"), platform);
            insert(HeaderName::from_static("sec-ch-ua-mobile"), "?0");
        }
        headers
    }
}

/// Fields to pin instead of randomizing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextOverrides {
    #[serde(default)]
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

/// Produces fingerprints and evasion patches.
#[derive(Clone, Default)]
pub struct StealthContextFactory {
    provider: Option<Arc<dyn EvasionProvider>>,
}

impl StealthContextFactory {
    /// Factory with only the built-in patch set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory that prefers `provider` and falls back to the built-in patches.
    pub fn with_provider(provider: Arc<dyn EvasionProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    pub fn create_context(&self, overrides: &ContextOverrides) -> FingerprintContext {
        let mut rng = rand::rng();

        let viewport = overrides.viewport.unwrap_or_else(|| {
            let (width, height) = *VIEWPORTS.choose(&mut rng).unwrap_or(&(1920, 1080));
            Viewport { width, height }
        });
        let user_agent = overrides
            .user_agent
            .clone()
            .or_else(|| USER_AGENTS.choose(&mut rng).map(|s| s.to_string()))
            .unwrap_or_default();
        let locale = overrides
            .locale
            .clone()
            .or_else(|| LOCALES.choose(&mut rng).map(|s| s.to_string()))
            .unwrap_or_else(|| "en-US".to_string());

        let (timezone, lat, lon) = match &overrides.timezone {
            Some(tz) => {
                let (_, lat, lon) = TIMEZONES
                    .iter()
                    .find(|(name, _, _)| name == tz)
                    .or(TIMEZONES.first())
                    .copied()
                    .unwrap_or(("UTC", 0.0, 0.0));
                (tz.clone(), lat, lon)
            }
            None => {
                let (name, lat, lon) = TIMEZONES
                    .choose(&mut rng)
                    .copied()
                    .unwrap_or(("America/New_York", 40.7128, -74.0060));
                (name.to_string(), lat, lon)
            }
        };

        let geolocation = Geolocation {
            latitude: lat + rng.random_range(-GEO_JITTER_DEGREES..=GEO_JITTER_DEGREES),
            longitude: lon + rng.random_range(-GEO_JITTER_DEGREES..=GEO_JITTER_DEGREES),
            accuracy: rng.random_range(20.0..=100.0),
        };

        FingerprintContext {
            viewport,
            user_agent,
            locale,
            timezone,
            geolocation,
        }
    }

    /// Patches for `context`, falling back to the built-in set when the
    /// configured provider is unavailable.
    pub fn evasion_patches(&self, context: &FingerprintContext) -> Vec<String> {
        if let Some(provider) = &self.provider {
            match provider.patches(context) {
                Ok(patches) => return patches,
                Err(e) => warn!(
                    "Evasion provider '{}' failed, using manual patches: {}",
                    provider.name(),
                    e
                ),
            }
        }
        ManualEvasion.patches(context).unwrap_or_default()
    }
}
