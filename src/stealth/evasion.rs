//! Anti-detection patch providers.

use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use super::tables::MANUAL_PATCHES;
use super::FingerprintContext;

#[derive(Debug, Error)]
pub enum EvasionError {
    #[error("Evasion provider unavailable: {0}")]
    Unavailable(String),
    #[error("Failed to load evasion script {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Source of JavaScript patches injected into a login page.
pub trait EvasionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Patch scripts for a page using `context`.
    fn patches(&self, context: &FingerprintContext) -> Result<Vec<String>, EvasionError>;
}

/// Built-in patch set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualEvasion;

impl EvasionProvider for ManualEvasion {
    fn name(&self) -> &str {
        "manual"
    }

    fn patches(&self, context: &FingerprintContext) -> Result<Vec<String>, EvasionError> {
        let languages = format!("{:?}", context.languages());
        Ok(MANUAL_PATCHES
            .iter()
            .map(|p| {
                p.replace("{languages}", &languages)
                    .replace("{platform}", context.platform())
            })
            .collect())
    }
}

/// Loads evasion scripts exported to a directory (one `.js` file per patch).
#[derive(Debug, Clone)]
pub struct ScriptDirEvasion {
    dir: PathBuf,
}

impl ScriptDirEvasion {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl EvasionProvider for ScriptDirEvasion {
    fn name(&self) -> &str {
        "script-dir"
    }

    fn patches(&self, _context: &FingerprintContext) -> Result<Vec<String>, EvasionError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            EvasionError::Unavailable(format!("{}: {}", self.dir.display(), e))
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "js"))
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(EvasionError::Unavailable(format!(
                "no .js files in {}",
                self.dir.display()
            )));
        }

        paths
            .into_iter()
            .map(|path| {
                std::fs::read_to_string(&path).map_err(|source| EvasionError::Load {
                    path: path.display().to_string(),
                    source,
                })
            })
            .collect()
    }
}

/// Apply each patch with `apply`, logging failures instead of stopping.
///
/// Returns the number of patches that applied cleanly.
pub async fn apply_patches<F, Fut, E>(patches: &[String], mut apply: F) -> usize
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut applied = 0;
    for (idx, patch) in patches.iter().enumerate() {
        match apply(patch.clone()).await {
            Ok(()) => applied += 1,
            Err(e) => warn!("Evasion patch {} failed: {}", idx, e),
        }
    }
    debug!("Applied {}/{} evasion patches", applied, patches.len());
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stealth::{ContextOverrides, StealthContextFactory};
    use tempfile::tempdir;

    fn context() -> FingerprintContext {
        StealthContextFactory::new().create_context(&ContextOverrides::default())
    }

    #[test]
    fn manual_patches_are_filled_in() {
        let patches = ManualEvasion.patches(&context()).unwrap();
        assert_eq!(patches.len(), MANUAL_PATCHES.len());
        assert!(patches.iter().all(|p| !p.contains("{platform}")));
        assert!(patches.iter().all(|p| !p.contains("{languages}")));
    }

    #[test]
    fn script_dir_unavailable_when_missing_or_empty() {
        let missing = ScriptDirEvasion::new("/nonexistent/evasions");
        assert!(matches!(
            missing.patches(&context()),
            Err(EvasionError::Unavailable(_))
        ));

        let dir = tempdir().unwrap();
        let empty = ScriptDirEvasion::new(dir.path());
        assert!(empty.patches(&context()).is_err());

        std::fs::write(dir.path().join("b.js"), "b()").unwrap();
        std::fs::write(dir.path().join("a.js"), "a()").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip").unwrap();
        let patches = empty.patches(&context()).unwrap();
        assert_eq!(patches, vec!["a()".to_string(), "b()".to_string()]);
    }

    #[tokio::test]
    async fn failing_patches_are_skipped() {
        let patches = vec!["ok".to_string(), "bad".to_string(), "ok".to_string()];
        let applied = apply_patches(&patches, |p| async move {
            if p == "bad" {
                Err("syntax error")
            } else {
                Ok(())
            }
        })
        .await;
        assert_eq!(applied, 2);
    }
}
