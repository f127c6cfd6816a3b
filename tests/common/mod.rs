//! Fake LibDib-style portal served by axum on a random local port.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Form, Query, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{AppendHeaders, Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use shelfsync::config::Config;
use shelfsync::http::ExecutorConfig;

pub const EMAIL: &str = "buyer@example.com";
pub const PASSWORD: &str = "correct-horse";

/// How the API endpoints answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    /// Every API call is 401, even with a fresh session.
    Unauthorized,
    /// Product listings are 403.
    Forbidden,
}

pub struct PortalState {
    catalog: Vec<(String, u64)>,
    pub mode: Mutex<Mode>,
    session: Mutex<Option<String>>,
    pub logins: AtomicUsize,
    pub category_hits: AtomicUsize,
    pub product_hits: AtomicUsize,
    /// Product requests from this hit number on never answer.
    pub hang_from: Mutex<Option<usize>>,
    /// Row numbers served without a `name`.
    pub unnamed: Mutex<Vec<u64>>,
    /// `(category, offset)` of every product request, in arrival order.
    pub requests: Mutex<Vec<(String, u64)>>,
}

impl PortalState {
    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn requests(&self) -> Vec<(String, u64)> {
        self.requests.lock().unwrap().clone()
    }

    fn mode(&self) -> Mode {
        *self.mode.lock().unwrap()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(current) = self.session.lock().unwrap().clone() else {
            return false;
        };
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .any(|(name, value)| name == "sessionid" && value == current)
    }
}

const LOGIN_PAGE: &str = r#"<html><body>
<form method="post" action="/accounts/login/">
  <input type="hidden" name="csrfmiddlewaretoken" value="form-token">
  <input name="email">
  <input type="password" name="password">
</form>
</body></html>"#;

async fn login_page() -> Html<&'static str> {
    Html(LOGIN_PAGE)
}

async fn login_submit(
    State(state): State<Arc<PortalState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let valid = form.get("email").map(|s| s.as_str()) == Some(EMAIL)
        && form.get("password").map(|s| s.as_str()) == Some(PASSWORD)
        && form.get("csrfmiddlewaretoken").map(|s| s.as_str()) == Some("form-token");
    if !valid {
        return (StatusCode::FORBIDDEN, "bad credentials").into_response();
    }

    let n = state.logins.fetch_add(1, Ordering::SeqCst) + 1;
    let session = format!("session-{}", n);
    *state.session.lock().unwrap() = Some(session.clone());
    (
        AppendHeaders([
            (SET_COOKIE, format!("sessionid={}; Path=/", session)),
            (SET_COOKIE, format!("csrftoken=csrf-{}; Path=/", n)),
        ]),
        "welcome",
    )
        .into_response()
}

async fn categories(State(state): State<Arc<PortalState>>, headers: HeaderMap) -> Response {
    state.category_hits.fetch_add(1, Ordering::SeqCst);
    if state.mode() == Mode::Unauthorized || !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let results: Vec<_> = state
        .catalog
        .iter()
        .map(|(slug, _)| json!({"slug": slug, "name": slug.to_uppercase()}))
        .collect();
    Json(json!({"count": results.len(), "results": results})).into_response()
}

async fn products(
    State(state): State<Arc<PortalState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let hit = state.product_hits.fetch_add(1, Ordering::SeqCst) + 1;
    let category = params.get("category").cloned().unwrap_or_default();
    let limit: u64 = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(50);
    let offset: u64 = params.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    state
        .requests
        .lock()
        .unwrap()
        .push((category.clone(), offset));

    let hang_from = *state.hang_from.lock().unwrap();
    if hang_from.is_some_and(|from| hit >= from) {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }

    match state.mode() {
        Mode::Unauthorized => return StatusCode::UNAUTHORIZED.into_response(),
        Mode::Forbidden => return StatusCode::FORBIDDEN.into_response(),
        Mode::Normal => {}
    }
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let total = state
        .catalog
        .iter()
        .find(|(slug, _)| *slug == category)
        .map(|(_, n)| *n)
        .unwrap_or(0);
    let end = (offset + limit).min(total);
    let unnamed = state.unnamed.lock().unwrap().clone();
    let results: Vec<_> = (offset.min(end)..end)
        .map(|i| {
            if unnamed.contains(&i) {
                return json!({"id": format!("{}-{}", category, i), "wholesale_price": "9.00"});
            }
            json!({
                "id": format!("{}-{}", category, i),
                "name": format!("{}{:03}", category, i),
                "brand": {"id": 1, "name": "Estate"},
                "wholesale_price": format!("{}.50", 10 + i % 7),
                "inventory_quantity": (i % 4) * 6,
                "in_stock": i % 4 != 0
            })
        })
        .collect();
    Json(json!({"count": total, "results": results})).into_response()
}

/// Start a portal with `catalog[i] = (category, item count)`.
pub async fn spawn_portal(catalog: &[(&str, u64)]) -> (String, Arc<PortalState>) {
    let state = Arc::new(PortalState {
        catalog: catalog.iter().map(|(c, n)| (c.to_string(), *n)).collect(),
        mode: Mutex::new(Mode::Normal),
        session: Mutex::new(None),
        logins: AtomicUsize::new(0),
        category_hits: AtomicUsize::new(0),
        product_hits: AtomicUsize::new(0),
        hang_from: Mutex::new(None),
        unnamed: Mutex::new(Vec::new()),
        requests: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/accounts/login/", get(login_page).post(login_submit))
        .route("/api/v1/categories/", get(categories))
        .route("/api/v1/products/", get(products))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), state)
}

/// Executor settings that keep tests fast.
pub fn fast_executor() -> ExecutorConfig {
    ExecutorConfig {
        base_delay_ms: 0,
        jitter_ratio: 0.0,
        max_retries: 1,
        backoff_base_ms: 10,
        max_delay_ms: 50,
        timeout_secs: 10,
        cache_ttl_secs: 0,
    }
}

/// Config with one `libdib` distributor pointed at `base_url`.
pub fn libdib_config(base_url: &str, daily_limit: u64, page_size: u64) -> Config {
    let toml = format!(
        r#"
[scheduler]
concurrency = 1
batch_pause_secs = 0

[distributors.libdib]
name = "LibDib"
base_url = "{base_url}"
strategy = "libdib"
login = "form"

[distributors.libdib.session]
login_path = "/accounts/login/"

[distributors.libdib.pacing]
daily_limit = {daily_limit}
page_size = {page_size}
categories_per_session = 2
"#
    );
    let mut config: Config = toml::from_str(&toml).unwrap();
    config.executor = fast_executor();
    config.validate().unwrap();
    config
}
