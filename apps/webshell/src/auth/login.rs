use crate::auth::{TokenSource, apply_credentials};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, trace, warn};
use url::Url;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct LoginWatcherConfig {
    pub origin: Url,
    pub cookie_name: String,
    pub poll_interval: Duration,
    pub refresh_interval: Duration,
}

impl LoginWatcherConfig {
    pub fn new(origin: Url, cookie_name: impl Into<String>) -> Self {
        Self {
            origin,
            cookie_name: cookie_name.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProfileEnvelope {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Polls the dashboard profile endpoint and publishes "is the user logged
/// in" on a watch channel. Also keeps the session token fresh by hitting the
/// refresh endpoint at most once per refresh interval.
pub struct LoginWatcher {
    client: reqwest::Client,
    config: LoginWatcherConfig,
    tokens: Arc<dyn TokenSource>,
    last_refresh: Option<Instant>,
}

impl LoginWatcher {
    pub fn new(
        config: LoginWatcherConfig,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self {
            client,
            config,
            tokens,
            last_refresh: None,
        })
    }

    /// A signal that is always "logged in", for deployments that have no
    /// profile endpoint.
    pub fn assume_logged_in() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(true);
        rx
    }

    /// Runs one poll before returning so the first reading is real, then
    /// keeps polling in the background until the returned task is aborted or
    /// every receiver is dropped.
    pub async fn spawn(mut self) -> (watch::Receiver<bool>, JoinHandle<()>) {
        let initial = self.poll_once().await;
        let (tx, rx) = watch::channel(initial);
        let task = tokio::spawn(async move {
            let mut ticker = interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately and the initial poll
            // already happened.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let logged_in = self.poll_once().await;
                if tx.send(logged_in).is_err() {
                    break;
                }
            }
        });
        (rx, task)
    }

    pub async fn poll_once(&mut self) -> bool {
        let token = self.tokens.token();
        let profile_ok = match self.fetch_profile(token.as_deref()).await {
            Ok(has_id) => has_id,
            Err(err) => {
                debug!(target: "webshell::auth", error = %err, "profile poll failed");
                false
            }
        };

        if profile_ok && token.is_some() {
            self.maybe_refresh(token.as_deref()).await;
        }
        trace!(
            target: "webshell::auth",
            profile_ok,
            token_present = token.is_some(),
            "login status polled"
        );
        profile_ok && token.is_some()
    }

    async fn fetch_profile(&self, token: Option<&str>) -> Result<bool, String> {
        let endpoint = self
            .config
            .origin
            .join("api/v1/profile")
            .map_err(|err| err.to_string())?;
        let builder = apply_credentials(self.client.get(endpoint), token, &self.config.cookie_name);
        let response = builder.send().await.map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!("unexpected http status {}", response.status()));
        }
        let envelope = response
            .json::<ProfileEnvelope>()
            .await
            .map_err(|err| err.to_string())?;
        if let Some(error) = envelope.error.filter(|e| !e.is_empty()) {
            return Err(error);
        }
        Ok(profile_has_id(envelope.data.as_ref()))
    }

    async fn maybe_refresh(&mut self, token: Option<&str>) {
        let now = Instant::now();
        let due = self
            .last_refresh
            .map(|at| now.duration_since(at) > self.config.refresh_interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_refresh = Some(now);

        let endpoint = match self.config.origin.join("api/v1/refresh-token") {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(target: "webshell::auth", error = %err, "invalid refresh endpoint");
                return;
            }
        };
        let builder = apply_credentials(self.client.get(endpoint), token, &self.config.cookie_name);
        match builder.send().await {
            Ok(response) => {
                debug!(target: "webshell::auth", status = %response.status(), "token refresh requested");
            }
            Err(err) => {
                warn!(target: "webshell::auth", error = %err, "token refresh failed");
            }
        }
    }
}

fn profile_has_id(data: Option<&Value>) -> bool {
    match data.and_then(|data| data.get("id")) {
        Some(Value::Number(n)) => n.as_u64().map(|id| id != 0).unwrap_or(true),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    #[test]
    fn profile_id_detection() {
        assert!(profile_has_id(Some(&json!({ "id": 7 }))));
        assert!(profile_has_id(Some(&json!({ "id": "u-1" }))));
        assert!(!profile_has_id(Some(&json!({ "id": 0 }))));
        assert!(!profile_has_id(Some(&json!({ "username": "x" }))));
        assert!(!profile_has_id(None));
    }

    #[derive(Clone, Default)]
    struct Counters {
        profile: Arc<AtomicUsize>,
        refresh: Arc<AtomicUsize>,
    }

    async fn profile(State(counters): State<Counters>, headers: HeaderMap) -> impl IntoResponse {
        counters.profile.fetch_add(1, Ordering::SeqCst);
        let authed = headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("nz-jwt=good"))
            .unwrap_or(false);
        if authed {
            (StatusCode::OK, axum::Json(json!({ "success": true, "data": { "id": 1 } })))
        } else {
            (
                StatusCode::OK,
                axum::Json(json!({ "success": false, "error": "ApiErrorUnauthorized" })),
            )
        }
    }

    async fn refresh(State(counters): State<Counters>) -> impl IntoResponse {
        counters.refresh.fetch_add(1, Ordering::SeqCst);
        axum::Json(json!({ "success": true }))
    }

    async fn serve(counters: Counters) -> Url {
        let router = Router::new()
            .route("/api/v1/profile", get(profile))
            .route("/api/v1/refresh-token", get(refresh))
            .with_state(counters);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn logged_in_with_valid_token_and_refreshes_once() {
        let counters = Counters::default();
        let origin = serve(counters.clone()).await;
        let mut watcher = LoginWatcher::new(
            LoginWatcherConfig::new(origin, "nz-jwt"),
            Arc::new(StaticToken(Some("good".into()))),
        )
        .unwrap();

        assert!(watcher.poll_once().await);
        assert!(watcher.poll_once().await);
        assert_eq!(counters.profile.load(Ordering::SeqCst), 2);
        assert_eq!(counters.refresh.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn rejected_profile_or_missing_token_is_logged_out() {
        let counters = Counters::default();
        let origin = serve(counters.clone()).await;

        let mut bad = LoginWatcher::new(
            LoginWatcherConfig::new(origin.clone(), "nz-jwt"),
            Arc::new(StaticToken(Some("bad".into()))),
        )
        .unwrap();
        assert!(!bad.poll_once().await);

        let mut none = LoginWatcher::new(
            LoginWatcherConfig::new(origin, "nz-jwt"),
            Arc::new(StaticToken(None)),
        )
        .unwrap();
        assert!(!none.poll_once().await);
        assert_eq!(counters.refresh.load(Ordering::SeqCst), 0);
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn unreachable_dashboard_is_logged_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let origin = Url::parse(&format!("http://{addr}/")).unwrap();
        let watcher = LoginWatcher::new(
            LoginWatcherConfig::new(origin, "nz-jwt"),
            Arc::new(StaticToken(Some("good".into()))),
        )
        .unwrap();
        let (rx, task) = watcher.spawn().await;
        assert!(!*rx.borrow());
        task.abort();
    }

    #[test]
    fn assumed_login_is_true() {
        assert!(*LoginWatcher::assume_logged_in().borrow());
    }
}
