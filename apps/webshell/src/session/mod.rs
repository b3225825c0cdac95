use crate::auth::{TokenSource, apply_credentials};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub const SESSION_ENDPOINT: &str = "api/v1/terminal";

/// A negotiated terminal grant for one monitored host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(rename = "server_id")]
    pub target_host_id: u64,
    #[serde(rename = "server_name", default)]
    pub target_host_name: String,
}

impl Session {
    /// First eight characters of the id, for status lines.
    pub fn short_id(&self) -> &str {
        match self.session_id.char_indices().nth(8) {
            Some((idx, _)) => &self.session_id[..idx],
            None => &self.session_id,
        }
    }

    /// Host name when the backend sent one, otherwise `#<id>`.
    pub fn display_name(&self) -> String {
        if self.target_host_name.trim().is_empty() {
            format!("#{}", self.target_host_id)
        } else {
            self.target_host_name.clone()
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session={} host={} ({})",
            self.short_id(),
            self.target_host_id,
            self.target_host_name
        )
    }
}

/// Whether a missing auth token is fatal before talking to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TokenPolicy {
    #[default]
    Required,
    Optional,
}

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("auth token not found, please log in")]
    MissingToken,
    #[error("not authenticated: {0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Rejected(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
}

/// Requests terminal sessions from the dashboard.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn create_session(&self, target_host_id: u64) -> Result<Session, NegotiationError>;
}

#[derive(Clone)]
pub struct SessionNegotiator {
    origin: Url,
    cookie_name: String,
    policy: TokenPolicy,
    tokens: Arc<dyn TokenSource>,
    backend: Arc<dyn SessionBackend>,
}

impl SessionNegotiator {
    pub fn new(
        origin: Url,
        cookie_name: impl Into<String>,
        policy: TokenPolicy,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, NegotiationError> {
        let backend = Arc::new(ReqwestSessionBackend::new()?);
        Ok(Self {
            origin,
            cookie_name: cookie_name.into(),
            policy,
            tokens,
            backend,
        })
    }

    #[cfg(test)]
    fn with_backend(
        origin: Url,
        policy: TokenPolicy,
        tokens: Arc<dyn TokenSource>,
        backend: Arc<dyn SessionBackend>,
    ) -> Self {
        Self {
            origin,
            cookie_name: crate::auth::DEFAULT_COOKIE_NAME.to_string(),
            policy,
            tokens,
            backend,
        }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }
}

#[async_trait]
impl Negotiator for SessionNegotiator {
    async fn create_session(&self, target_host_id: u64) -> Result<Session, NegotiationError> {
        let token = self.tokens.token();
        if token.is_none() && self.policy == TokenPolicy::Required {
            return Err(NegotiationError::MissingToken);
        }

        let endpoint = self.origin.join(SESSION_ENDPOINT).map_err(|err| {
            NegotiationError::InvalidConfig(format!("invalid session endpoint: {err}"))
        })?;
        let request = CreateSessionRequest {
            server_id: target_host_id,
        };
        let envelope = self
            .backend
            .create_session(&endpoint, token.as_deref(), &self.cookie_name, &request)
            .await?;

        debug!(
            target: "webshell::session",
            target_host_id,
            success = envelope.success,
            "session negotiation answered"
        );

        if !envelope.success {
            let message = envelope
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "failed to create terminal session".to_string());
            return Err(NegotiationError::Rejected(message));
        }

        let session = envelope
            .data
            .ok_or_else(|| NegotiationError::InvalidResponse("missing session data".into()))?;
        if session.session_id.trim().is_empty() {
            return Err(NegotiationError::InvalidResponse(
                "empty session id".into(),
            ));
        }
        if session.target_host_id != target_host_id {
            return Err(NegotiationError::InvalidResponse(format!(
                "session bound to host {} instead of {target_host_id}",
                session.target_host_id
            )));
        }

        info!(target: "webshell::session", %session, "terminal session created");
        Ok(session)
    }
}

#[async_trait]
trait SessionBackend: Send + Sync {
    async fn create_session(
        &self,
        endpoint: &Url,
        auth_token: Option<&str>,
        cookie_name: &str,
        request: &CreateSessionRequest,
    ) -> Result<SessionEnvelope, NegotiationError>;
}

struct ReqwestSessionBackend {
    client: reqwest::Client,
}

impl ReqwestSessionBackend {
    fn new() -> Result<Self, NegotiationError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SessionBackend for ReqwestSessionBackend {
    async fn create_session(
        &self,
        endpoint: &Url,
        auth_token: Option<&str>,
        cookie_name: &str,
        request: &CreateSessionRequest,
    ) -> Result<SessionEnvelope, NegotiationError> {
        let builder = apply_credentials(self.client.post(endpoint.clone()), auth_token, cookie_name);
        let response = builder.json(request).send().await?;
        let status = response.status();
        if status.is_success() {
            let body = response.text().await?;
            return serde_json::from_str::<SessionEnvelope>(&body)
                .map_err(|err| NegotiationError::InvalidResponse(err.to_string()));
        }

        // Error bodies usually still carry the envelope; prefer its message.
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<SessionEnvelope>(&body)
            .ok()
            .and_then(|envelope| envelope.error)
            .filter(|e| !e.trim().is_empty());
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(NegotiationError::Unauthenticated(
                message.unwrap_or_else(|| status.to_string()),
            ));
        }
        match message {
            Some(message) => Err(NegotiationError::Rejected(message)),
            None => Err(NegotiationError::HttpStatus(status)),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest {
    server_id: u64,
}

#[derive(Debug, Deserialize)]
struct SessionEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<Session>,
    #[serde(default)]
    error: Option<String>,
}
