use std::env;
#[cfg(test)]
use std::sync::Mutex;
use url::Url;

pub const DEFAULT_ORIGIN: &str = "127.0.0.1:8008";
pub const ORIGIN_ENV: &str = "WEBSHELL_ORIGIN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("dashboard origin cannot be empty")]
    EmptyOrigin,
    #[error("invalid dashboard origin '{raw}': {reason}")]
    InvalidOrigin { raw: String, reason: String },
}

/// Where the dashboard lives. Everything the client talks to (session
/// endpoint, profile polling, terminal sockets) hangs off this origin.
#[derive(Debug, Clone)]
pub struct Config {
    pub origin: Url,
}

impl Config {
    /// Reads `WEBSHELL_ORIGIN`, falling back to the local dashboard default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = env::var(ORIGIN_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_ORIGIN.to_string());
        Self::with_origin(&raw)
    }

    pub fn with_origin(raw: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            origin: parse_origin(raw)?,
        })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }
}

/// Parses an origin, inferring `http://` for local and private hosts and
/// `https://` otherwise. Any path, query or fragment is discarded.
pub fn parse_origin(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyOrigin);
    }
    // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS.
    let normalized = if trimmed.starts_with("localhost:") || trimmed == "localhost" {
        trimmed.replacen("localhost", "127.0.0.1", 1)
    } else {
        trimmed.to_string()
    };
    let with_scheme = if normalized.contains("://") {
        normalized
    } else {
        format!("{}{normalized}", infer_scheme(&normalized))
    };
    let mut url = Url::parse(&with_scheme).map_err(|err| ConfigError::InvalidOrigin {
        raw: raw.to_string(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidOrigin {
            raw: raw.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidOrigin {
            raw: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower.starts_with("0.0.0.0")
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || host_lower
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .map(|octet| (16..32).contains(&octet))
            .unwrap_or(false)
    {
        "http://"
    } else {
        "https://"
    }
}
