pub mod error;
pub mod login;
pub mod store;

pub use error::StoreError;
pub use login::{LoginWatcher, LoginWatcherConfig};
pub use store::LocalStore;

use reqwest::RequestBuilder;
use reqwest::header::COOKIE;
use tracing::warn;

pub const DEFAULT_COOKIE_NAME: &str = "nz-jwt";
pub const DEFAULT_STORAGE_KEYS: [&str; 2] = ["token", "auth_token"];

/// Anything that can produce the dashboard auth token on demand.
///
/// Looked up fresh on every use so a token saved mid-session is picked up by
/// the next negotiation or reconnect.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// A fixed token (or the lack of one).
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Cookie first, then the local store keys in order.
#[derive(Debug, Clone)]
pub struct TokenLookup {
    explicit: Option<String>,
    cookie_header: Option<String>,
    cookie_name: String,
    storage_keys: Vec<String>,
    store: Option<LocalStore>,
}

impl TokenLookup {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            explicit: None,
            cookie_header: None,
            cookie_name: cookie_name.into(),
            storage_keys: DEFAULT_STORAGE_KEYS.iter().map(|k| k.to_string()).collect(),
            store: None,
        }
    }

    /// An explicit token short-circuits the cookie and store lookup.
    pub fn with_explicit(mut self, token: Option<String>) -> Self {
        self.explicit = token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        self
    }

    pub fn with_cookie_header(mut self, header: Option<String>) -> Self {
        self.cookie_header = header;
        self
    }

    /// Only the first two keys are consulted.
    pub fn with_storage_keys(mut self, keys: Vec<String>) -> Self {
        if !keys.is_empty() {
            self.storage_keys = keys.into_iter().take(2).collect();
        }
        self
    }

    pub fn with_store(mut self, store: Option<LocalStore>) -> Self {
        self.store = store;
        self
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    fn from_store(&self) -> Option<String> {
        let store = self.store.as_ref()?;
        for key in &self.storage_keys {
            match store.get(key) {
                Ok(Some(value)) => return Some(value),
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        target: "webshell::auth",
                        path = %store.path().display(),
                        key = %key,
                        error = %err,
                        "local store lookup failed, trying next key"
                    );
                    continue;
                }
            }
        }
        None
    }
}

impl TokenSource for TokenLookup {
    fn token(&self) -> Option<String> {
        if let Some(token) = &self.explicit {
            return Some(token.clone());
        }
        self.cookie_header
            .as_deref()
            .and_then(|header| cookie_value(header, &self.cookie_name))
            .or_else(|| self.from_store())
    }
}

/// Extracts a named cookie from a `Cookie:` header style string.
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key.trim() != name {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Attaches the token both as a bearer header and as the dashboard cookie.
pub fn apply_credentials(
    builder: RequestBuilder,
    token: Option<&str>,
    cookie_name: &str,
) -> RequestBuilder {
    match token {
        Some(token) => builder
            .bearer_auth(token)
            .header(COOKIE, format!("{cookie_name}={token}")),
        None => builder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_value_finds_named_cookie() {
        let header = "theme=dark; nz-jwt=abc.def.ghi ; lang=en";
        assert_eq!(cookie_value(header, "nz-jwt").as_deref(), Some("abc.def.ghi"));
        assert_eq!(cookie_value(header, "missing"), None);
        assert_eq!(cookie_value("nz-jwt=", "nz-jwt"), None);
        assert_eq!(cookie_value("nz-jwt=\"quoted\"", "nz-jwt").as_deref(), Some("quoted"));
    }

    #[test]
    fn cookie_wins_over_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::at(dir.path().join("storage.toml"));
        store.set("token", "from-store").unwrap();

        let lookup = TokenLookup::new(DEFAULT_COOKIE_NAME)
            .with_cookie_header(Some("nz-jwt=from-cookie".into()))
            .with_store(Some(store));
        assert_eq!(lookup.token().as_deref(), Some("from-cookie"));
    }

    #[test]
    fn store_keys_are_consulted_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::at(dir.path().join("storage.toml"));
        store.set("auth_token", "second").unwrap();

        let lookup = TokenLookup::new(DEFAULT_COOKIE_NAME)
            .with_cookie_header(Some("other=1".into()))
            .with_store(Some(store.clone()));
        assert_eq!(lookup.token().as_deref(), Some("second"));

        store.set("token", "first").unwrap();
        assert_eq!(lookup.token().as_deref(), Some("first"));
    }

    #[test]
    fn unreadable_first_key_falls_back_to_second() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        std::fs::write(&path, "[entries]\ntoken = [1, 2]\nauth_token = \"second\"\n").unwrap();

        let lookup = TokenLookup::new(DEFAULT_COOKIE_NAME).with_store(Some(LocalStore::at(path)));
        assert_eq!(lookup.token().as_deref(), Some("second"));
    }

    #[test]
    fn absent_everywhere_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let lookup = TokenLookup::new(DEFAULT_COOKIE_NAME)
            .with_store(Some(LocalStore::at(dir.path().join("storage.toml"))));
        assert_eq!(lookup.token(), None);
    }

    #[test]
    fn explicit_token_overrides_lookup() {
        let lookup = TokenLookup::new(DEFAULT_COOKIE_NAME)
            .with_cookie_header(Some("nz-jwt=cookie".into()))
            .with_explicit(Some(" explicit ".into()));
        assert_eq!(lookup.token().as_deref(), Some("explicit"));
    }

    #[test]
    fn only_two_storage_keys_are_kept() {
        let lookup = TokenLookup::new("c").with_storage_keys(vec![
            "a".into(),
            "b".into(),
            "c".into(),
        ]);
        assert_eq!(lookup.storage_keys, vec!["a".to_string(), "b".to_string()]);
    }
}
