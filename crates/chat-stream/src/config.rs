use std::time::Duration;

use crate::errors::ConfigError;

const DEFAULT_CHAT_PATH: &str = "/pg/chat/completions";

/// Endpoint and credential configuration for [`HttpTransport`](crate::HttpTransport).
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Gateway origin, for example `https://gateway.example.com`.
    pub base_url: String,
    /// Path of the streaming chat-completion endpoint.
    pub chat_path: String,
    /// Optional bearer token. Playground sessions usually rely on cookies.
    pub api_key: Option<String>,
    /// Extra headers sent with every request (for example `New-Api-User`).
    pub headers: Vec<(String, String)>,
    /// Keep cookies set by the gateway and send them back.
    pub with_credentials: bool,
    pub connect_timeout: Duration,
    /// Whole-request timeout. Unset by default: long streams are not cut off.
    pub timeout: Option<Duration>,
}

impl GatewayConfig {
    /// Creates a config for `base_url` with default path and timeouts.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            chat_path: DEFAULT_CHAT_PATH.to_string(),
            api_key: None,
            headers: Vec::new(),
            with_credentials: true,
            connect_timeout: Duration::from_secs(30),
            timeout: None,
        }
    }

    /// Builds a config from `CHAT_STREAM_BASE_URL`, `CHAT_STREAM_API_KEY` and
    /// `CHAT_STREAM_CHAT_PATH`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("CHAT_STREAM_BASE_URL").unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(ConfigError::Missing(
                "CHAT_STREAM_BASE_URL is not set".into(),
            ));
        }
        let mut config = Self::new(base_url.trim());
        if let Ok(key) = std::env::var("CHAT_STREAM_API_KEY")
            && !key.trim().is_empty()
        {
            config.api_key = Some(key.trim().to_string());
        }
        if let Ok(path) = std::env::var("CHAT_STREAM_CHAT_PATH")
            && !path.trim().is_empty()
        {
            config.chat_path = path.trim().to_string();
        }
        config.validate()?;
        Ok(config)
    }

    /// Sets the chat-completion endpoint path.
    pub fn chat_path(mut self, path: impl Into<String>) -> Self {
        self.chat_path = path.into();
        self
    }

    /// Sets the bearer token sent as `Authorization`.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Adds a header sent with every request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Enables or disables the cookie store.
    pub fn with_credentials(mut self, enabled: bool) -> Self {
        self.with_credentials = enabled;
        self
    }

    /// Sets the TCP/TLS connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets a whole-request timeout, stream included.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let base = self.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "base_url must be an http(s) URL, got {base:?}"
            )));
        }
        if !self.chat_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "chat_path must start with '/', got {:?}",
                self.chat_path
            )));
        }
        Ok(())
    }

    pub(crate) fn chat_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.chat_path)
    }
}
