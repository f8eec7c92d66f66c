use std::collections::HashMap;

/// Environment-driven configuration for [`crate::AvCheckClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvCheckSettings {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl AvCheckSettings {
    pub const API_KEY_ENV: &'static str = "AVCHECK_API_KEY";
    pub const ENDPOINT_ENV: &'static str = "AVCHECK_ENDPOINT";
    pub const TIMEOUT_ENV: &'static str = "AVCHECK_TIMEOUT_SECS";

    pub const DEFAULT_ENDPOINT: &'static str = "https://avcheck.net/vhm/api/v1";
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

    /// Settings pointing at the public service with the given key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Load settings from environment variables.
    ///
    /// * `AVCHECK_API_KEY`      — API key (validated when the client is built).
    /// * `AVCHECK_ENDPOINT`     — Optional base URL override.
    /// * `AVCHECK_TIMEOUT_SECS` — Optional request timeout in seconds.
    pub fn from_env() -> Self {
        Self::from_map(std::env::vars().collect())
    }

    fn from_map(vars: HashMap<String, String>) -> Self {
        let api_key = vars
            .get(Self::API_KEY_ENV)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let endpoint = vars
            .get(Self::ENDPOINT_ENV)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| Self::DEFAULT_ENDPOINT.to_string());
        let timeout_secs = vars
            .get(Self::TIMEOUT_ENV)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(Self::DEFAULT_TIMEOUT_SECS);

        Self {
            api_key,
            endpoint,
            timeout_secs,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

impl Default for AvCheckSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
        }
    }
}
