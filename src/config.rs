//! Runtime configuration for a connection, with environment-variable
//! overrides for the knobs an embedder most often wants to tune without
//! recompiling.

use std::{str::FromStr, time::Duration};

use thiserror::Error;

use crate::version::WaWebVersion;

/// The `{vendor, name, version}` tuple shown on the paired-devices page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Browser {
    pub vendor: String,
    pub name: String,
    pub version: String,
}

impl Default for Browser {
    fn default() -> Self {
        Self {
            vendor: "Mac OS".to_owned(),
            name: "Chrome".to_owned(),
            version: "121.0.0.0".to_owned(),
        }
    }
}

/// Tunables for one [`crate::connection`] session. Defaults match the
/// protocol's own expectations; only override what you need to.
#[derive(Debug, Clone)]
pub struct WaClientConfig {
    /// WebSocket endpoint the transport connects to.
    pub ws_url: String,
    /// TCP/TLS+WebSocket open deadline.
    pub connect_timeout: Duration,
    /// Interval between keep-alive pings once the session is active.
    pub keep_alive_interval: Duration,
    /// Default timeout applied to `query` calls that don't specify one.
    pub default_query_timeout: Duration,
    /// The `WA\x06\x05`-style wire version mixed into the Noise prologue.
    pub wire_version: (u8, u8),
    /// The WA Web version reported in the client payload.
    pub wa_web_version: WaWebVersion,
    /// Shown on the companion-devices page as the pairing device's browser.
    pub browser: Browser,
    /// Whether an embedder-facing listener should render `qr` updates to a
    /// terminal. The core itself never prints; `qr.rs::render_for_terminal`
    /// is what a `printQRInTerminal`-style listener would call.
    pub print_qr_in_terminal: bool,
    /// Optional proxy URL threaded through to the transport constructor.
    /// The core does not dial the proxy itself.
    pub agent: Option<String>,
    /// Span name used for the connection's root `tracing` span. Accepted
    /// for API compatibility with the reference client's `logger` field;
    /// this core always logs through `tracing`'s global subscriber, never
    /// through a caller-supplied logger object.
    pub logger_span: String,
}

impl Default for WaClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://web.whatsapp.com/ws/chat".to_owned(),
            connect_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(30),
            default_query_timeout: Duration::from_secs(60),
            wire_version: (6, 5),
            wa_web_version: WaWebVersion::fallback(),
            browser: Browser::default(),
            print_qr_in_terminal: false,
            agent: None,
            logger_span: "wa_core".to_owned(),
        }
    }
}

impl WaClientConfig {
    /// Loads a config starting from [`Self::default`] and applying any of
    /// `WA_WS_URL`, `WA_CONNECT_TIMEOUT_MS`, `WA_KEEP_ALIVE_INTERVAL_MS`,
    /// `WA_QUERY_TIMEOUT_MS` found in the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("WA_WS_URL") {
            config.ws_url = url;
        }

        if let Ok(raw) = std::env::var("WA_CONNECT_TIMEOUT_MS") {
            let millis = u64::from_str(&raw).map_err(|_| ConfigError::InvalidConnectTimeout(raw))?;
            config.connect_timeout = Duration::from_millis(millis);
        }

        if let Ok(raw) = std::env::var("WA_KEEP_ALIVE_INTERVAL_MS") {
            let millis = u64::from_str(&raw).map_err(|_| ConfigError::InvalidKeepAliveInterval(raw))?;
            config.keep_alive_interval = Duration::from_millis(millis);
        }

        if let Ok(raw) = std::env::var("WA_QUERY_TIMEOUT_MS") {
            let millis = u64::from_str(&raw).map_err(|_| ConfigError::InvalidQueryTimeout(raw))?;
            config.default_query_timeout = Duration::from_millis(millis);
        }

        Ok(config)
    }
}

/// Errors while loading runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid WA_CONNECT_TIMEOUT_MS value: {0}")]
    InvalidConnectTimeout(String),
    #[error("invalid WA_KEEP_ALIVE_INTERVAL_MS value: {0}")]
    InvalidKeepAliveInterval(String),
    #[error("invalid WA_QUERY_TIMEOUT_MS value: {0}")]
    InvalidQueryTimeout(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_expectations() {
        let config = WaClientConfig::default();
        assert_eq!(config.wire_version, (6, 5));
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
    }

    #[test]
    fn from_env_rejects_a_non_numeric_timeout() {
        std::env::set_var("WA_QUERY_TIMEOUT_MS", "not-a-number");
        let result = WaClientConfig::from_env();
        std::env::remove_var("WA_QUERY_TIMEOUT_MS");
        assert!(matches!(result, Err(ConfigError::InvalidQueryTimeout(_))));
    }
}
