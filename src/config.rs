//! Konfiguration für Signaling, ICE und Call-Timeouts
//!
//! Defaults entsprechen dem Verhalten des Web-Clients:
//! 10s Connect-Timeout, 30s Klingel-Timeout, Reconnect mit 1s/30s/5 Versuchen.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Standard Signaling-Server (kann über `SIGNALING_URL` überschrieben werden)
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8787";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid signaling URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

// ============================================================================
// RECONNECT POLICY
// ============================================================================

/// Exponentielles Backoff für Reconnects des Signaling-Transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Google STUN Server (kostenlos, reicht für die meisten NATs)
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallConfig {
    /// Basis-URL des Relays, `userId` wird als Query-Parameter angehängt
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub connect_timeout_ms: u64,
    /// Unbeantwortete eingehende Anrufe werden danach automatisch abgelehnt
    pub ring_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: default_ice_servers(),
            connect_timeout_ms: 10_000,
            ring_timeout_ms: 30_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl CallConfig {
    /// Defaults plus Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Lädt eine JSON-Datei; fehlende Felder bekommen Defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.signaling_endpoint()?;
        Ok(config)
    }

    /// Überschreibt Werte mit `SIGNALING_URL` und `CALL_RING_TIMEOUT_SECS`
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = std::env::var("SIGNALING_URL") {
            self.signaling_url = url;
        }

        if let Ok(raw) = std::env::var("CALL_RING_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: "CALL_RING_TIMEOUT_SECS",
                value: raw.clone(),
            })?;
            self.ring_timeout_ms = secs * 1_000;
        }

        self.signaling_endpoint()?;
        Ok(())
    }

    /// Validierte Signaling-URL (http(s) wird zu ws(s))
    pub fn signaling_endpoint(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: self.signaling_url.clone(),
            reason,
        };

        let mut url = Url::parse(&self.signaling_url).map_err(|e| invalid(e.to_string()))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        };
        if url.scheme() != scheme {
            url.set_scheme(scheme)
                .map_err(|_| invalid("cannot rewrite scheme".to_string()))?;
        }
        Ok(url)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }
}
