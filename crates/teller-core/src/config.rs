//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the
//! backend base URL, session and request timeouts, the storage namespace
//! used for persisted session state, and the authentication protocol.
//!
//! Configuration is stored at `~/.config/teller/config.json` and can be
//! overridden per-process with `TELLER_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "teller";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_BASE_URL: &str = "http://localhost:3000/";

/// Idle sessions are torn down after 10 minutes.
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 600;

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_NAMESPACE: &str = "default";

/// Which credential exchange the backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthProtocol {
    /// `POST /auth` exchanges username/password for a bearer token.
    #[default]
    Token,
    /// Every request carries `Basic base64(user:pass)`.
    Basic,
}

impl std::str::FromStr for AuthProtocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "token" | "bearer" => Ok(Self::Token),
            "basic" => Ok(Self::Basic),
            other => Err(format!("unknown auth protocol: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub session_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub storage_namespace: String,
    pub auth_protocol: AuthProtocol,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            storage_namespace: DEFAULT_NAMESPACE.to_string(),
            auth_protocol: AuthProtocol::default(),
        }
    }
}

impl Config {
    /// Load config from disk (or defaults) and apply `TELLER_*` overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from an environment-like lookup.
    /// Unparseable values are skipped so a typo never wipes a setting.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TELLER_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        if let Some(secs) = parse_override(&lookup, "TELLER_SESSION_TIMEOUT_SECS") {
            self.session_timeout_secs = secs;
        }
        if let Some(secs) = parse_override(&lookup, "TELLER_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = secs;
        }
        if let Some(ns) = lookup("TELLER_STORAGE_NAMESPACE").filter(|v| !v.trim().is_empty()) {
            self.storage_namespace = ns.trim().to_string();
        }
        if let Some(protocol) = parse_override(&lookup, "TELLER_AUTH_PROTOCOL") {
            self.auth_protocol = protocol;
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding persisted session state for this namespace
    pub fn session_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join(&self.storage_namespace))
    }
}

fn parse_override<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = key, value = %raw, "Ignoring unparseable config override");
            None
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
