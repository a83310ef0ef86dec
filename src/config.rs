//! A1: `KmeConfig` — static, read-only-after-startup deployment
//! configuration.
//!
//! Mirrors the `[general]` / per-entity-table layout of this codebase's
//! `qkd_config.toml` client configuration, but scoped to what a KME server
//! instance itself needs.

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "failed to read configuration file: {msg}"),
            ConfigError::Parse(msg) => write!(f, "failed to parse configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Deserialize)]
pub struct KmeConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub trusted_proxy: Option<TrustedProxyConfig>,
    #[serde(default)]
    pub extension_registry: Vec<ExtensionBinding>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub kme_id: String,
    pub target_kme_id: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_key_size")]
    pub default_key_size: u32,
    #[serde(default = "default_min_key_size")]
    pub min_key_size: u32,
    #[serde(default = "default_max_key_size")]
    pub max_key_size: u32,
    #[serde(default = "default_max_key_per_request")]
    pub max_key_per_request: u32,
    #[serde(default = "default_max_key_count")]
    pub max_key_count: usize,
    #[serde(default)]
    pub max_sae_id_count: u32,
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub client_ca: String,
    #[serde(default)]
    pub san_pattern: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrustedProxyConfig {
    pub header: String,
    pub proxy_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionBinding {
    pub extension_type: String,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}
fn default_key_size() -> u32 {
    256
}
fn default_min_key_size() -> u32 {
    64
}
fn default_max_key_size() -> u32 {
    1024
}
fn default_max_key_per_request() -> u32 {
    128
}
fn default_max_key_count() -> usize {
    100_000
}
fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}
fn default_request_timeout_ms() -> u64 {
    5_000
}

impl KmeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
