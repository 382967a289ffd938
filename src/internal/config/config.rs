use std::collections::HashMap;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::internal::transport::{ReconnectPolicy, ServerSpec, TransportOptions};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version information
pub fn get_version_info() -> String {
    let build_timestamp = option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown");
    let rustc_semver = option_env!("VERGEN_RUSTC_SEMVER").unwrap_or("unknown");
    let cargo_target_triple = option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown");

    format!(
        "mcp-hub version {}\nBuilt: {}\nRust: {}\nTarget: {}",
        VERSION, build_timestamp, rustc_semver, cargo_target_triple
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Logical server id -> how to launch it.
    #[serde(default)]
    pub servers: HashMap<String, ServerSpec>,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default = "default_true")]
    pub append_to_file: bool,
    #[serde(default)]
    pub disable_console: bool,
    #[serde(default)]
    pub color: bool,
}

fn default_max_message_size() -> usize {
    4 * 1024 * 1024
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_kill_grace_ms() -> u64 {
    3_000
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_multiplier() -> f64 {
    1.5
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            request_timeout_ms: default_request_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output_path: None,
            append_to_file: default_true(),
            disable_console: false,
            color: false,
        }
    }
}

impl TransportSettings {
    pub fn to_options(&self) -> TransportOptions {
        TransportOptions {
            max_message_size: self.max_message_size,
            kill_grace: Duration::from_millis(self.kill_grace_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ReconnectSettings {
    pub fn to_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

impl AppConfig {
    /// Load from an explicit file, or the default search locations, plus
    /// `MCP_HUB__*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(File::with_name(path));
            }
            None => {
                builder = builder
                    .add_source(File::with_name("mcp-hub").required(false))
                    .add_source(File::with_name("/etc/mcp-hub/config").required(false));
            }
        }
        builder = builder.add_source(Environment::with_prefix("MCP_HUB").separator("__"));
        builder.build()?.try_deserialize()
    }
}
