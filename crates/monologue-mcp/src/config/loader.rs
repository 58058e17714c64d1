//! TOML configuration with defaults for every field.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[cfg(feature = "sse")]
use crate::transport::SseTransportOptions;
use crate::transport::MAXIMUM_MESSAGE_SIZE;
use crate::types::{McpError, McpResult};

/// Environment variable overriding the listen address.
pub const ADDR_ENV_VAR: &str = "MONOLOGUE_MCP_ADDR";

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub addr: String,
    /// Route that opens an event stream.
    pub sse_path: String,
    /// Route that receives POSTed messages; advertised in the endpoint frame.
    pub message_path: String,
    /// Interval between `: keepalive` comments.
    pub keepalive_secs: u64,
    /// Largest accepted POST body in bytes.
    pub max_message_size: usize,
    /// Default timeout for requests the server sends.
    pub request_timeout_ms: u64,
    /// Returned to clients from `initialize`.
    pub instructions: Option<String>,
    pub dns_rebinding: DnsRebindingConfig,
    pub auth: AuthConfig,
    pub llm: LlmConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3000".to_string(),
            sse_path: "/sse".to_string(),
            message_path: "/messages".to_string(),
            keepalive_secs: 30,
            max_message_size: MAXIMUM_MESSAGE_SIZE,
            request_timeout_ms: 60_000,
            instructions: None,
            dns_rebinding: DnsRebindingConfig::default(),
            auth: AuthConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Options for each SSE session's transport.
    #[cfg(feature = "sse")]
    pub fn transport_options(&self) -> SseTransportOptions {
        SseTransportOptions {
            allowed_hosts: self.dns_rebinding.allowed_hosts.clone(),
            allowed_origins: self.dns_rebinding.allowed_origins.clone(),
            enable_dns_rebinding_protection: self.dns_rebinding.enabled,
            max_message_size: self.max_message_size,
        }
    }
}

/// Host/Origin allow-lists for POSTed messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsRebindingConfig {
    pub enabled: bool,
    pub allowed_hosts: Vec<String>,
    pub allowed_origins: Vec<String>,
}

/// Bearer-token check on the HTTP routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Environment variable holding the expected token. Unset or empty
    /// disables the check.
    pub api_key_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key_env: "MCP_API_KEY".to_string(),
        }
    }
}

impl AuthConfig {
    /// The expected bearer token, when one is configured.
    pub fn resolve_token(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
    }
}

/// Model settings for the monologue tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Environment variable holding the provider API key.
    pub api_key_env: String,
    pub base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-opus-4-20250514".to_string(),
            max_tokens: 32_000,
            temperature: 1.0,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: crate::llm::anthropic::DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Load configuration from `path`, or defaults when no path is given.
///
/// `MONOLOGUE_MCP_ADDR` overrides the listen address either way.
pub fn load_config(path: Option<&str>) -> McpResult<ServerConfig> {
    let mut config = match path {
        Some(path) => read_config_file(Path::new(path))?,
        None => ServerConfig::default(),
    };

    if let Ok(addr) = std::env::var(ADDR_ENV_VAR) {
        if !addr.trim().is_empty() {
            tracing::debug!("Listen address overridden by {ADDR_ENV_VAR}: {addr}");
            config.addr = addr;
        }
    }
    Ok(config)
}

fn read_config_file(path: &Path) -> McpResult<ServerConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        McpError::Config(format!("Failed to read config {}: {e}", path.display()))
    })?;
    let config: ServerConfig = toml::from_str(&content).map_err(|e| {
        McpError::Config(format!("Failed to parse config {}: {e}", path.display()))
    })?;
    tracing::info!("Loaded configuration from {}", path.display());
    Ok(config)
}
