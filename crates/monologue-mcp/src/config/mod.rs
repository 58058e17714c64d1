//! Configuration loading and resolution.

pub mod loader;

pub use loader::{
    load_config, AuthConfig, DnsRebindingConfig, LlmConfig, ServerConfig, ADDR_ENV_VAR,
};
