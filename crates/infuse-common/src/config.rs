//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for
//! deployment. Config precedence: env vars > .env file > config.toml > defaults.

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG
        .get()
        .expect("Config not initialized. Call infuse_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code
/// accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("bus.group", "224.1.1.1")?
        .set_default("bus.port", 8751)?
        .set_default("transport.baud", 115_200)?
        .set_default("transport.rtt_port", 19_021)?
        .set_default("credentials.path", default_credentials_path())?
        .set_default("rpc.response_timeout_secs", 10)?
        .set_default("rpc.connect_timeout_secs", 1)?
        // Optional config file
        .add_source(config::File::with_name("infuse").required(false))
        // Environment variables (INFUSE_BUS__PORT, INFUSE_TRANSPORT__BAUD, etc.)
        .add_source(
            config::Environment::with_prefix("INFUSE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

fn default_credentials_path() -> String {
    std::env::var("HOME")
        .map(|home| format!("{home}/.infuse/credentials.toml"))
        .unwrap_or_else(|_| "credentials.toml".into())
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub bus: BusConfig,
    pub transport: TransportConfig,
    pub credentials: CredentialsConfig,
    pub rpc: RpcConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    /// Multicast group notifications are broadcast on.
    pub group: String,
    /// Multicast port; the unicast request socket binds to `port + 1`.
    pub port: u16,
}

impl BusConfig {
    pub fn multicast_addr(&self) -> (String, u16) {
        (self.group.clone(), self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    pub baud: u32,
    /// Segger RTT telnet server port on localhost.
    pub rtt_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CredentialsConfig {
    /// Path to the network credential store.
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    /// How long a client waits for an RPC response or data ACK.
    pub response_timeout_secs: u64,
    /// How long a client waits for a connection to be created.
    pub connect_timeout_secs: u64,
}
