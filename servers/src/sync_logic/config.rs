use anyhow::{Context, Result};
use clap::Parser;
use lib_sync::configs::SyncConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use super::resources::ResourceSpec;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Real-time sync agent: push, polling and cache reconciled per resource", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "SYNC_PORT", help = "Port of the HTTP status surface.")]
    pub port: Option<u16>,

    #[clap(long, env = "SYNC_CONFIG_PATH", help = "Path to the JSON5 configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SYNC_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "SYNC_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SYNC_WS_URL", help = "Push channel WebSocket URL.")]
    pub ws_url: Option<String>,

    #[clap(long, env = "SYNC_AUTH_TOKEN", help = "Bearer token for the push channel handshake.")]
    pub auth_token: Option<String>,

    #[clap(long, env = "SYNC_API_BASE_URL", help = "Base URL resource paths are fetched from.")]
    pub api_base_url: Option<String>,

    #[clap(long, env = "SYNC_API_TOKEN", help = "Bearer token for resource fetches.")]
    pub api_token: Option<String>,

    #[clap(long, env = "SYNC_REACHABILITY_ADDRESS", help = "host:port checked to detect network loss.")]
    pub reachability_address: Option<String>,

    #[clap(skip)]
    pub sync: Option<SyncConfig>,

    #[clap(skip)]
    pub resources: Option<Vec<ResourceSpec>>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            ws_url: other.ws_url.or(self.ws_url),
            auth_token: other.auth_token.or(self.auth_token),
            api_base_url: other.api_base_url.or(self.api_base_url),
            api_token: other.api_token.or(self.api_token),
            reachability_address: other.reachability_address.or(self.reachability_address),
            sync: other.sync.or(self.sync),
            resources: other.resources.or(self.resources),
        }
    }

    /// Sync layer settings with the push URL and token overrides applied.
    pub fn sync_config(&self) -> Result<SyncConfig> {
        let mut sync = self.sync.clone().unwrap_or_default();
        if let Some(url) = &self.ws_url {
            sync.transport.url = url.clone();
        }
        if self.auth_token.is_some() {
            sync.transport.auth_token = self.auth_token.clone();
        }
        sync.validate().context("invalid sync configuration")?;
        Ok(sync)
    }
}

fn defaults() -> Config {
    Config {
        port: Some(9004),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        api_base_url: Some("http://127.0.0.1:8080/api/".to_string()),
        ..Default::default()
    }
}

pub fn load_config() -> Result<Config> {
    resolve(Config::parse())
}

/// Layers defaults, the config file and the CLI/env values, later wins.
pub fn resolve(cli: Config) -> Result<Config> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("sync_agent.json5"));

    let mut current_config = defaults();

    if config_file_path.exists() {
        let config_str = fs::read_to_string(&config_file_path)
            .with_context(|| format!("failed to read config file {}", config_file_path.display()))?;
        let file_config: Config = json5::from_str(&config_str)
            .with_context(|| format!("failed to parse config file {}", config_file_path.display()))?;
        current_config = current_config.merge(file_config);
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    Ok(current_config.merge(cli))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json5");
        fs::write(
            &path,
            r#"{
                // file layer
                port: 7000,
                logLevel: "debug",
                wsUrl: "ws://file/ws",
                sync: { coordinator: { throttleWindowMs: 250 } },
                resources: [{ key: "orders", path: "orders", channel: "orders" }],
            }"#,
        )
        .unwrap();

        let cli = Config {
            config_path: Some(path),
            port: Some(7100),
            ..Default::default()
        };
        let config = resolve(cli).unwrap();

        assert_eq!(config.port, Some(7100));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.log_dir, Some(PathBuf::from("./logs")));
        assert_eq!(config.resources.as_ref().map(Vec::len), Some(1));

        let sync = config.sync_config().unwrap();
        assert_eq!(sync.transport.url, "ws://file/ws");
        assert_eq!(sync.coordinator.throttle_window_ms, 250);
        assert_eq!(sync.coordinator.fallback_interval_ms, 60_000);
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json5");
        fs::write(&path, "{ port: ").unwrap();
        let cli = Config {
            config_path: Some(path),
            ..Default::default()
        };
        assert!(resolve(cli).is_err());
    }
}
