//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "CHATR_";

/// Dotenv file read from the working directory
pub const DOTENV_FILE: &str = ".env";

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration: defaults, then the file if it exists, then the
    /// environment. CLI overrides are applied by the caller.
    ///
    /// Environment values come from the process first and from `.env`
    /// second; `.env` never overrides a variable that is already set.
    pub fn load(path: &Path) -> Result<Config> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            tracing::debug!("Config file {} not found, using defaults", path.display());
            Config::default()
        };

        let dotenv = Self::read_dotenv(Path::new(DOTENV_FILE));
        Self::apply_env_overrides(&mut config, |key| {
            std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    /// Read `KEY=value` pairs from a dotenv file without touching the
    /// process environment. A missing file yields nothing; an unreadable
    /// file or malformed line is logged and skipped.
    pub fn read_dotenv(path: &Path) -> HashMap<String, String> {
        match dotenvy::from_path_iter(path) {
            Ok(iter) => iter
                .filter_map(|item| match item {
                    Ok(pair) => Some(pair),
                    Err(e) => {
                        tracing::warn!("Skipping malformed entry in {}: {}", path.display(), e);
                        None
                    }
                })
                .collect(),
            Err(e) if e.not_found() => HashMap::new(),
            Err(e) => {
                tracing::warn!("Unable to load {}: {}", path.display(), e);
                HashMap::new()
            }
        }
    }

    /// Apply environment overrides. `lookup` resolves a variable name to
    /// its value so callers can substitute the process environment.
    ///
    /// Every setting is read from its `CHATR_*` name. Host, port and
    /// username also fall back to the bare `HOST`, `PORT` and `USERNAME`.
    pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };
        let shared_var = |name: &str| {
            var(name).or_else(|| lookup(name).map(|value| (name.to_string(), value)))
        };

        if let Some((_, host)) = shared_var("HOST") {
            config.server.host = host.clone();
            config.client.host = host;
        }

        if let Some((key, port)) = shared_var("PORT") {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid {}: {}", key, port))?;
            config.server.port = port;
            config.client.port = port;
        }

        if let Some((_, username)) = shared_var("USERNAME") {
            config.client.username = username;
        }

        if let Some((key, timeout)) = var("IDLE_TIMEOUT") {
            config.server.idle_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {}: {}", key, timeout))?;
        }

        if let Some((key, addr)) = var("METRICS_ADDR") {
            let addr = addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid {}: {}", key, addr))?;
            config.monitoring.metrics_addr = Some(addr);
        }

        if let Some((_, log_level)) = var("LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        Ok(())
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_client_config()
            .with_context(|| "Client configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            bail!("server.host must not be empty");
        }

        if self.server.idle_timeout.is_zero() {
            bail!("idle_timeout must be greater than 0");
        }

        if self.server.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_client_config(&self) -> Result<()> {
        if self.client.host.trim().is_empty() {
            bail!("client.host must not be empty");
        }

        Ok(())
    }

    /// Checks that only apply when dialing out. Port 0 is a valid bind port
    /// for the server but cannot be dialed.
    pub fn validate_client_target(&self) -> Result<()> {
        if self.client.port == 0 {
            bail!("client.port must be greater than 0");
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!("monitoring.log_level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge server subcommand arguments
    pub fn merge_server_args(
        &mut self,
        host: Option<&str>,
        port: Option<u16>,
        idle_timeout: Option<Duration>,
        metrics_addr: Option<SocketAddr>,
    ) {
        if let Some(host) = host {
            self.server.host = host.to_string();
            tracing::info!("CLI override: server host set to {}", host);
        }

        if let Some(port) = port {
            self.server.port = port;
            tracing::info!("CLI override: server port set to {}", port);
        }

        if let Some(timeout) = idle_timeout {
            self.server.idle_timeout = timeout;
            tracing::info!("CLI override: idle timeout set to {:?}", timeout);
        }

        if let Some(addr) = metrics_addr {
            self.monitoring.metrics_addr = Some(addr);
            tracing::info!("CLI override: metrics address set to {}", addr);
        }
    }

    /// Merge client subcommand arguments
    pub fn merge_client_args(
        &mut self,
        host: Option<&str>,
        port: Option<u16>,
        username: Option<&str>,
    ) {
        if let Some(host) = host {
            self.client.host = host.to_string();
        }

        if let Some(port) = port {
            self.client.port = port;
        }

        if let Some(username) = username {
            self.client.username = username.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.address(), "127.0.0.1:8080");
        assert_eq!(config.client.username, "Guest");
        assert_eq!(config.server.idle_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_env_overrides_apply_to_both_roles() {
        let vars = env(&[
            ("CHATR_HOST", "0.0.0.0"),
            ("CHATR_PORT", "9000"),
            ("CHATR_USERNAME", "alice"),
            ("CHATR_IDLE_TIMEOUT", "30s"),
        ]);
        let mut config = Config::default();
        ConfigManager::apply_env_overrides(&mut config, |k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.server.address(), "0.0.0.0:9000");
        assert_eq!(config.client.address(), "0.0.0.0:9000");
        assert_eq!(config.client.username, "alice");
        assert_eq!(config.server.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_env_port_is_rejected() {
        let vars = env(&[("CHATR_PORT", "not-a-port")]);
        let mut config = Config::default();
        let err = ConfigManager::apply_env_overrides(&mut config, |k| vars.get(k).cloned())
            .unwrap_err();
        assert!(err.to_string().contains("CHATR_PORT"));
    }

    #[test]
    fn test_load_from_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nport = 7000\nidle_timeout = \"5m\"\n\n[client]\nusername = \"bob\""
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.client.username, "bob");
        assert_eq!(config.monitoring.log_level, "info");
    }

    #[test]
    fn test_invalid_log_level_fails_validation() {
        let mut config = Config::default();
        config.monitoring.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config = Config::default();
        config.merge_server_args(Some("localhost"), Some(1234), Some(Duration::from_secs(5)), None);
        config.merge_client_args(None, Some(4321), Some("carol"));

        assert_eq!(config.server.address(), "localhost:1234");
        assert_eq!(config.server.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.client.address(), "127.0.0.1:4321");
        assert_eq!(config.client.username, "carol");
    }

    #[test]
    fn test_bare_names_are_accepted() {
        let vars = env(&[("HOST", "10.0.0.5"), ("PORT", "9001"), ("USERNAME", "dave")]);
        let mut config = Config::default();
        ConfigManager::apply_env_overrides(&mut config, |k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.server.address(), "10.0.0.5:9001");
        assert_eq!(config.client.address(), "10.0.0.5:9001");
        assert_eq!(config.client.username, "dave");
    }

    #[test]
    fn test_prefixed_names_win_over_bare_names() {
        let vars = env(&[("PORT", "9001"), ("CHATR_PORT", "9002"), ("USERNAME", "dave")]);
        let mut config = Config::default();
        ConfigManager::apply_env_overrides(&mut config, |k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.server.port, 9002);
        assert_eq!(config.client.username, "dave");

        let vars = env(&[("PORT", "abc")]);
        let err = ConfigManager::apply_env_overrides(&mut Config::default(), |k| vars.get(k).cloned())
            .unwrap_err();
        assert!(err.to_string().contains("Invalid PORT"));
    }

    #[test]
    fn test_dotenv_file_feeds_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# local settings\nPORT=9100\nUSERNAME=erin\nCHATR_IDLE_TIMEOUT=45s").unwrap();

        let dotenv = ConfigManager::read_dotenv(file.path());
        assert_eq!(dotenv.get("PORT").map(String::as_str), Some("9100"));

        // a variable already in the environment beats the file
        let process = env(&[("USERNAME", "frank")]);
        let mut config = Config::default();
        ConfigManager::apply_env_overrides(&mut config, |k| {
            process.get(k).cloned().or_else(|| dotenv.get(k).cloned())
        })
        .unwrap();

        assert_eq!(config.client.port, 9100);
        assert_eq!(config.client.username, "frank");
        assert_eq!(config.server.idle_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_missing_dotenv_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConfigManager::read_dotenv(&dir.path().join(".env")).is_empty());
    }

    #[test]
    fn test_port_zero_is_only_rejected_for_clients() {
        let vars = env(&[("CHATR_PORT", "0")]);
        let mut config = Config::default();
        ConfigManager::apply_env_overrides(&mut config, |k| vars.get(k).cloned()).unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 0);
        assert!(config.validate_client_target().is_err());
        assert!(Config::default().validate_client_target().is_ok());
    }
}
