use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub update_path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
            update_path: None,
            log_level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}


pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        return Err(ConfigError::Validation("server.port must be nonzero".into()).into());
    }
    if let Some(update_path) = &config.server.update_path
        && update_path.exists()
        && !update_path.is_dir()
    {
        return Err(ConfigError::Validation(format!(
            "server.update_path '{}' exists but is not a directory",
            update_path.display()
        ))
        .into());
    }
    match config.server.log_level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        other => {
            return Err(ConfigError::Validation(format!("unknown log_level '{other}'")).into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.log_level, "info");
        validate_config(&config).unwrap();
    }

    #[test]
    fn loads_toml_overriding_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nhost = \"0.0.0.0\"\nport = 9001\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.log_level, "info");
    }

    #[test]
    fn rejects_zero_port() {
        let config = Config {
            server: ServerConfig {
                port: 0,
                ..Default::default()
            },
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let config = Config {
            server: ServerConfig {
                log_level: "verbose".into(),
                ..Default::default()
            },
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let result = load_config(Path::new("/nonexistent/path.toml"));
        assert!(result.is_err());
    }
}
