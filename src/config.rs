use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Application configuration loaded from environment variables.
///
/// Everything has a local-first default; the tool runs with no environment
/// at all.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_path: PathBuf,

    // Web Server
    pub web_host: String,
    pub web_port: u16,

    // Logging
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable is set but unparseable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_path: PathBuf::from(env_or_default("DATABASE_PATH", "./data/insight.sqlite")),
            web_host: env_or_default("WEB_HOST", "127.0.0.1"),
            web_port: parse_env_u16("WEB_PORT", 8337)?,
            log_json: parse_env_bool("LOG_JSON", false)?,
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.web_port == 0 {
            return Err(ConfigError::InvalidValue {
                name: "WEB_PORT".to_string(),
                message: "cannot be 0".to_string(),
            });
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "DATABASE_PATH".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u16(name: &str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_env_bool("NONEXISTENT_VAR", true).unwrap());
        assert!(!parse_env_bool("NONEXISTENT_VAR", false).unwrap());
    }

    #[test]
    fn test_defaults_validate() {
        let config = Config {
            database_path: PathBuf::from("./data/insight.sqlite"),
            web_host: "127.0.0.1".to_string(),
            web_port: 8337,
            log_json: false,
        };
        assert!(config.validate().is_ok());
    }
}
