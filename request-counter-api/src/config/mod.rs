use std::{fmt::Display, path::PathBuf};

use serde::Deserialize;

fn default_window_seconds() -> u64 {
    60
}

fn default_flush_interval_seconds() -> u64 {
    30
}

fn default_shutdown_grace_seconds() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub port: u16,
    pub counter_file: PathBuf,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Counter file path is empty")]
    EmptyCounterFile,
}

impl AppConfig {
    // An env var that is set but empty still deserializes, so the emptiness
    // check has to be explicit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.counter_file.as_os_str().is_empty() {
            return Err(ConfigError::EmptyCounterFile);
        }

        Ok(())
    }
}

impl Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(
            format!(
                "{{port: \"{}\", counter_file: \"{}\", window_seconds: \"{}\", flush_interval_seconds: \"{}\", shutdown_grace_seconds: \"{}\"}}",
                self.port,
                self.counter_file.display(),
                self.window_seconds,
                self.flush_interval_seconds,
                self.shutdown_grace_seconds,
            )
            .as_str(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_file(counter_file: &str) -> AppConfig {
        AppConfig {
            port: 8080,
            counter_file: PathBuf::from(counter_file),
            window_seconds: default_window_seconds(),
            flush_interval_seconds: default_flush_interval_seconds(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }

    #[test]
    fn it_rejects_empty_counter_file() {
        let err = config_with_file("").validate().unwrap_err();

        assert!(matches!(err, ConfigError::EmptyCounterFile));
    }

    #[test]
    fn it_accepts_non_empty_counter_file() {
        config_with_file("/var/lib/counter.db")
            .validate()
            .expect("config must be valid");
    }
}
