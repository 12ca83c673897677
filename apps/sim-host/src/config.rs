use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use frame_channel::{ChannelConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reconcile::ReconcilerSettings;

pub const ENV_PREFIX: &str = "SIM_HOST_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Address the frame bridge listens on.
    pub bridge_addr: String,
    pub frame_id: String,
    pub allowed_origins: Vec<String>,
    pub target_origin: String,
    pub host_source: String,
    pub peer_source: String,
    pub attach_retries: u32,
    pub attach_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub api_base_url: Option<String>,
    pub api_token: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub first_settle_ms: u64,
    pub second_settle_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        let channel = ChannelConfig::default();
        let settle = ReconcilerSettings::default();
        Self {
            bridge_addr: "127.0.0.1:7878".to_string(),
            frame_id: channel.default_element_id,
            allowed_origins: channel.allowed_origins,
            target_origin: channel.target_origin,
            host_source: channel.host_source,
            peer_source: channel.peer_source,
            attach_retries: channel.attach_retry.max_retries,
            attach_delay_ms: channel.attach_retry.delay.as_millis() as u64,
            request_timeout_ms: 5_000,
            api_base_url: None,
            api_token: None,
            state_dir: None,
            first_settle_ms: settle.first_settle.as_millis() as u64,
            second_settle_ms: settle.second_settle.as_millis() as u64,
        }
    }
}

impl HostConfig {
    /// Defaults, then the TOML file (explicit path, or the platform config file
    /// when it exists), then `SIM_HOST_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|path| path.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config.normalize())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "sim-host").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let var = format!("{ENV_PREFIX}{name}");
            lookup(&var)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(|value| (var, value))
        };

        if let Some((_, value)) = get("BRIDGE_ADDR") {
            self.bridge_addr = value;
        }
        if let Some((_, value)) = get("FRAME_ID") {
            self.frame_id = value;
        }
        if let Some((_, value)) = get("ALLOWED_ORIGINS") {
            self.allowed_origins = value
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect();
        }
        if let Some((_, value)) = get("TARGET_ORIGIN") {
            self.target_origin = value;
        }
        if let Some((_, value)) = get("HOST_SOURCE") {
            self.host_source = value;
        }
        if let Some((_, value)) = get("PEER_SOURCE") {
            self.peer_source = value;
        }
        if let Some((var, value)) = get("ATTACH_RETRIES") {
            self.attach_retries = parse_number(&var, &value)?;
        }
        if let Some((var, value)) = get("ATTACH_DELAY_MS") {
            self.attach_delay_ms = parse_number(&var, &value)?;
        }
        if let Some((var, value)) = get("REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse_number(&var, &value)?;
        }
        if let Some((_, value)) = get("API_BASE_URL") {
            self.api_base_url = Some(value);
        }
        if let Some((_, value)) = get("API_TOKEN") {
            self.api_token = Some(value);
        }
        if let Some((_, value)) = get("STATE_DIR") {
            self.state_dir = Some(PathBuf::from(value));
        }
        Ok(())
    }

    fn normalize(mut self) -> Self {
        self.api_base_url = normalize_opt(self.api_base_url.take());
        self.api_token = normalize_opt(self.api_token.take());
        self
    }

    /// Where the level hint file lives.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            ProjectDirs::from("", "", "sim-host")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".sim-host"))
        })
    }

    pub fn attach_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attach_retries, Duration::from_millis(self.attach_delay_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            allowed_origins: self.allowed_origins.clone(),
            target_origin: self.target_origin.clone(),
            default_element_id: self.frame_id.clone(),
            host_source: self.host_source.clone(),
            peer_source: self.peer_source.clone(),
            attach_retry: self.attach_policy(),
            ..ChannelConfig::default()
        }
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            first_settle: Duration::from_millis(self.first_settle_ms),
            second_settle: Duration::from_millis(self.second_settle_ms),
        }
    }
}

fn parse_number<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err: T::Err| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
        reason: err.to_string(),
    })
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_match_channel_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.frame_id, "robot-game-iframe");
        assert_eq!(config.attach_policy(), RetryPolicy::new(10, Duration::from_millis(200)));
        assert_eq!(config.channel_config().target_origin, "*");
        assert!(config
            .allowed_origins
            .contains(&"http://localhost:5173".to_string()));
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config: HostConfig = toml::from_str(
            r#"
            frame_id = "sim"
            peer_source = "phaser-robot-game"
            host_source = "parent-website"
            request_timeout_ms = 1500
            "#,
        )
        .unwrap();
        assert_eq!(config.frame_id, "sim");
        assert_eq!(config.request_timeout(), Duration::from_millis(1500));
        assert_eq!(config.channel_config().peer_source, "phaser-robot-game");
        assert_eq!(config.attach_retries, 10);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = HostConfig::default();
        config
            .apply_env(env(&[
                ("SIM_HOST_ALLOWED_ORIGINS", "https://a.test, https://b.test,"),
                ("SIM_HOST_ATTACH_RETRIES", "3"),
                ("SIM_HOST_API_TOKEN", "  "),
            ]))
            .unwrap();
        assert_eq!(config.allowed_origins, ["https://a.test", "https://b.test"]);
        assert_eq!(config.attach_retries, 3);
        assert_eq!(config.api_token, None);
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let mut config = HostConfig::default();
        let err = config
            .apply_env(env(&[("SIM_HOST_REQUEST_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref var, .. } if var == "SIM_HOST_REQUEST_TIMEOUT_MS"));
    }

    #[test]
    fn explicit_file_is_loaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sim-host.toml");
        std::fs::write(&path, "bridge_addr = \"0.0.0.0:9000\"\napi_base_url = \" \"\n").unwrap();
        let config = HostConfig::from_file(&path).unwrap().normalize();
        assert_eq!(config.bridge_addr, "0.0.0.0:9000");
        assert_eq!(config.api_base_url, None);
    }
}
