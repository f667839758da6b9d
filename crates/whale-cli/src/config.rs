use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use humantime::parse_duration;
use whale_core::retry::RetryConfig;
use whale_core::{ControllerSettings, WhaleError};

const CONFIG_PATH: &str = "~/.whale/config.toml";

/// Contents of `~/.whale/config.toml`. Every key is optional, durations use
/// humantime syntax ("2s", "5m", "1h 30m").
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub namespace: Option<String>,
    pub kubeconfig: Option<String>,
    pub poll_interval: Option<String>,
    pub ready_timeout: Option<String>,
    pub hold: Option<String>,
    pub max_attempts: Option<u32>,
    pub initial_backoff: Option<String>,
    pub max_backoff: Option<String>,
}

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub kubeconfig: Option<PathBuf>,
    pub namespace: Option<String>,
}

/// Everything a command needs to reach the cluster.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub settings: ControllerSettings,
    pub kubeconfig: Option<PathBuf>,
}

impl FileConfig {
    pub fn to_settings(&self) -> Result<ControllerSettings, WhaleError> {
        let defaults = ControllerSettings::default();
        let retry_defaults = RetryConfig::default();

        let max_attempts = self.max_attempts.unwrap_or(retry_defaults.max_attempts);
        if max_attempts == 0 {
            return Err(WhaleError::config("max-attempts must be at least 1"));
        }

        let poll_interval = duration_or("poll-interval", &self.poll_interval, defaults.poll_interval)?;
        if poll_interval.is_zero() {
            return Err(WhaleError::config("poll-interval must be greater than zero"));
        }

        Ok(ControllerSettings {
            namespace: self.namespace.clone().unwrap_or(defaults.namespace),
            poll_interval,
            ready_timeout: duration_or("ready-timeout", &self.ready_timeout, defaults.ready_timeout)?,
            hold: duration_or("hold", &self.hold, defaults.hold)?,
            retry: RetryConfig {
                max_attempts,
                initial_delay: duration_or(
                    "initial-backoff",
                    &self.initial_backoff,
                    retry_defaults.initial_delay,
                )?,
                max_delay: duration_or("max-backoff", &self.max_backoff, retry_defaults.max_delay)?,
                backoff_multiplier: retry_defaults.backoff_multiplier,
            },
        })
    }
}

impl GlobalOptions {
    /// Defaults, then the config file, then flags.
    pub fn resolve(&self) -> Result<Resolved, WhaleError> {
        let file = load_config(self.config.as_deref())?;
        let mut settings = file.to_settings()?;
        if let Some(namespace) = &self.namespace {
            settings.namespace = namespace.clone();
        }

        let kubeconfig = match (&self.kubeconfig, &file.kubeconfig) {
            (Some(path), _) => Some(path.clone()),
            (None, Some(path)) => Some(expand_tilde(path)?),
            (None, None) => None,
        };

        Ok(Resolved {
            settings,
            kubeconfig,
        })
    }
}

pub fn parse_duration_arg(field: &str, raw: &str) -> Result<Duration, WhaleError> {
    parse_duration(raw).map_err(|e| {
        WhaleError::config(format!(
            "invalid {} '{}': {}. Use formats like '30s', '5m', '1h30m'",
            field, raw, e
        ))
    })
}

fn duration_or(field: &str, raw: &Option<String>, default: Duration) -> Result<Duration, WhaleError> {
    match raw {
        Some(raw) => parse_duration_arg(field, raw),
        None => Ok(default),
    }
}

/// Expand a path that may start with `~` to the user's home directory
fn expand_tilde(path: &str) -> Result<PathBuf, WhaleError> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| WhaleError::config("unable to determine home directory"))?;
        Ok(home.join(rest))
    } else {
        Ok(PathBuf::from(path))
    }
}

/// Load the config file. A missing default file is fine, a missing
/// explicitly requested one is not.
pub fn load_config(explicit: Option<&Path>) -> Result<FileConfig, WhaleError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => (expand_tilde(CONFIG_PATH)?, false),
    };

    if !path.exists() {
        if required {
            return Err(WhaleError::config(format!(
                "config file {} not found",
                path.display()
            )));
        }
        return Ok(FileConfig::default());
    }

    let content = fs::read_to_string(&path)
        .map_err(|e| WhaleError::config(format!("failed to read {}: {}", path.display(), e)))?;
    parse_config(&content)
        .map_err(|e| WhaleError::config(format!("{}: {}", path.display(), e)))
}

pub fn parse_config(content: &str) -> Result<FileConfig, WhaleError> {
    toml::from_str(content).map_err(|e| WhaleError::config(e.to_string()))
}
