use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub base_url: Option<String>,
    pub api_token: Option<String>,
    pub environment: Option<String>,
    pub request_timeout_secs: Option<u64>,

    // Feature configs
    pub retry: Option<RetryConfig>,
    pub jobs: Option<JobsConfig>,
    pub push: Option<PushConfig>,
    pub pagination: Option<PaginationConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub max_retry_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct JobsConfig {
    pub push_wait_timeout_secs: Option<u64>,
    pub poll_head_start_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub max_poll_attempts: Option<u32>,
    pub cached_results: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PushConfig {
    pub enabled: Option<bool>,
    pub ws_url: Option<String>,
    pub auth_endpoint: Option<String>,
    pub channel_namespace: Option<String>,
    pub auto_reconnect: Option<bool>,
    pub max_reconnect_delay_secs: Option<u64>,
    pub retained_results: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PaginationConfig {
    pub page_size: Option<u64>,
    pub concurrency: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: FileConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_full_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
base_url = "https://site-api.example.com"
api_token = "secret"
environment = "staging"
request_timeout_secs = 15

[retry]
max_attempts = 3
backoff_factor = 1.5

[jobs]
poll_interval_ms = 250

[push]
ws_url = "wss://push.example.com/app/key"
auth_endpoint = "https://site-api.example.com/push/auth"
channel_namespace = "acme"

[pagination]
concurrency = 8
"#
        )
        .unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(
            config.base_url.as_deref(),
            Some("https://site-api.example.com")
        );
        assert_eq!(config.environment.as_deref(), Some("staging"));
        assert_eq!(config.request_timeout_secs, Some(15));

        let retry = config.retry.unwrap();
        assert_eq!(retry.max_attempts, Some(3));
        assert_eq!(retry.backoff_factor, Some(1.5));
        assert_eq!(retry.initial_delay_ms, None);

        assert_eq!(config.jobs.unwrap().poll_interval_ms, Some(250));
        let push = config.push.unwrap();
        assert_eq!(push.channel_namespace.as_deref(), Some("acme"));
        assert_eq!(push.enabled, None);
        assert_eq!(config.pagination.unwrap().concurrency, Some(8));
    }

    #[test]
    fn test_load_empty_config() {
        let file = NamedTempFile::new().unwrap();
        let config = FileConfig::load(file.path()).unwrap();
        assert!(config.base_url.is_none());
        assert!(config.push.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = FileConfig::load(Path::new("/nonexistent/client.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "base_url = [unterminated").unwrap();
        assert!(FileConfig::load(file.path()).is_err());
    }
}
