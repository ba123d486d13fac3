mod file_config;

pub use file_config::{FileConfig, JobsConfig, PaginationConfig, PushConfig, RetryConfig};

use anyhow::{bail, Result};

/// Environment targeted when none is configured.
pub const DEFAULT_ENVIRONMENT: &str = "main";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub base_url: Option<String>,
    pub api_token: Option<String>,
    pub environment: Option<String>,
    pub request_timeout_secs: u64,
    pub push_ws_url: Option<String>,
    pub push_auth_endpoint: Option<String>,
    pub no_push: bool,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    // Core settings
    pub base_url: String,
    pub api_token: String,
    pub environment: Option<String>,
    pub request_timeout_secs: u64,

    // Feature configs (with defaults)
    pub retry: RetrySettings,
    pub jobs: JobSettings,
    pub push: PushSettings,
    pub pagination: PaginationSettings,
}

impl ClientConfig {
    /// Configuration with defaults for everything but the endpoint and credential.
    /// Push delivery stays off until `push.ws_url` and `push.auth_endpoint` are set.
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: api_token.into(),
            environment: None,
            request_timeout_secs: 30,
            retry: RetrySettings::default(),
            jobs: JobSettings::default(),
            push: PushSettings::default(),
            pagination: PaginationSettings::default(),
        }
    }

    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let base_url = file
            .base_url
            .or_else(|| cli.base_url.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("base_url must be specified via --base-url or in config file")
            })?;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            bail!("base_url must be an http(s) URL: {}", base_url);
        }

        let api_token = file
            .api_token
            .or_else(|| cli.api_token.clone())
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("api_token must be specified via --api-token or in config file")
            })?;

        let environment = file.environment.or_else(|| cli.environment.clone());
        let request_timeout_secs = file
            .request_timeout_secs
            .unwrap_or(cli.request_timeout_secs);
        if request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }

        // Retry settings - merge file config with defaults
        let retry_defaults = RetrySettings::default();
        let retry_file = file.retry.unwrap_or_default();
        let retry = RetrySettings {
            max_attempts: retry_file
                .max_attempts
                .unwrap_or(retry_defaults.max_attempts),
            initial_delay_ms: retry_file
                .initial_delay_ms
                .unwrap_or(retry_defaults.initial_delay_ms),
            max_delay_ms: retry_file
                .max_delay_ms
                .unwrap_or(retry_defaults.max_delay_ms),
            backoff_factor: retry_file
                .backoff_factor
                .unwrap_or(retry_defaults.backoff_factor),
            max_retry_after_secs: retry_file
                .max_retry_after_secs
                .unwrap_or(retry_defaults.max_retry_after_secs),
        };
        if retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if !(retry.backoff_factor >= 1.0) {
            bail!(
                "retry.backoff_factor must be at least 1.0, got {}",
                retry.backoff_factor
            );
        }
        if retry.max_delay_ms < retry.initial_delay_ms {
            bail!("retry.max_delay_ms must not be lower than retry.initial_delay_ms");
        }

        let job_defaults = JobSettings::default();
        let jobs_file = file.jobs.unwrap_or_default();
        let jobs = JobSettings {
            push_wait_timeout_secs: jobs_file
                .push_wait_timeout_secs
                .unwrap_or(job_defaults.push_wait_timeout_secs),
            poll_head_start_ms: jobs_file
                .poll_head_start_ms
                .unwrap_or(job_defaults.poll_head_start_ms),
            poll_interval_ms: jobs_file
                .poll_interval_ms
                .unwrap_or(job_defaults.poll_interval_ms),
            max_poll_attempts: jobs_file
                .max_poll_attempts
                .unwrap_or(job_defaults.max_poll_attempts),
            cached_results: jobs_file
                .cached_results
                .unwrap_or(job_defaults.cached_results),
        };
        if jobs.max_poll_attempts == 0 {
            bail!("jobs.max_poll_attempts must be at least 1");
        }

        // Push settings - disabled unless both endpoints are known
        let push_defaults = PushSettings::default();
        let push_file = file.push.unwrap_or_default();
        let ws_url = push_file.ws_url.or_else(|| cli.push_ws_url.clone());
        let auth_endpoint = push_file
            .auth_endpoint
            .or_else(|| cli.push_auth_endpoint.clone());
        let push = PushSettings {
            enabled: push_file.enabled.unwrap_or(!cli.no_push)
                && ws_url.is_some()
                && auth_endpoint.is_some(),
            ws_url,
            auth_endpoint,
            channel_namespace: push_file
                .channel_namespace
                .unwrap_or(push_defaults.channel_namespace),
            auto_reconnect: push_file
                .auto_reconnect
                .unwrap_or(push_defaults.auto_reconnect),
            max_reconnect_delay_secs: push_file
                .max_reconnect_delay_secs
                .unwrap_or(push_defaults.max_reconnect_delay_secs),
            retained_results: push_file
                .retained_results
                .unwrap_or(push_defaults.retained_results),
        };

        let pagination_defaults = PaginationSettings::default();
        let pagination_file = file.pagination.unwrap_or_default();
        let pagination = PaginationSettings {
            page_size: pagination_file
                .page_size
                .unwrap_or(pagination_defaults.page_size),
            concurrency: pagination_file
                .concurrency
                .unwrap_or(pagination_defaults.concurrency),
        };
        if pagination.page_size == 0 || pagination.concurrency == 0 {
            bail!("pagination.page_size and pagination.concurrency must be greater than zero");
        }

        Ok(Self {
            base_url,
            api_token,
            environment,
            request_timeout_secs,
            retry,
            jobs,
            push,
            pagination,
        })
    }

    /// Name of the private channel job-result events are pushed on.
    pub fn channel_name(&self) -> String {
        self.push.channel_name(self.environment.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Longest server-requested wait honored before a retry.
    pub max_retry_after_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            max_retry_after_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub push_wait_timeout_secs: u64,
    pub poll_head_start_ms: u64,
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
    pub cached_results: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            push_wait_timeout_secs: 60,
            poll_head_start_ms: 1_000,
            poll_interval_ms: 1_000,
            max_poll_attempts: 300,
            cached_results: 1_024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub enabled: bool, // true if both ws_url and auth_endpoint are set
    pub ws_url: Option<String>,
    pub auth_endpoint: Option<String>,
    pub channel_namespace: String,
    pub auto_reconnect: bool,
    pub max_reconnect_delay_secs: u64,
    pub retained_results: usize,
}

impl PushSettings {
    pub fn channel_name(&self, environment: Option<&str>) -> String {
        format!(
            "private-{}-{}",
            self.channel_namespace,
            environment.unwrap_or(DEFAULT_ENVIRONMENT)
        )
    }
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ws_url: None,
            auth_endpoint: None,
            channel_namespace: "site".to_string(),
            auto_reconnect: true,
            max_reconnect_delay_secs: 30,
            retained_results: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaginationSettings {
    pub page_size: u64,
    pub concurrency: usize,
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            concurrency: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cli() -> CliConfig {
        CliConfig {
            base_url: Some("https://site-api.example.com".to_string()),
            api_token: Some("cli-token".to_string()),
            request_timeout_secs: 30,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let config = ClientConfig::resolve(&make_cli(), None).unwrap();

        assert_eq!(config.base_url, "https://site-api.example.com");
        assert_eq!(config.api_token, "cli-token");
        assert_eq!(config.environment, None);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.jobs.poll_interval_ms, 1_000);
        assert!(!config.push.enabled);
        assert_eq!(config.pagination.concurrency, 4);
    }

    #[test]
    fn test_toml_overrides_cli() {
        let file = FileConfig {
            api_token: Some("file-token".to_string()),
            environment: Some("staging".to_string()),
            request_timeout_secs: Some(5),
            retry: Some(RetryConfig {
                max_attempts: Some(2),
                max_retry_after_secs: Some(45),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = ClientConfig::resolve(&make_cli(), Some(file)).unwrap();

        assert_eq!(config.base_url, "https://site-api.example.com");
        assert_eq!(config.api_token, "file-token");
        assert_eq!(config.environment.as_deref(), Some("staging"));
        assert_eq!(config.request_timeout_secs, 5);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.max_retry_after_secs, 45);
        // Unset fields keep defaults
        assert_eq!(config.retry.initial_delay_ms, 500);
    }

    #[test]
    fn test_missing_base_url() {
        let cli = CliConfig {
            base_url: None,
            ..make_cli()
        };
        let err = ClientConfig::resolve(&cli, None).unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_missing_or_blank_token() {
        let cli = CliConfig {
            api_token: Some("  ".to_string()),
            ..make_cli()
        };
        let err = ClientConfig::resolve(&cli, None).unwrap_err();
        assert!(err.to_string().contains("api_token"));
    }

    #[test]
    fn test_invalid_base_url_scheme() {
        let cli = CliConfig {
            base_url: Some("ftp://example.com".to_string()),
            ..make_cli()
        };
        assert!(ClientConfig::resolve(&cli, None).is_err());
    }

    #[test]
    fn test_push_requires_both_endpoints() {
        let cli = CliConfig {
            push_ws_url: Some("wss://push.example.com/app/key".to_string()),
            ..make_cli()
        };
        let config = ClientConfig::resolve(&cli, None).unwrap();
        assert!(!config.push.enabled);

        let cli = CliConfig {
            push_auth_endpoint: Some("https://site-api.example.com/push/auth".to_string()),
            ..cli
        };
        let config = ClientConfig::resolve(&cli, None).unwrap();
        assert!(config.push.enabled);
    }

    #[test]
    fn test_no_push_flag_and_file_override() {
        let cli = CliConfig {
            push_ws_url: Some("wss://push.example.com/app/key".to_string()),
            push_auth_endpoint: Some("https://site-api.example.com/push/auth".to_string()),
            no_push: true,
            ..make_cli()
        };
        let config = ClientConfig::resolve(&cli, None).unwrap();
        assert!(!config.push.enabled);

        let file = FileConfig {
            push: Some(PushConfig {
                enabled: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = ClientConfig::resolve(&cli, Some(file)).unwrap();
        assert!(config.push.enabled);
    }

    #[test]
    fn test_invalid_retry_settings() {
        let file = FileConfig {
            retry: Some(RetryConfig {
                backoff_factor: Some(0.5),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(ClientConfig::resolve(&make_cli(), Some(file)).is_err());

        let file = FileConfig {
            retry: Some(RetryConfig {
                max_attempts: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(ClientConfig::resolve(&make_cli(), Some(file)).is_err());

        let file = FileConfig {
            retry: Some(RetryConfig {
                initial_delay_ms: Some(10_000),
                max_delay_ms: Some(1_000),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(ClientConfig::resolve(&make_cli(), Some(file)).is_err());
    }

    #[test]
    fn test_invalid_pagination_settings() {
        let file = FileConfig {
            pagination: Some(PaginationConfig {
                concurrency: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(ClientConfig::resolve(&make_cli(), Some(file)).is_err());
    }

    #[test]
    fn test_channel_name() {
        let mut config = ClientConfig::new("https://site-api.example.com", "token");
        assert_eq!(config.channel_name(), "private-site-main");

        config.environment = Some("sandbox".to_string());
        config.push.channel_namespace = "acme".to_string();
        assert_eq!(config.channel_name(), "private-acme-sandbox");
    }
}
