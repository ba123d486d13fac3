use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use job_result_client::{CliConfig, Client, ClientConfig, ExecError, FileConfig, PageCursor};

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Its values override the flags below.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Base URL of the API.
    #[clap(long)]
    pub base_url: Option<String>,

    /// API token sent as bearer credential.
    #[clap(long, env = "API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Environment to target (defaults to the primary one).
    #[clap(long)]
    pub environment: Option<String>,

    /// Timeout in seconds for a single request.
    #[clap(long, default_value_t = 30)]
    pub request_timeout_sec: u64,

    /// WebSocket URL of the push service.
    #[clap(long)]
    pub push_ws_url: Option<String>,

    /// Channel authorization endpoint of the push service.
    #[clap(long)]
    pub push_auth_endpoint: Option<String>,

    /// Never use push notifications, poll only.
    #[clap(long)]
    pub no_push: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for a job to finish and print its result.
    Wait {
        /// Job id returned by the call that started the job.
        job_id: String,
    },
    /// Print every item of a paginated collection, one JSON document per line.
    List {
        /// Collection path, e.g. /items
        path: String,

        /// Number of pages fetched concurrently.
        #[clap(long)]
        concurrency: Option<usize>,
    },
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            base_url: self.base_url.clone(),
            api_token: self.api_token.clone(),
            environment: self.environment.clone(),
            request_timeout_secs: self.request_timeout_sec,
            push_ws_url: self.push_ws_url.clone(),
            push_auth_endpoint: self.push_auth_endpoint.clone(),
            no_push: self.no_push,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = ClientConfig::resolve(&cli_args.to_cli_config(), file_config)?;
    if config.push.enabled {
        info!("Push delivery enabled on channel {}", config.channel_name());
    } else {
        info!("Push delivery disabled, results are polled");
    }

    let client = Client::from_config(config)?;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, canceling");
                cancel.cancel();
            }
        });
    }

    let outcome = match cli_args.command {
        Command::Wait { job_id } => wait(&client, &job_id, &cancel).await,
        Command::List { path, concurrency } => list(&client, &path, concurrency, &cancel).await,
    };
    client.shutdown().await;

    match outcome {
        Err(e) if e.is_canceled() => {
            debug!("Canceled by user");
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            Err(e.into())
        }
        Ok(()) => Ok(()),
    }
}

async fn wait(client: &Client, job_id: &str, cancel: &CancellationToken) -> Result<(), ExecError> {
    let result = client.job_result_with_cancel(job_id, cancel).await?;
    println!("{}", result.to_json());
    Ok(())
}

async fn list(
    client: &Client,
    path: &str,
    concurrency: Option<usize>,
    cancel: &CancellationToken,
) -> Result<(), ExecError> {
    let concurrency = concurrency.unwrap_or(client.config().pagination.concurrency);
    let mut items = client.list_from::<serde_json::Value>(
        path,
        PageCursor::first_page(client.config().pagination.page_size),
        concurrency,
        cancel.clone(),
    );

    let mut count = 0usize;
    while let Some(item) = items.next().await {
        println!("{}", item?);
        count += 1;
    }
    info!(
        "Listed {} items from {} ({} pages)",
        count,
        path,
        items.pages_fetched()
    );
    Ok(())
}
