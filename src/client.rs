//! Client facade.
//!
//! Owns one request executor, one subscription registry and one job-result
//! fetcher. Independent clients share nothing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ClientConfig;
use crate::error::ExecError;
use crate::job_result::{JobHandle, JobResult, JobResultFetcher};
use crate::pagination::{iterate_pages, Page, PageCursor, PageIterator};
use crate::request::{
    execute_with_retry, ApiRequest, ApiResponse, HttpExecutor, RequestExecutor, RetryPolicy,
};
use crate::subscription::{
    ChannelTarget, PushConnector, SubscriptionOptions, SubscriptionRegistry, WebSocketConnector,
};

/// Boxed page fetcher used by [`Client::list`].
pub type PageFetch<T> =
    Box<dyn FnMut(PageCursor) -> BoxFuture<'static, Result<Page<T>, ExecError>> + Send>;

/// JSON:API collection document.
#[derive(Deserialize)]
struct CollectionDocument<T> {
    data: Vec<T>,
    #[serde(default)]
    meta: CollectionMeta,
}

#[derive(Deserialize, Default)]
struct CollectionMeta {
    #[serde(default)]
    total_count: Option<u64>,
    #[serde(default)]
    next_cursor: Option<String>,
}

pub struct Client {
    config: ClientConfig,
    executor: Arc<dyn RequestExecutor>,
    retry_policy: RetryPolicy,
    registry: Arc<SubscriptionRegistry>,
    fetcher: JobResultFetcher,
}

impl Client {
    /// Create a client talking HTTP and WebSockets as configured.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let executor = Arc::new(HttpExecutor::from_config(&config)?);
        let connector = Arc::new(WebSocketConnector::new(Duration::from_secs(
            config.request_timeout_secs,
        )));
        Ok(Self::with_parts(config, executor, connector))
    }

    /// Create a client over the given executor and push connector.
    pub fn with_parts(
        config: ClientConfig,
        executor: Arc<dyn RequestExecutor>,
        connector: Arc<dyn PushConnector>,
    ) -> Self {
        let retry_policy = RetryPolicy::new(&config.retry);
        let registry = Arc::new(SubscriptionRegistry::new(
            connector,
            SubscriptionOptions::from_settings(&config.push),
        ));
        let fetcher = JobResultFetcher::new(
            executor.clone(),
            registry.clone(),
            ChannelTarget::from_config(&config),
            retry_policy.clone(),
            &config.jobs,
        );

        Self {
            config,
            executor,
            retry_policy,
            registry,
            fetcher,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Execute `request` with the client's retry policy.
    pub async fn request(&self, request: &ApiRequest) -> Result<ApiResponse, ExecError> {
        self.request_with_cancel(request, &CancellationToken::new())
            .await
    }

    pub async fn request_with_cancel(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, ExecError> {
        execute_with_retry(&self.retry_policy, cancel, || self.executor.execute(request)).await
    }

    /// Issue a job-initiating request and return the job's handle.
    pub async fn start_job(&self, request: &ApiRequest) -> Result<JobHandle, ExecError> {
        let response = self.request(request).await?;
        let handle = JobHandle::from_body(&response.json_value()?)?;
        info!("Started job {} ({} {})", handle.id, request.method, request.path);
        Ok(handle)
    }

    /// Start a job and wait for its terminal result.
    pub async fn run_job(&self, request: &ApiRequest) -> Result<JobResult, ExecError> {
        let handle = self.start_job(request).await?;
        self.job_result(&handle.id).await
    }

    /// Terminal result of `job_id`.
    pub async fn job_result(&self, job_id: &str) -> Result<JobResult, ExecError> {
        self.fetcher.fetch(job_id).await
    }

    pub async fn job_result_with_cancel(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<JobResult, ExecError> {
        self.fetcher.fetch_with_cancel(job_id, cancel).await
    }

    /// Iterate an offset-paginated collection at `path`, using the configured
    /// page size.
    pub fn list<T>(&self, path: &str, concurrency: usize) -> PageIterator<T, PageFetch<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.list_from(
            path,
            PageCursor::first_page(self.config.pagination.page_size),
            concurrency,
            CancellationToken::new(),
        )
    }

    /// Iterate the collection at `path` starting at `start`.
    pub fn list_from<T>(
        &self,
        path: &str,
        start: PageCursor,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> PageIterator<T, PageFetch<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let executor = self.executor.clone();
        let policy = self.retry_policy.clone();
        let path = path.to_string();
        let fetch_cancel = cancel.clone();

        let fetch: PageFetch<T> = Box::new(move |cursor| {
            fetch_page(
                executor.clone(),
                policy.clone(),
                path.clone(),
                cursor,
                fetch_cancel.clone(),
            )
            .boxed()
        });

        iterate_pages(fetch, start, concurrency, cancel)
    }

    /// Close every push subscription opened by this client.
    pub async fn shutdown(&self) {
        info!("Shutting down client");
        self.registry.close_all().await;
    }
}

async fn fetch_page<T: DeserializeOwned>(
    executor: Arc<dyn RequestExecutor>,
    policy: RetryPolicy,
    path: String,
    cursor: PageCursor,
    cancel: CancellationToken,
) -> Result<Page<T>, ExecError> {
    let request = match &cursor {
        PageCursor::Offset { offset, limit } => ApiRequest::get(path)
            .with_query("page[offset]", offset)
            .with_query("page[limit]", limit),
        PageCursor::Token(token) => ApiRequest::get(path).with_query("page[cursor]", token),
    };

    let response = execute_with_retry(&policy, &cancel, || executor.execute(&request)).await?;
    let document: CollectionDocument<T> = response.json()?;

    let mut page = Page::new(document.data);
    if let Some(total_count) = document.meta.total_count {
        page = page.with_total_count(total_count);
    }
    if let Some(next) = document.meta.next_cursor {
        page = page.with_next_cursor(PageCursor::Token(next));
    }
    Ok(page)
}
