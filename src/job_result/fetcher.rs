//! Job result fetcher.
//!
//! Races the push channel against REST polling and normalizes both paths into
//! one [`JobResult`]. The push path gets a head start and wins ties.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{DeliveryPath, JobResult, JobStatus, ResultCache};
use crate::cancelable::{spawn_cancelable, with_cancellation, Canceled};
use crate::config::JobSettings;
use crate::error::ExecError;
use crate::request::{execute_with_retry, ApiRequest, RequestExecutor, RetryPolicy};
use crate::subscription::{ChannelTarget, Subscription, SubscriptionRegistry};

/// Path of the job-result polling endpoint.
pub fn job_result_path(job_id: &str) -> String {
    format!("/job-results/{}", job_id)
}

/// REST side of the fetcher: single fetches and the pending-aware poll loop.
#[derive(Clone)]
struct Poller {
    executor: Arc<dyn RequestExecutor>,
    policy: RetryPolicy,
    head_start: Duration,
    interval: Duration,
    max_polls: u32,
}

impl Poller {
    /// Fetch the current result once, retrying transient failures (including
    /// the 404 seen before the result record exists).
    async fn fetch_once(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<JobResult, ExecError> {
        let request = ApiRequest::get(job_result_path(job_id));
        let response =
            execute_with_retry(&self.policy, cancel, || self.executor.execute(&request)).await?;
        let result = JobResult::from_rest_body(response.json_value()?)?;
        if result.job_id != job_id {
            return Err(ExecError::Decode(format!(
                "asked for job {}, got result for job {}",
                job_id, result.job_id
            )));
        }
        Ok(result)
    }

    /// Whether `error` came from transient failures outlasting the budget,
    /// as opposed to a fatal answer from the server.
    fn gave_up_transiently(&self, error: &ExecError) -> bool {
        matches!(error, ExecError::RetriesExhausted(_)) || self.policy.is_retryable(error)
    }

    /// Poll until the job reaches a terminal state or the poll budget runs out.
    async fn run(self, job_id: String, cancel: CancellationToken) -> Result<JobResult, ExecError> {
        with_cancellation(tokio::time::sleep(self.head_start), cancel.clone()).await?;

        for poll in 1..=self.max_polls {
            let result = self.fetch_once(&job_id, &cancel).await?;
            if result.is_terminal() {
                return Ok(result);
            }
            trace!("Job {} still pending ({}/{})", job_id, poll, self.max_polls);
            if poll < self.max_polls {
                with_cancellation(tokio::time::sleep(self.interval), cancel.clone()).await?;
            }
        }

        warn!(
            "Job {} still pending after {} polls, giving up",
            job_id, self.max_polls
        );
        Err(ExecError::RetriesExhausted(Box::new(
            ExecError::StillPending { job_id },
        )))
    }
}

/// Obtains the terminal result of a job, preferring the push channel and
/// falling back to polling.
pub struct JobResultFetcher {
    registry: Arc<SubscriptionRegistry>,
    push_target: Option<ChannelTarget>,
    push_wait_timeout: Duration,
    poller: Poller,
    cache: Mutex<ResultCache>,
}

impl JobResultFetcher {
    /// Create a fetcher.
    ///
    /// `push_target` is `None` when push delivery is not configured; the
    /// fetcher then relies on polling alone.
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        registry: Arc<SubscriptionRegistry>,
        push_target: Option<ChannelTarget>,
        retry_policy: RetryPolicy,
        settings: &JobSettings,
    ) -> Self {
        Self {
            registry,
            push_target,
            push_wait_timeout: Duration::from_secs(settings.push_wait_timeout_secs),
            poller: Poller {
                executor,
                policy: retry_policy.with_retryable_status(404),
                head_start: Duration::from_millis(settings.poll_head_start_ms),
                interval: Duration::from_millis(settings.poll_interval_ms),
                max_polls: settings.max_poll_attempts.max(1),
            },
            cache: Mutex::new(ResultCache::new(settings.cached_results)),
        }
    }

    pub fn push_target(&self) -> Option<&ChannelTarget> {
        self.push_target.as_ref()
    }

    /// Fetch the terminal result of `job_id`.
    pub async fn fetch(&self, job_id: &str) -> Result<JobResult, ExecError> {
        self.fetch_with_cancel(job_id, &CancellationToken::new())
            .await
    }

    /// Like [`fetch`](Self::fetch), abandoned with [`ExecError::Canceled`]
    /// once `cancel` fires.
    pub async fn fetch_with_cancel(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<JobResult, ExecError> {
        if let Some(cached) = self.cache.lock().await.get(job_id).cloned() {
            debug!("Returning cached result for job {}", job_id);
            return Ok(cached);
        }

        let outcome = self.resolve(job_id, cancel).await;
        match &outcome {
            Err(e) if e.is_canceled() => debug!("Fetching job {} canceled", job_id),
            Err(e) => warn!("Fetching job {} failed: {}", job_id, e),
            Ok(_) => {}
        }
        let result = outcome?;

        let mut cache = self.cache.lock().await;
        if let Some(previous) = cache.get(job_id) {
            if previous.status() != result.status() {
                return Err(ExecError::InconsistentJobResult {
                    job_id: job_id.to_string(),
                    push: previous.status(),
                    poll: result.status(),
                });
            }
            return Ok(previous.clone());
        }
        cache.insert(result.clone());
        Ok(result)
    }

    async fn resolve(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<JobResult, ExecError> {
        let subscription = match &self.push_target {
            Some(target) => {
                match with_cancellation(self.registry.subscribe(target), cancel.clone()).await? {
                    Ok(subscription) => Some(subscription),
                    Err(e) => {
                        warn!(
                            "Push unavailable for job {} ({}), falling back to polling",
                            job_id, e
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let scope = cancel.child_token();
        let raced = self.race(job_id, subscription.clone(), &scope).await;
        scope.cancel();
        let (winner, path) = raced?;
        info!("Job {} result delivered via {}", job_id, path);

        if path == DeliveryPath::Poll {
            if let Some(subscription) = &subscription {
                check_consistency(subscription, &winner).await?;
            }
        }

        if winner.needs_external_fetch() {
            info!(
                "Payload of job {} was too large to push, fetching it over REST",
                job_id
            );
            let full = self.poller.fetch_once(job_id, cancel).await?;
            if full.status() != JobStatus::Completed || full.needs_external_fetch() {
                return Err(ExecError::InconsistentJobResult {
                    job_id: job_id.to_string(),
                    push: winner.status(),
                    poll: full.status(),
                });
            }
            return Ok(full);
        }

        Ok(winner)
    }

    /// Run the push wait and the poll loop as two tasks under `scope`. The
    /// first terminal result wins and the other task is aborted. A fatal poll
    /// error ends the race at once. A poll that ran out of retries or polls
    /// leaves the push wait running and is reported only if no push arrives.
    /// An empty push wait leaves polling to finish.
    async fn race(
        &self,
        job_id: &str,
        subscription: Option<Arc<Subscription>>,
        scope: &CancellationToken,
    ) -> Result<(JobResult, DeliveryPath), ExecError> {
        let push_enabled = subscription.is_some();
        let push_timeout = self.push_wait_timeout;
        let push_job_id = job_id.to_string();
        let (push, push_handle) = spawn_cancelable(async move {
            match subscription {
                Some(subscription) => subscription.wait_for_job(&push_job_id, push_timeout).await,
                None => None,
            }
        });
        let (poll, poll_handle) =
            spawn_cancelable(self.poller.clone().run(job_id.to_string(), scope.clone()));
        tokio::pin!(push);
        tokio::pin!(poll);

        let mut push_open = push_enabled;
        let mut poll_open = true;
        let mut poll_error: Option<ExecError> = None;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => break Err(ExecError::Canceled),
                pushed = &mut push, if push_open => match pushed {
                    Ok(Some(result)) => break Ok((result, DeliveryPath::Push)),
                    Ok(None) | Err(Canceled) => {
                        push_open = false;
                        if let Some(e) = poll_error.take() {
                            break Err(e);
                        }
                        debug!("No push for job {}, waiting on polling", job_id);
                    }
                },
                polled = &mut poll, if poll_open => match polled {
                    Ok(Ok(result)) => break Ok((result, DeliveryPath::Poll)),
                    Ok(Err(e)) if push_open && self.poller.gave_up_transiently(&e) => {
                        debug!(
                            "Polling job {} gave up ({}), still waiting on push",
                            job_id, e
                        );
                        poll_open = false;
                        poll_error = Some(e);
                    }
                    Ok(Err(e)) => break Err(e),
                    Err(Canceled) => break Err(ExecError::Canceled),
                },
            }
        };

        push_handle.cancel();
        poll_handle.cancel();
        outcome
    }
}

/// A polled result must agree with whatever the push channel already delivered.
async fn check_consistency(subscription: &Subscription, polled: &JobResult) -> Result<(), ExecError> {
    match subscription.peek(&polled.job_id).await {
        Some(pushed) if pushed.status() != polled.status() => {
            Err(ExecError::InconsistentJobResult {
                job_id: polled.job_id.clone(),
                push: pushed.status(),
                poll: polled.status(),
            })
        }
        _ => Ok(()),
    }
}
