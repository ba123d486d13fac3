//! A single shared push channel and the callers waiting on it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connector::{ChannelEvent, ChannelTarget, PushChannel, PushConnector, SubscriptionError};
use super::SubscriptionKey;
use crate::config::PushSettings;
use crate::job_result::{DeliveryPath, JobResult, ResultCache};

/// Delay before the first reconnection attempt; doubles on every failure.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connection state of a [`Subscription`].
///
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub auto_reconnect: bool,
    pub max_reconnect_delay: Duration,
    /// How many received results are kept for late waiters.
    pub retained_results: usize,
}

impl SubscriptionOptions {
    pub fn from_settings(settings: &PushSettings) -> Self {
        Self {
            auto_reconnect: settings.auto_reconnect,
            max_reconnect_delay: Duration::from_secs(settings.max_reconnect_delay_secs),
            retained_results: settings.retained_results,
        }
    }
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self::from_settings(&PushSettings::default())
    }
}

struct Inner {
    waiters: HashMap<String, Vec<oneshot::Sender<JobResult>>>,
    received: ResultCache,
}

struct Shared {
    key: SubscriptionKey,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Subscription {} {} -> {}", self.key, previous, state);
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Deliver channel events until the channel reports a disconnect.
    async fn pump(&self, channel: &mut PushChannel) -> String {
        while let Some(event) = channel.next_event().await {
            match event {
                ChannelEvent::JobResult(record) => {
                    self.deliver(JobResult::from_record(record, DeliveryPath::Push))
                        .await
                }
                ChannelEvent::Disconnected(reason) => return reason,
            }
        }
        "push channel ended".to_string()
    }

    async fn deliver(&self, result: JobResult) {
        if !result.is_terminal() {
            trace!("Ignoring non-terminal push for job {}", result.job_id);
            return;
        }
        debug!(
            "Received pushed result for job {} ({})",
            result.job_id,
            result.status()
        );

        let mut inner = self.inner.lock().await;
        if let Some(retained) = inner.received.get(&result.job_id) {
            // A terminal result never changes; the first one delivered stays
            if retained.status() != result.status() {
                warn!(
                    "Ignoring conflicting push for job {}: already {}, got {}",
                    result.job_id,
                    retained.status(),
                    result.status()
                );
            } else {
                trace!("Ignoring repeated push for job {}", result.job_id);
            }
            return;
        }
        inner.received.insert(result.clone());
        if let Some(waiters) = inner.waiters.remove(&result.job_id) {
            for waiter in waiters {
                // Waiters that gave up have dropped their receiver
                let _ = waiter.send(result.clone());
            }
        }
    }

    /// Mark the subscription closed and release every waiter.
    async fn shut(&self) {
        self.set_state(ConnectionState::Closed);
        let mut inner = self.inner.lock().await;
        inner.waiters.clear();
    }
}

/// One open push channel, shared by every caller using the same key.
///
/// Incoming terminal job results are fanned out to all callers waiting on the
/// job and retained (bounded) for callers that start waiting later.
pub struct Subscription {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl Subscription {
    /// Open a channel for `target` and start dispatching its events.
    pub async fn open(
        target: ChannelTarget,
        connector: Arc<dyn PushConnector>,
        options: SubscriptionOptions,
    ) -> Result<Self, SubscriptionError> {
        let key = target.key();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            key,
            state,
            inner: Mutex::new(Inner {
                waiters: HashMap::new(),
                received: ResultCache::new(options.retained_results),
            }),
        });

        let channel = match connector.open(&target).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to open subscription {}: {}", shared.key, e);
                shared.set_state(ConnectionState::Closed);
                return Err(e);
            }
        };
        shared.set_state(ConnectionState::Open);
        info!("Subscription {} open", shared.key);

        let shutdown = CancellationToken::new();
        tokio::spawn(run_dispatch(
            shared.clone(),
            channel,
            connector,
            target,
            options,
            shutdown.clone(),
        ));

        Ok(Self { shared, shutdown })
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.shared.key
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Observe connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// A result already received for `job_id`, if still retained.
    pub async fn peek(&self, job_id: &str) -> Option<JobResult> {
        self.shared.inner.lock().await.received.get(job_id).cloned()
    }

    /// Wait up to `timeout` for the pushed result of `job_id`.
    ///
    /// Resolves immediately when the result was already received. Returns
    /// `None` on timeout or when the subscription closes first.
    pub async fn wait_for_job(&self, job_id: &str, timeout: Duration) -> Option<JobResult> {
        let receiver = {
            let mut inner = self.shared.inner.lock().await;
            if let Some(result) = inner.received.get(job_id) {
                return Some(result.clone());
            }
            if self.is_closed() {
                return None;
            }
            let (sender, receiver) = oneshot::channel();
            let waiters = inner.waiters.entry(job_id.to_string()).or_default();
            waiters.retain(|waiter| !waiter.is_closed());
            waiters.push(sender);
            receiver
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(_)) => {
                debug!("Subscription {} closed while waiting for job {}", self.key(), job_id);
                None
            }
            Err(_) => {
                debug!("No push for job {} within {:?}", job_id, timeout);
                self.prune_waiters(job_id).await;
                None
            }
        }
    }

    /// Number of jobs with at least one live waiter.
    pub async fn waiting_jobs(&self) -> usize {
        let inner = self.shared.inner.lock().await;
        inner
            .waiters
            .values()
            .filter(|waiters| waiters.iter().any(|waiter| !waiter.is_closed()))
            .count()
    }

    async fn prune_waiters(&self, job_id: &str) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(waiters) = inner.waiters.get_mut(job_id) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                inner.waiters.remove(job_id);
            }
        }
    }

    /// Close the channel. Pending waiters resolve to `None`. Idempotent.
    pub async fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Closing subscription {}", self.key());
        }
        self.shutdown.cancel();
        self.shared.shut().await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", self.key())
            .field("state", &self.state())
            .finish()
    }
}

async fn run_dispatch(
    shared: Arc<Shared>,
    mut channel: PushChannel,
    connector: Arc<dyn PushConnector>,
    target: ChannelTarget,
    options: SubscriptionOptions,
    shutdown: CancellationToken,
) {
    'session: loop {
        let reason = tokio::select! {
            _ = shutdown.cancelled() => break 'session,
            reason = shared.pump(&mut channel) => reason,
        };
        channel.close();

        if !options.auto_reconnect {
            warn!("Subscription {} lost: {}", shared.key, reason);
            break 'session;
        }
        warn!("Subscription {} lost: {}, reconnecting", shared.key, reason);

        let mut delay = INITIAL_RECONNECT_DELAY;
        channel = loop {
            shared.set_state(ConnectionState::Disconnected);
            tokio::select! {
                _ = shutdown.cancelled() => break 'session,
                _ = tokio::time::sleep(delay) => {}
            }

            shared.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => break 'session,
                attempt = connector.open(&target) => attempt,
            };
            match attempt {
                Ok(channel) => break channel,
                Err(e) => {
                    warn!(
                        "Reconnecting subscription {} failed: {}, retrying in {:?}",
                        shared.key, e, delay
                    );
                    delay = (delay * 2).min(options.max_reconnect_delay);
                }
            }
        };

        info!("Subscription {} reconnected", shared.key);
        shared.set_state(ConnectionState::Open);
    }

    shared.shut().await;
}
