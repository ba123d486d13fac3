//! Cache of open subscriptions, one per subscription key.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::connector::{ChannelTarget, PushConnector, SubscriptionError};
use super::subscription::{Subscription, SubscriptionOptions};
use super::SubscriptionKey;

type PendingOpen = Shared<BoxFuture<'static, Result<Arc<Subscription>, SubscriptionError>>>;

enum Slot {
    Open(Arc<Subscription>),
    /// Handshake in progress; every caller for the key awaits the same one.
    Opening(PendingOpen),
}

/// Owns the subscriptions of one client.
///
/// Each registry is independent; nothing is shared between registries.
pub struct SubscriptionRegistry {
    connector: Arc<dyn PushConnector>,
    options: SubscriptionOptions,
    slots: Mutex<HashMap<SubscriptionKey, Slot>>,
}

impl SubscriptionRegistry {
    pub fn new(connector: Arc<dyn PushConnector>, options: SubscriptionOptions) -> Self {
        Self {
            connector,
            options,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached subscription for `target`, opening one if there is
    /// none or the cached one is closed.
    ///
    /// Concurrent first calls for the same key share a single handshake and
    /// its outcome. The registry lock is not held while the handshake runs,
    /// so other keys are never blocked by it.
    pub async fn subscribe(
        &self,
        target: &ChannelTarget,
    ) -> Result<Arc<Subscription>, SubscriptionError> {
        let key = target.key();
        let pending = {
            let mut slots = self.slots.lock().await;
            let joined = match slots.get(&key) {
                Some(Slot::Open(existing)) if !existing.is_closed() => {
                    return Ok(existing.clone());
                }
                Some(Slot::Opening(pending)) => Some(pending.clone()),
                Some(Slot::Open(_)) => {
                    debug!("Dropping closed subscription {}", key);
                    None
                }
                None => None,
            };
            match joined {
                Some(pending) => pending,
                None => {
                    let pending = Subscription::open(
                        target.clone(),
                        self.connector.clone(),
                        self.options.clone(),
                    )
                    .map(|opened| opened.map(Arc::new))
                    .boxed()
                    .shared();
                    slots.insert(key.clone(), Slot::Opening(pending.clone()));
                    pending
                }
            }
        };

        let outcome = pending.clone().await;

        let mut slots = self.slots.lock().await;
        let still_pending = matches!(
            slots.get(&key),
            Some(Slot::Opening(current)) if current.ptr_eq(&pending)
        );
        let settled = matches!(
            (slots.get(&key), &outcome),
            (Some(Slot::Open(current)), Ok(opened)) if Arc::ptr_eq(current, opened)
        );
        match outcome {
            Ok(subscription) if still_pending => {
                slots.insert(key, Slot::Open(subscription.clone()));
                Ok(subscription)
            }
            Ok(subscription) if settled => Ok(subscription),
            Ok(subscription) => {
                // Closed by the owner while the handshake was running
                drop(slots);
                debug!("Subscription {} closed before it was handed out", key);
                subscription.close().await;
                Err(SubscriptionError::Closed)
            }
            Err(e) => {
                if still_pending {
                    slots.remove(&key);
                }
                Err(e)
            }
        }
    }

    /// Close `subscription` and forget it, so the next `subscribe` for its
    /// key opens a fresh channel. Idempotent.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        subscription.close().await;

        let mut slots = self.slots.lock().await;
        let is_cached = matches!(
            slots.get(subscription.key()),
            Some(Slot::Open(cached)) if std::ptr::eq(cached.as_ref(), subscription)
        );
        if is_cached {
            slots.remove(subscription.key());
        }
    }

    /// Close and forget every subscription. Handshakes still running are
    /// abandoned and their subscriptions closed once they complete.
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut slots = self.slots.lock().await;
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Open(subscription) => Some(subscription),
                    Slot::Opening(_) => None,
                })
                .collect()
        };
        for subscription in drained {
            subscription.close().await;
        }
    }

    /// Number of cached subscriptions that are not closed.
    pub async fn active_count(&self) -> usize {
        let slots = self.slots.lock().await;
        slots
            .values()
            .filter(|slot| matches!(slot, Slot::Open(subscription) if !subscription.is_closed()))
            .count()
    }
}
