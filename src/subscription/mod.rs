//! Push notification subscriptions.
//!
//! A [`SubscriptionRegistry`] keeps one [`Subscription`] per
//! (auth endpoint, channel, credential). Subscriptions demultiplex pushed
//! job results to the callers waiting on them.

mod connector;
mod protocol;
mod registry;
#[allow(clippy::module_inception)]
mod subscription;

pub use connector::{
    ChannelEvent, ChannelTarget, PushChannel, PushConnector, SubscriptionError, SubscriptionKey,
    WebSocketConnector,
};
pub use protocol::{
    events, ChannelAuthRequest, ChannelAuthResponse, ConnectionEstablished, PushErrorData,
    PushFrame, PUSH_PAYLOAD_LIMIT_BYTES,
};
pub use registry::SubscriptionRegistry;
pub use subscription::{ConnectionState, Subscription, SubscriptionOptions};
