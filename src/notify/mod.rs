//! Progress notifications: event schema, per-project throttling and
//! broadcast fan-out.
//!
//! ```text
//! executor ──► NotificationThrottler ──(latest snapshot)──► Publisher
//!                                                            │
//!                                           Broadcaster ◄────┘
//!                                 project:{id}:events ──► subscribers
//! ```

pub mod broadcaster;
pub mod event;
pub mod throttler;

pub use broadcaster::{Broadcaster, Delivery, Subscription, channel_name};
pub use event::{EventKind, EventStatus, ProgressEvent};
pub use throttler::{FallbackHook, NotificationThrottler, Publisher, ThrottleStats};

use crate::config::NotificationConfig;
use std::sync::Arc;

/// Build a throttler publishing into a fresh broadcaster sized from `config`.
pub fn broadcast_pipeline(
    config: &NotificationConfig,
) -> (Arc<NotificationThrottler>, Arc<Broadcaster>) {
    let broadcaster = Arc::new(Broadcaster::new(
        config.channel_capacity,
        config.backlog_capacity,
    ));
    let throttler = Arc::new(NotificationThrottler::new(
        config.clone(),
        broadcaster.clone(),
    ));
    (throttler, broadcaster)
}
