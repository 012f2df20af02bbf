//! Topic subscriptions over the shared connection.
//!
//! One fan-out emitter per topic, no matter how many consumers listen. The
//! wire subscription follows the emitter: issued when the link opens or the
//! first listener arrives, forgotten when the link drops, re-issued on the
//! next link for topics that still have listeners.

mod registry;
mod stats;
mod stream;

pub use registry::{DispatchOutcome, TopicRegistry};
pub use stats::{ClientStats, TopicInfo};
pub use stream::{SharedPayload, TopicStream};
