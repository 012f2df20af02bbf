//! Registry and client statistics

use serde::Serialize;

use crate::connection::ConnectionState;

/// One topic as seen by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicInfo {
    pub topic: String,
    pub listeners: usize,
    /// Wire subscription id on the current link, if subscribed
    pub subscription_id: Option<String>,
}

/// Snapshot of the shared connection and its topics
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub state: ConnectionState,
    pub references: u32,
    pub reconnect_attempt: u32,
    pub topics: Vec<TopicInfo>,
}

impl ClientStats {
    pub fn total_listeners(&self) -> usize {
        self.topics.iter().map(|t| t.listeners).sum()
    }
}
