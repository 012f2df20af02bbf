use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use super::stats::TopicInfo;
use super::stream::SharedPayload;
use crate::metrics::{FrameMetrics, SubscriptionMetrics};
use crate::transport::{WireCommand, WireLink};

/// Per-topic bookkeeping
struct TopicEntry {
    /// Fan-out emitter shared by every listener of the topic
    emitter: broadcast::Sender<SharedPayload>,
    /// Wire subscription id on the current link, if subscribed
    wire: Option<String>,
}

impl TopicEntry {
    fn listeners(&self) -> usize {
        self.emitter.receiver_count()
    }
}

/// What happened to an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to this many listeners (0 if all listeners are gone)
    Delivered(usize),
    /// Body was not valid JSON
    DecodeFailed,
    /// Subscription id is not the topic's current one
    Stale,
    /// No topic matches the frame
    Unrouted,
}

/// Topic → emitter + wire subscription map.
///
/// Owned by the connection manager task and only ever mutated there. Every
/// method that may produce wire traffic takes the link explicitly; `None`
/// means "not open", and wire work is deferred.
pub struct TopicRegistry {
    topics: HashMap<String, TopicEntry>,
    /// subscription id -> topic, for the current link only
    by_subscription: HashMap<String, String>,
    /// Never reset, so ids from earlier links can't collide with live ones
    next_subscription: u64,
    listener_capacity: usize,
}

impl TopicRegistry {
    pub fn new(listener_capacity: usize) -> Self {
        Self {
            topics: HashMap::new(),
            by_subscription: HashMap::new(),
            next_subscription: 0,
            listener_capacity: listener_capacity.max(1),
        }
    }

    /// Add a listener to `topic`, creating the emitter on first use.
    ///
    /// If the link is open and the topic has no wire subscription yet, one is
    /// issued; otherwise it waits for `resubscribe_live`.
    pub fn listen(
        &mut self,
        topic: &str,
        link: Option<&WireLink>,
    ) -> broadcast::Receiver<SharedPayload> {
        let capacity = self.listener_capacity;
        let entry = self.topics.entry(topic.to_string()).or_insert_with(|| {
            tracing::debug!(topic = %topic, "Creating topic emitter");
            let (emitter, _) = broadcast::channel(capacity);
            TopicEntry {
                emitter,
                wire: None,
            }
        });
        let receiver = entry.emitter.subscribe();

        if let Some(link) = link {
            self.ensure_wire(topic, link);
        }

        SubscriptionMetrics::set_active_topics(self.topics.len());
        receiver
    }

    /// Issue wire subscriptions for every topic that has listeners but no
    /// subscription on the current link. Returns how many were issued.
    pub fn resubscribe_live(&mut self, link: &WireLink) -> usize {
        let pending: Vec<String> = self
            .topics
            .iter()
            .filter(|(_, entry)| entry.wire.is_none() && entry.listeners() > 0)
            .map(|(topic, _)| topic.clone())
            .collect();

        let mut issued = 0;
        for topic in pending {
            if self.ensure_wire(&topic, link) {
                issued += 1;
            }
        }

        if issued > 0 {
            tracing::info!(topics = issued, "Re-issued wire subscriptions");
        }
        issued
    }

    /// The link is gone: its subscription ids mean nothing any more.
    /// Emitters and their listeners stay.
    pub fn invalidate(&mut self) {
        for entry in self.topics.values_mut() {
            entry.wire = None;
        }
        self.by_subscription.clear();
    }

    /// Drop a topic entirely. Listeners see their stream end. Returns whether
    /// the topic existed.
    pub fn remove(&mut self, topic: &str, link: Option<&WireLink>) -> bool {
        let Some(entry) = self.topics.remove(topic) else {
            return false;
        };

        if let Some(id) = entry.wire {
            self.by_subscription.remove(&id);
            if let Some(link) = link {
                link.send(WireCommand::Unsubscribe { id: id.clone() });
                SubscriptionMetrics::record_unsubscribe();
                tracing::debug!(topic = %topic, subscription_id = %id, "Wire unsubscribe sent");
            }
        }

        tracing::debug!(topic = %topic, listeners = entry.emitter.receiver_count(), "Topic removed");
        SubscriptionMetrics::set_active_topics(self.topics.len());
        true
    }

    /// Remove every topic, completing all listeners
    pub fn clear(&mut self, link: Option<&WireLink>) {
        let topics: Vec<String> = self.topics.keys().cloned().collect();
        for topic in &topics {
            self.remove(topic, link);
        }
        self.by_subscription.clear();

        if !topics.is_empty() {
            tracing::info!(topics = topics.len(), "Completed all topic emitters");
        }
    }

    /// Route one inbound MESSAGE frame to its topic's listeners
    pub fn dispatch(&mut self, subscription: &str, destination: &str, body: &str) -> DispatchOutcome {
        FrameMetrics::record_received();

        let topic = if subscription.is_empty() {
            // No id to check against: accept only topics subscribed on this link
            match self.topics.get(destination) {
                Some(entry) if entry.wire.is_some() => destination.to_string(),
                _ => {
                    FrameMetrics::record_unrouted();
                    return DispatchOutcome::Unrouted;
                }
            }
        } else {
            match self.by_subscription.get(subscription) {
                Some(topic) => topic.clone(),
                None => {
                    tracing::debug!(
                        subscription_id = %subscription,
                        destination = %destination,
                        "Dropping frame for unknown subscription"
                    );
                    FrameMetrics::record_stale();
                    return DispatchOutcome::Stale;
                }
            }
        };

        let Some(entry) = self.topics.get(&topic) else {
            FrameMetrics::record_unrouted();
            return DispatchOutcome::Unrouted;
        };

        let payload: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Error parsing message, frame dropped");
                FrameMetrics::record_decode_failure();
                return DispatchOutcome::DecodeFailed;
            }
        };

        // Err only means nobody is listening right now
        let delivered = entry.emitter.send(Arc::new(payload)).unwrap_or(0);
        tracing::trace!(topic = %topic, delivered = delivered, "Frame dispatched");
        DispatchOutcome::Delivered(delivered)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn topic_info(&self) -> Vec<TopicInfo> {
        let mut info: Vec<TopicInfo> = self
            .topics
            .iter()
            .map(|(topic, entry)| TopicInfo {
                topic: topic.clone(),
                listeners: entry.listeners(),
                subscription_id: entry.wire.clone(),
            })
            .collect();
        info.sort_by(|a, b| a.topic.cmp(&b.topic));
        info
    }

    /// Subscribe `topic` on the link unless it already is. Returns whether a
    /// SUBSCRIBE was sent.
    fn ensure_wire(&mut self, topic: &str, link: &WireLink) -> bool {
        let Some(entry) = self.topics.get_mut(topic) else {
            return false;
        };
        if entry.wire.is_some() {
            return false;
        }

        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription += 1;

        if !link.send(WireCommand::Subscribe {
            id: id.clone(),
            destination: topic.to_string(),
        }) {
            tracing::warn!(topic = %topic, "Link closed before SUBSCRIBE could be sent");
            return false;
        }

        tracing::debug!(topic = %topic, subscription_id = %id, "Wire subscribe sent");
        SubscriptionMetrics::record_subscribe();
        entry.wire = Some(id.clone());
        self.by_subscription.insert(id, topic.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn open_link() -> (WireLink, mpsc::UnboundedReceiver<WireCommand>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (_event_tx, events) = mpsc::unbounded_channel();
        (WireLink { commands, events }, command_rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WireCommand>) -> Vec<WireCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    #[test]
    fn test_two_listeners_one_wire_subscribe() {
        let mut registry = TopicRegistry::new(16);
        let (link, mut wire) = open_link();

        let _a = registry.listen("/topic/progress/x", Some(&link));
        let _b = registry.listen("/topic/progress/x", Some(&link));

        assert_eq!(
            drain(&mut wire),
            vec![WireCommand::Subscribe {
                id: "sub-0".into(),
                destination: "/topic/progress/x".into()
            }]
        );
        assert_eq!(registry.topic_info()[0].listeners, 2);
    }

    #[test]
    fn test_deferred_until_open() {
        let mut registry = TopicRegistry::new(16);
        let _a = registry.listen("/topic/completion/x", None);
        let _b = registry.listen("/topic/completion/x", None);

        let (link, mut wire) = open_link();
        assert_eq!(registry.resubscribe_live(&link), 1);
        assert_eq!(drain(&mut wire).len(), 1);

        // Already subscribed on this link
        assert_eq!(registry.resubscribe_live(&link), 0);
    }

    #[test]
    fn test_resubscribe_skips_topics_without_listeners() {
        let mut registry = TopicRegistry::new(16);
        let kept = registry.listen("/topic/progress/kept", None);
        drop(registry.listen("/topic/progress/orphan", None));

        let (link, mut wire) = open_link();
        registry.resubscribe_live(&link);

        assert_eq!(
            drain(&mut wire),
            vec![WireCommand::Subscribe {
                id: "sub-0".into(),
                destination: "/topic/progress/kept".into()
            }]
        );
        drop(kept);
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_to_all_listeners() {
        let mut registry = TopicRegistry::new(16);
        let (link, _wire) = open_link();
        let mut a = registry.listen("/topic/completion/A1", Some(&link));
        let mut b = registry.listen("/topic/completion/A1", Some(&link));
        let mut other = registry.listen("/topic/completion/B2", Some(&link));

        let outcome = registry.dispatch("sub-0", "/topic/completion/A1", r#"{"result":"ok"}"#);
        assert_eq!(outcome, DispatchOutcome::Delivered(2));

        assert_eq!(a.recv().await.unwrap()["result"], "ok");
        assert_eq!(b.recv().await.unwrap()["result"], "ok");
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_decode_failure_keeps_emitter() {
        let mut registry = TopicRegistry::new(16);
        let (link, _wire) = open_link();
        let mut rx = registry.listen("/topic/progress/x", Some(&link));

        assert_eq!(
            registry.dispatch("sub-0", "/topic/progress/x", "{not json"),
            DispatchOutcome::DecodeFailed
        );
        assert_eq!(
            registry.dispatch("sub-0", "/topic/progress/x", r#"{"message":"fine"}"#),
            DispatchOutcome::Delivered(1)
        );
        assert_eq!(rx.try_recv().unwrap()["message"], "fine");
    }

    #[test]
    fn test_stale_subscription_is_dropped_after_invalidate() {
        let mut registry = TopicRegistry::new(16);
        let (old_link, _old) = open_link();
        let mut rx = registry.listen("/topic/progress/x", Some(&old_link));

        registry.invalidate();
        let (new_link, mut wire) = open_link();
        registry.resubscribe_live(&new_link);
        assert_eq!(
            drain(&mut wire),
            vec![WireCommand::Subscribe {
                id: "sub-1".into(),
                destination: "/topic/progress/x".into()
            }]
        );

        assert_eq!(
            registry.dispatch("sub-0", "/topic/progress/x", "{}"),
            DispatchOutcome::Stale
        );
        assert_eq!(
            registry.dispatch("sub-1", "/topic/progress/x", r#"{"n":1}"#),
            DispatchOutcome::Delivered(1)
        );
        assert_eq!(rx.try_recv().unwrap()["n"], 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remove_is_idempotent_and_completes_listeners() {
        let mut registry = TopicRegistry::new(16);
        let (link, mut wire) = open_link();
        let mut rx = registry.listen("/topic/error/x", Some(&link));
        drain(&mut wire);

        assert!(registry.remove("/topic/error/x", Some(&link)));
        assert!(!registry.remove("/topic/error/x", Some(&link)));

        assert_eq!(
            drain(&mut wire),
            vec![WireCommand::Unsubscribe { id: "sub-0".into() }]
        );
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn test_remove_while_closed_sends_nothing() {
        let mut registry = TopicRegistry::new(16);
        let _rx = registry.listen("/topic/error/x", None);
        assert!(registry.remove("/topic/error/x", None));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_completes_everything() {
        let mut registry = TopicRegistry::new(16);
        let (link, mut wire) = open_link();
        let mut a = registry.listen("/topic/progress/a", Some(&link));
        let mut b = registry.listen("/topic/progress/b", None);
        drain(&mut wire);

        registry.clear(Some(&link));

        // Only the topic that reached the wire is unsubscribed
        assert!(registry.is_empty());
        assert_eq!(
            drain(&mut wire),
            vec![WireCommand::Unsubscribe { id: "sub-0".into() }]
        );
        assert!(matches!(a.try_recv(), Err(broadcast::error::TryRecvError::Closed)));
        assert!(matches!(b.try_recv(), Err(broadcast::error::TryRecvError::Closed)));
    }

    #[test]
    fn test_frame_without_subscription_routes_by_destination() {
        let mut registry = TopicRegistry::new(16);
        let mut rx = registry.listen("/topic/progress/x", None);

        // Not subscribed on a link yet
        assert_eq!(
            registry.dispatch("", "/topic/progress/x", "{}"),
            DispatchOutcome::Unrouted
        );

        let (link, _wire) = open_link();
        registry.resubscribe_live(&link);
        assert_eq!(
            registry.dispatch("", "/topic/progress/x", "{}"),
            DispatchOutcome::Delivered(1)
        );
        assert!(rx.try_recv().is_ok());
    }
}
