//! Scripted in-memory transport for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use url::Url;

use analysis_realtime_client::config::Settings;
use analysis_realtime_client::error::{RealtimeError, Result};
use analysis_realtime_client::transport::{Connector, WireCommand, WireEvent, WireLink};
use analysis_realtime_client::RealtimeClient;

/// Connector whose links are driven by the test through [`MockServer`]
pub struct MockConnector {
    connects: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_remaining: AtomicUsize,
    connect_delay: Mutex<Duration>,
    connect_times: Mutex<Vec<Instant>>,
    endpoints: Mutex<Vec<Url>>,
    links: mpsc::UnboundedSender<ServerLink>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Url) -> Result<WireLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(self);
        self.connect_times.lock().unwrap().push(Instant::now());
        self.endpoints.lock().unwrap().push(endpoint.clone());

        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RealtimeError::Handshake("connection refused".into()));
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let _ = self.links.send(ServerLink {
            commands: command_rx,
            events: event_tx,
        });
        Ok(WireLink { commands, events })
    }
}

/// Counts a running connect until it returns or is dropped
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(connector: &'a MockConnector) -> Self {
        let now = connector.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        connector.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(&connector.in_flight)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Test-side handle on the connector
pub struct MockServer {
    connector: Arc<MockConnector>,
    links: mpsc::UnboundedReceiver<ServerLink>,
}

impl MockServer {
    pub fn new() -> Self {
        let (links_tx, links) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            connects: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail_remaining: AtomicUsize::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            connect_times: Mutex::new(Vec::new()),
            endpoints: Mutex::new(Vec::new()),
            links: links_tx,
        });
        Self { connector, links }
    }

    pub fn client(&self, settings: &Settings) -> RealtimeClient {
        RealtimeClient::with_connector(
            settings,
            self.connector.clone(),
            Arc::new(settings.endpoint.clone()),
        )
    }

    /// Next successfully opened link
    pub async fn accept(&mut self) -> ServerLink {
        tokio::time::timeout(Duration::from_secs(600), self.links.recv())
            .await
            .expect("no link opened in time")
            .expect("connector dropped")
    }

    pub fn connects(&self) -> usize {
        self.connector.connects.load(Ordering::SeqCst)
    }

    /// Connects running right now
    pub fn in_flight(&self) -> usize {
        self.connector.in_flight.load(Ordering::SeqCst)
    }

    /// Most connects that were ever running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.connector.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, n: usize) {
        self.connector.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connector.connect_delay.lock().unwrap() = delay;
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connector.connect_times.lock().unwrap().clone()
    }

    pub fn endpoints(&self) -> Vec<Url> {
        self.connector.endpoints.lock().unwrap().clone()
    }
}

/// Server end of one link
pub struct ServerLink {
    pub commands: mpsc::UnboundedReceiver<WireCommand>,
    pub events: mpsc::UnboundedSender<WireEvent>,
}

impl ServerLink {
    /// Commands sent so far, without waiting
    pub fn drain(&mut self) -> Vec<WireCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.commands.try_recv() {
            out.push(cmd);
        }
        out
    }

    pub fn publish(&self, subscription: &str, destination: &str, body: &str) {
        let _ = self.events.send(WireEvent::Message {
            subscription: subscription.to_string(),
            destination: destination.to_string(),
            body: body.to_string(),
        });
    }

    pub fn close(&self, reason: &str) {
        let _ = self.events.send(WireEvent::Closed {
            reason: reason.to_string(),
        });
    }
}

/// Subscription ids sent for `destination`
pub fn subscriptions_for(commands: &[WireCommand], destination: &str) -> Vec<String> {
    commands
        .iter()
        .filter_map(|cmd| match cmd {
            WireCommand::Subscribe { id, destination: d } if d == destination => Some(id.clone()),
            _ => None,
        })
        .collect()
}

pub fn count_subscribes(commands: &[WireCommand]) -> usize {
    commands
        .iter()
        .filter(|cmd| matches!(cmd, WireCommand::Subscribe { .. }))
        .count()
}

pub fn count_unsubscribes(commands: &[WireCommand]) -> usize {
    commands
        .iter()
        .filter(|cmd| matches!(cmd, WireCommand::Unsubscribe { .. }))
        .count()
}

/// Wait for the status to reach `expected`
pub async fn wait_status(status: &mut watch::Receiver<bool>, expected: bool) {
    tokio::time::timeout(Duration::from_secs(600), status.wait_for(|c| *c == expected))
        .await
        .expect("status did not change in time")
        .expect("manager stopped");
}

/// Let spawned tasks run without moving the clock
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
