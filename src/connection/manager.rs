//! The task that owns the shared connection.
//!
//! Consumers talk to it only through [`Request`]s; it is the single writer of
//! the connection state, the topic registry and the current link.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use super::state::{ConnectionMachine, ConnectionState, Effect};
use crate::config::Settings;
use crate::error::Result;
use crate::metrics::LinkMetrics;
use crate::reconnect::ReconnectPolicy;
use crate::subscription::{ClientStats, DispatchOutcome, SharedPayload, TopicRegistry};
use crate::transport::{websocket_url, Connector, EndpointSource, WireCommand, WireEvent, WireLink};

/// Messages from client handles to the manager task
pub(crate) enum Request {
    Acquire,
    Release,
    Listen {
        topic: String,
        reply: oneshot::Sender<broadcast::Receiver<SharedPayload>>,
    },
    Unsubscribe {
        topic: String,
    },
    Foreground,
    Stats {
        reply: oneshot::Sender<ClientStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Result of one connect attempt, tagged with the epoch that started it
struct ConnectOutcome {
    epoch: u64,
    result: Result<WireLink>,
}

pub(crate) struct ConnectionManager {
    machine: ConnectionMachine,
    registry: TopicRegistry,
    link: Option<WireLink>,
    /// Bumped on every connect and teardown; older connect results are dropped
    epoch: u64,
    connector: Arc<dyn Connector>,
    endpoint_source: Arc<dyn EndpointSource>,
    endpoint: Option<Url>,
    status: watch::Sender<bool>,
    requests: mpsc::UnboundedReceiver<Request>,
    outcome_tx: mpsc::UnboundedSender<ConnectOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
    /// The running connect attempt, aborted on teardown
    connecting: Option<JoinHandle<()>>,
    teardown_at: Option<Instant>,
    retry_at: Option<Instant>,
}

/// Handles returned by [`ConnectionManager::spawn`]
pub(crate) struct ManagerHandle {
    pub requests: mpsc::UnboundedSender<Request>,
    pub status: watch::Receiver<bool>,
}

impl ConnectionManager {
    /// Start the manager task. It runs until shut down or until every
    /// request sender is dropped.
    pub(crate) fn spawn(
        settings: &Settings,
        connector: Arc<dyn Connector>,
        endpoint_source: Arc<dyn EndpointSource>,
    ) -> ManagerHandle {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let manager = Self {
            machine: ConnectionMachine::new(
                ReconnectPolicy::with_config(&settings.reconnect),
                settings.connection.grace_period(),
            ),
            registry: TopicRegistry::new(settings.connection.listener_capacity),
            link: None,
            epoch: 0,
            connector,
            endpoint_source,
            endpoint: None,
            status: status_tx,
            requests: request_rx,
            outcome_tx,
            outcome_rx,
            connecting: None,
            teardown_at: None,
            retry_at: None,
        };

        tokio::spawn(manager.run());

        ManagerHandle {
            requests: request_tx,
            status: status_rx,
        }
    }

    async fn run(mut self) {
        tracing::debug!("Connection manager started");

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    match request {
                        Some(request) => {
                            if !self.handle_request(request) {
                                break;
                            }
                        }
                        None => {
                            tracing::debug!("All client handles dropped");
                            self.shutdown();
                            break;
                        }
                    }
                }
                Some(outcome) = self.outcome_rx.recv() => self.handle_outcome(outcome),
                event = next_link_event(&mut self.link) => self.handle_link_event(event),
                _ = sleep_until_opt(self.teardown_at) => {
                    self.teardown_at = None;
                    tracing::debug!("Grace period elapsed");
                    let effects = self.machine.teardown_elapsed();
                    self.apply(effects);
                }
                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    let effects = self.machine.retry_elapsed();
                    self.apply(effects);
                }
            }
        }

        tracing::debug!("Connection manager stopped");
    }

    /// Returns false once the manager should stop
    fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Acquire => {
                let effects = self.machine.request();
                tracing::debug!(ref_count = self.machine.references(), "Connection requested");
                LinkMetrics::set_references(self.machine.references());
                self.apply(effects);
            }
            Request::Release => {
                let effects = self.machine.release();
                tracing::debug!(ref_count = self.machine.references(), "Connection released");
                LinkMetrics::set_references(self.machine.references());
                self.apply(effects);
            }
            Request::Listen { topic, reply } => {
                let link = if self.machine.is_connected() {
                    self.link.as_ref()
                } else {
                    None
                };
                let receiver = self.registry.listen(&topic, link);
                if reply.send(receiver).is_err() {
                    tracing::debug!(topic = %topic, "Listener gone before registration completed");
                }
            }
            Request::Unsubscribe { topic } => {
                let link = if self.machine.is_connected() {
                    self.link.as_ref()
                } else {
                    None
                };
                if !self.registry.remove(&topic, link) {
                    tracing::debug!(topic = %topic, "Unsubscribe for unknown topic ignored");
                }
            }
            Request::Foreground => {
                let effects = self.machine.foreground();
                if !effects.is_empty() {
                    tracing::info!(attempt = self.machine.attempt(), "Foregrounded, reconnecting now");
                }
                self.apply(effects);
            }
            Request::Stats { reply } => {
                let _ = reply.send(ClientStats {
                    state: self.machine.state(),
                    references: self.machine.references(),
                    reconnect_attempt: self.machine.attempt(),
                    topics: self.registry.topic_info(),
                });
            }
            Request::Shutdown { reply } => {
                tracing::info!("Shutting down realtime client");
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_outcome(&mut self, outcome: ConnectOutcome) {
        if outcome.epoch == self.epoch {
            self.connecting = None;
        }
        if outcome.epoch != self.epoch || self.machine.state() != ConnectionState::Connecting {
            // Dropping a superseded link closes it
            tracing::debug!(
                epoch = outcome.epoch,
                current_epoch = self.epoch,
                "Discarding superseded connect result"
            );
            return;
        }

        match outcome.result {
            Ok(link) => {
                LinkMetrics::record_opened();
                tracing::info!(epoch = self.epoch, ref_count = self.machine.references(), "Connected");
                self.link = Some(link);
                let effects = self.machine.connected();
                self.apply(effects);
            }
            Err(e) => {
                LinkMetrics::record_failure();
                tracing::warn!(epoch = self.epoch, error = %e, "Connection attempt failed");
                let effects = self.machine.link_failed();
                self.apply(effects);
            }
        }
    }

    fn handle_link_event(&mut self, event: Option<WireEvent>) {
        match event {
            Some(WireEvent::Message {
                subscription,
                destination,
                body,
            }) => {
                if let DispatchOutcome::Delivered(0) =
                    self.registry.dispatch(&subscription, &destination, &body)
                {
                    tracing::trace!(topic = %destination, "No live listeners for frame");
                }
            }
            Some(WireEvent::ServerError { message, body }) => {
                tracing::error!(message = %message, body = %body, "Server reported a STOMP error");
            }
            Some(WireEvent::Closed { reason }) => self.link_lost(&reason),
            None => self.link_lost("link dropped"),
        }
    }

    fn link_lost(&mut self, reason: &str) {
        self.link = None;
        LinkMetrics::record_failure();
        tracing::warn!(reason = %reason, ref_count = self.machine.references(), "Connection lost");
        let effects = self.machine.link_failed();
        self.apply(effects);
    }

    fn shutdown(&mut self) {
        let effects = self.machine.shutdown();
        LinkMetrics::set_references(0);
        self.apply(effects);
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Connect => self.start_connect(),
                Effect::ScheduleRetry { attempt, delay } => {
                    LinkMetrics::record_reconnect_scheduled();
                    tracing::info!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling reconnect"
                    );
                    self.retry_at = Some(Instant::now() + delay);
                }
                Effect::CancelRetry => self.retry_at = None,
                Effect::ScheduleTeardown(grace) => {
                    tracing::debug!(grace_ms = grace.as_millis() as u64, "Teardown scheduled");
                    self.teardown_at = Some(Instant::now() + grace);
                }
                Effect::CancelTeardown => {
                    tracing::debug!("Teardown cancelled");
                    self.teardown_at = None;
                }
                Effect::Resubscribe => {
                    if let Some(link) = self.link.as_ref() {
                        self.registry.resubscribe_live(link);
                    }
                }
                Effect::InvalidateSubscriptions => self.registry.invalidate(),
                Effect::Teardown => self.teardown(),
                Effect::EmitStatus(connected) => self.emit_status(connected),
                Effect::ReportExhausted { attempt } => {
                    tracing::warn!(
                        attempt = attempt,
                        max_attempts = self.machine.policy().max_attempts(),
                        "Max reconnection attempts reached"
                    );
                }
            }
        }
    }

    fn start_connect(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        let outcome_tx = self.outcome_tx.clone();

        let endpoint = match self.resolve_endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::error!(error = %e, "Cannot resolve server endpoint");
                let _ = outcome_tx.send(ConnectOutcome {
                    epoch,
                    result: Err(e),
                });
                return;
            }
        };

        tracing::info!(epoch = epoch, endpoint = %endpoint, "Connecting");
        let connector = Arc::clone(&self.connector);
        self.abort_connect();
        self.connecting = Some(tokio::spawn(async move {
            let result = connector.connect(&endpoint).await;
            let _ = outcome_tx.send(ConnectOutcome { epoch, result });
        }));
    }

    fn abort_connect(&mut self) {
        if let Some(task) = self.connecting.take() {
            if !task.is_finished() {
                tracing::debug!("Aborting in-flight connect attempt");
            }
            task.abort();
        }
    }

    /// Read the endpoint source once, on first use
    fn resolve_endpoint(&mut self) -> Result<Url> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.clone());
        }

        let endpoint = websocket_url(
            &self.endpoint_source.api_url(),
            &self.endpoint_source.ws_path(),
        )?;
        self.endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }

    fn teardown(&mut self) {
        self.epoch += 1;
        self.abort_connect();
        self.retry_at = None;
        self.teardown_at = None;

        let link = self.link.take();
        self.registry.clear(link.as_ref());

        if let Some(link) = link {
            link.send(WireCommand::Disconnect);
            tracing::info!("Connection closed");
        }
    }

    fn emit_status(&self, connected: bool) {
        self.status.send_if_modified(|current| {
            if *current == connected {
                return false;
            }
            *current = connected;
            true
        });
    }
}

async fn next_link_event(link: &mut Option<WireLink>) -> Option<WireEvent> {
    match link {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
