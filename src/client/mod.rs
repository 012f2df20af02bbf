//! Consumer-facing handle to the shared realtime connection.
//!
//! A [`RealtimeClient`] is cheap to clone; all clones talk to the same
//! manager task and therefore share one connection. Construct one per
//! process and pass it to whoever needs realtime events.

mod lease;

pub use lease::ConnectionLease;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::WatchStream;

use crate::config::Settings;
use crate::connection::{ConnectionManager, Request};
use crate::error::{RealtimeError, Result};
use crate::subscription::{ClientStats, TopicStream};
use crate::transport::{Connector, EndpointSource, StompConnector};

#[derive(Clone)]
pub struct RealtimeClient {
    requests: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<bool>,
}

impl RealtimeClient {
    /// Client speaking STOMP over WebSocket to `settings.endpoint`.
    ///
    /// Must be called inside a Tokio runtime: the manager task is spawned
    /// immediately. No connection is made until the first
    /// [`request_connection`](Self::request_connection).
    pub fn new(settings: &Settings) -> Self {
        Self::with_connector(
            settings,
            Arc::new(StompConnector::new(&settings.connection)),
            Arc::new(settings.endpoint.clone()),
        )
    }

    pub fn with_connector(
        settings: &Settings,
        connector: Arc<dyn Connector>,
        endpoint: Arc<dyn EndpointSource>,
    ) -> Self {
        let handle = ConnectionManager::spawn(settings, connector, endpoint);
        Self {
            requests: handle.requests,
            status: handle.status,
        }
    }

    /// Take a reference on the shared connection, connecting if needed.
    /// Each call must be balanced by one
    /// [`release_connection`](Self::release_connection).
    pub fn request_connection(&self) {
        self.send(Request::Acquire);
    }

    /// Drop one reference. At zero the connection closes after the grace
    /// period unless it is requested again in the meantime.
    pub fn release_connection(&self) {
        self.send(Request::Release);
    }

    /// Request the connection and release it when the lease is dropped
    pub fn lease(&self) -> ConnectionLease {
        ConnectionLease::acquire(self.clone())
    }

    /// Listen on `topic`.
    ///
    /// Every call returns a new listener on the topic's single emitter; the
    /// wire subscription is made once per topic and survives reconnects.
    /// Payloads that do not deserialize into `T` are skipped.
    ///
    /// Each listener buffers up to `connection.listener_capacity` payloads
    /// (256 by default). A listener that falls further behind loses the
    /// oldest buffered payloads; the stream logs the lag and carries on with
    /// the newest ones. Raise the capacity for consumers that poll slowly.
    pub async fn get_messages<T: DeserializeOwned>(&self, topic: &str) -> Result<TopicStream<T>> {
        let (reply, receiver) = oneshot::channel();
        self.requests
            .send(Request::Listen {
                topic: topic.to_string(),
                reply,
            })
            .map_err(|_| RealtimeError::ClientClosed)?;

        let listener = receiver.await.map_err(|_| RealtimeError::ClientClosed)?;
        Ok(TopicStream::new(topic, listener))
    }

    /// Stop `topic` for every listener. Unknown topics are ignored.
    pub fn unsubscribe(&self, topic: &str) {
        self.send(Request::Unsubscribe {
            topic: topic.to_string(),
        });
    }

    pub fn is_connected(&self) -> bool {
        *self.status.borrow()
    }

    /// Connectivity as a watch channel; starts at `false`
    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.status.clone()
    }

    /// Connectivity changes as a stream, current value first
    pub fn status_stream(&self) -> WatchStream<bool> {
        WatchStream::new(self.status.clone())
    }

    /// The host application regained focus. Reconnects right away if the
    /// connection is wanted but down, skipping any pending backoff.
    pub fn notify_foreground(&self) {
        self.send(Request::Foreground);
    }

    pub async fn stats(&self) -> Result<ClientStats> {
        let (reply, receiver) = oneshot::channel();
        self.requests
            .send(Request::Stats { reply })
            .map_err(|_| RealtimeError::ClientClosed)?;
        receiver.await.map_err(|_| RealtimeError::ClientClosed)
    }

    /// Close the connection now and complete every topic, regardless of
    /// outstanding references. Later calls on any clone fail or are ignored.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        self.requests
            .send(Request::Shutdown { reply })
            .map_err(|_| RealtimeError::ClientClosed)?;
        receiver.await.map_err(|_| RealtimeError::ClientClosed)
    }

    fn send(&self, request: Request) {
        if self.requests.send(request).is_err() {
            tracing::warn!("Realtime client has been shut down, request ignored");
        }
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
