//! Wire transport for the shared connection.
//!
//! The connection manager never touches sockets directly. It asks a
//! [`Connector`] for a [`WireLink`]: a pair of channels carrying
//! [`WireCommand`]s out and [`WireEvent`]s in. The production connector
//! speaks STOMP 1.2 over a WebSocket; tests plug in scripted links.
//!
//! A link is dead once its event channel yields `None` or a
//! [`WireEvent::Closed`].

mod endpoint;
pub mod stomp;
mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::Result;

pub use endpoint::{websocket_url, EndpointSource};
pub use websocket::StompConnector;

/// Commands the manager sends down an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCommand {
    Subscribe { id: String, destination: String },
    Unsubscribe { id: String },
    Disconnect,
}

/// Events a link reports back to the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Message {
        subscription: String,
        destination: String,
        body: String,
    },
    /// Server-side protocol failure; the link is closing
    ServerError { message: String, body: String },
    Closed { reason: String },
}

/// An established connection, seen as two channels
#[derive(Debug)]
pub struct WireLink {
    pub commands: mpsc::UnboundedSender<WireCommand>,
    pub events: mpsc::UnboundedReceiver<WireEvent>,
}

impl WireLink {
    /// Send a command, reporting whether the link still accepted it
    pub fn send(&self, command: WireCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// Opens links to the server
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Url) -> Result<WireLink>;
}
