//! STOMP-over-WebSocket connector built on tokio-tungstenite

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::stomp::{self, Command, Decoded, Frame, Heartbeat};
use super::{Connector, WireCommand, WireEvent, WireLink};
use crate::config::ConnectionConfig;
use crate::error::{RealtimeError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Missing inbound traffic for this many negotiated intervals kills the link
const INBOUND_GRACE_FACTOR: u32 = 2;

/// Opens STOMP sessions over a WebSocket and drives each one from a
/// dedicated IO task.
#[derive(Debug, Clone)]
pub struct StompConnector {
    connect_timeout: Duration,
    heartbeat: Heartbeat,
}

impl StompConnector {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            heartbeat: Heartbeat::new(config.heartbeat_outgoing_ms, config.heartbeat_incoming_ms),
        }
    }

    async fn handshake(&self, endpoint: &Url) -> Result<(WsStream, Heartbeat)> {
        let (mut ws, _response) = connect_async(endpoint.as_str()).await?;

        let host = endpoint.host_str().unwrap_or("localhost");
        let connect = Frame::connect(host, self.heartbeat);
        ws.send(Message::Text(connect.encode().into())).await?;

        while let Some(msg) = ws.next().await {
            let text = match msg? {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            match stomp::decode(&text)? {
                Decoded::Heartbeat => continue,
                Decoded::Frame(frame) if frame.command == Command::Connected => {
                    let server = frame
                        .get("heart-beat")
                        .map(Heartbeat::parse)
                        .transpose()?
                        .unwrap_or_default();
                    tracing::debug!(
                        version = frame.get("version").unwrap_or("1.0"),
                        heartbeat = %server,
                        "STOMP session established"
                    );
                    return Ok((ws, server));
                }
                Decoded::Frame(frame) if frame.command == Command::Error => {
                    return Err(RealtimeError::Handshake(
                        frame.get("message").unwrap_or(&frame.body).to_string(),
                    ));
                }
                Decoded::Frame(frame) => {
                    return Err(RealtimeError::Handshake(format!(
                        "unexpected {} before CONNECTED",
                        frame.command
                    )));
                }
            }
        }

        Err(RealtimeError::Handshake(
            "connection closed before CONNECTED".into(),
        ))
    }
}

impl Default for StompConnector {
    fn default() -> Self {
        Self::new(&ConnectionConfig::default())
    }
}

#[async_trait]
impl Connector for StompConnector {
    #[tracing::instrument(name = "stomp.connect", skip(self, endpoint), fields(endpoint = %endpoint))]
    async fn connect(&self, endpoint: &Url) -> Result<WireLink> {
        let (ws, server_heartbeat) = timeout(self.connect_timeout, self.handshake(endpoint))
            .await
            .map_err(|_| {
                RealtimeError::Timeout(format!(
                    "no CONNECTED within {}ms",
                    self.connect_timeout.as_millis()
                ))
            })??;

        let (send_every, expect_every) = self.heartbeat.negotiate(&server_heartbeat);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_session(ws, command_rx, event_tx, send_every, expect_every));

        Ok(WireLink {
            commands: command_tx,
            events: event_rx,
        })
    }
}

/// IO loop for one established session. Ends by reporting `Closed`.
async fn run_session(
    ws: WsStream,
    mut commands: mpsc::UnboundedReceiver<WireCommand>,
    events: mpsc::UnboundedSender<WireEvent>,
    send_every: Option<Duration>,
    expect_every: Option<Duration>,
) {
    let (mut write, mut read) = ws.split();

    let far_future = Duration::from_secs(86_400 * 365);
    let send_interval = send_every.unwrap_or(far_future);
    let inbound_deadline = expect_every
        .map(|d| d * INBOUND_GRACE_FACTOR)
        .unwrap_or(far_future);

    let mut next_heartbeat = Instant::now() + send_interval;
    let mut read_deadline = Instant::now() + inbound_deadline;

    let reason = loop {
        tokio::select! {
            cmd = commands.recv() => {
                let frame = match cmd {
                    Some(WireCommand::Subscribe { id, destination }) => Frame::subscribe(&id, &destination),
                    Some(WireCommand::Unsubscribe { id }) => Frame::unsubscribe(&id),
                    Some(WireCommand::Disconnect) | None => {
                        let _ = write.send(Message::Text(Frame::disconnect().encode().into())).await;
                        let _ = write.close().await;
                        break "client disconnect".to_string();
                    }
                };
                if let Err(e) = write.send(Message::Text(frame.encode().into())).await {
                    break format!("send failed: {}", e);
                }
                next_heartbeat = Instant::now() + send_interval;
            }
            msg = read.next() => {
                read_deadline = Instant::now() + inbound_deadline;
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reason) = handle_text(&text, &events) {
                            break reason;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("server closed ({}): {}", u16::from(f.code), f.reason.as_str()))
                            .unwrap_or_else(|| "server closed".to_string());
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by tungstenite; binary is unused
                    }
                    Some(Err(e)) => break format!("read error: {}", e),
                    None => break "stream ended".to_string(),
                }
            }
            _ = tokio::time::sleep_until(next_heartbeat), if send_every.is_some() => {
                if let Err(e) = write.send(Message::Text("\n".into())).await {
                    break format!("heart-beat send failed: {}", e);
                }
                next_heartbeat = Instant::now() + send_interval;
            }
            _ = tokio::time::sleep_until(read_deadline), if expect_every.is_some() => {
                break format!("no inbound traffic for {}ms", inbound_deadline.as_millis());
            }
        }
    };

    tracing::debug!(reason = %reason, "STOMP session ended");
    let _ = events.send(WireEvent::Closed { reason });
}

/// Translate one inbound text message. Returns a close reason when the
/// session must end.
fn handle_text(text: &str, events: &mpsc::UnboundedSender<WireEvent>) -> Option<String> {
    let frame = match stomp::decode(text) {
        Ok(Decoded::Heartbeat) => return None,
        Ok(Decoded::Frame(frame)) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping undecodable STOMP frame");
            return None;
        }
    };

    match frame.command {
        Command::Message => {
            let event = WireEvent::Message {
                subscription: frame.get("subscription").unwrap_or_default().to_string(),
                destination: frame.get("destination").unwrap_or_default().to_string(),
                body: frame.body,
            };
            if events.send(event).is_err() {
                return Some("link dropped by manager".to_string());
            }
            None
        }
        Command::Error => {
            let message = frame.get("message").unwrap_or("STOMP error").to_string();
            let _ = events.send(WireEvent::ServerError {
                message: message.clone(),
                body: frame.body,
            });
            Some(format!("server error: {}", message))
        }
        Command::Receipt | Command::Connected => None,
        other => {
            tracing::debug!(command = %other, "Ignoring unexpected client-side frame");
            None
        }
    }
}
