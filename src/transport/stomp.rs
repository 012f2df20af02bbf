//! Minimal STOMP 1.2 frame codec.
//!
//! Only the frames a subscribing client needs are modelled. Each WebSocket
//! text message carries one frame terminated by NUL, or a bare EOL
//! heart-beat.

use std::fmt;
use std::time::Duration;

use crate::error::{RealtimeError, Result};

pub const ACCEPT_VERSION: &str = "1.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(line: &str) -> Result<Self> {
        match line {
            "CONNECT" | "STOMP" => Ok(Command::Connect),
            "CONNECTED" => Ok(Command::Connected),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "DISCONNECT" => Ok(Command::Disconnect),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            other => Err(RealtimeError::Protocol(format!("unknown command '{}'", other))),
        }
    }

    /// CONNECT and CONNECTED headers are never escaped
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Result of decoding one WebSocket text message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Heartbeat,
    Frame(Frame),
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of a header; repeated headers keep the first occurrence
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, heartbeat: Heartbeat) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", ACCEPT_VERSION)
            .header("host", host)
            .header("heart-beat", heartbeat.to_string())
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if self.command.escapes_headers() {
                out.push_str(&escape(name));
                out.push(':');
                out.push_str(&escape(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Decode a single WebSocket text message
pub fn decode(text: &str) -> Result<Decoded> {
    let trimmed = text.trim_start_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Ok(Decoded::Heartbeat);
    }

    let (head, rest) = split_head(trimmed)
        .ok_or_else(|| RealtimeError::Protocol("frame without header terminator".into()))?;

    let mut lines = head.lines();
    let command = Command::parse(lines.next().unwrap_or_default().trim_end_matches('\r'))?;

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RealtimeError::Protocol(format!("malformed header '{}'", line)))?;
        if command.escapes_headers() {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let frame_headers = Frame {
        command,
        headers,
        body: String::new(),
    };

    let body = match frame_headers.get("content-length") {
        Some(len) => {
            let len: usize = len
                .parse()
                .map_err(|_| RealtimeError::Protocol(format!("bad content-length '{}'", len)))?;
            rest.get(..len)
                .ok_or_else(|| RealtimeError::Protocol("body shorter than content-length".into()))?
        }
        None => rest.split('\0').next().unwrap_or_default(),
    };

    Ok(Decoded::Frame(Frame {
        body: body.to_string(),
        ..frame_headers
    }))
}

fn split_head(text: &str) -> Option<(&str, &str)> {
    let lf = text.find("\n\n").map(|i| (i, 2));
    let crlf = text.find("\r\n\r\n").map(|i| (i, 4));
    let (idx, sep) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 < b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&text[..idx], &text[idx + sep..]))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(RealtimeError::Protocol(format!(
                    "invalid header escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// A `heart-beat` header value: `outgoing,incoming` in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub outgoing_ms: u64,
    pub incoming_ms: u64,
}

impl Heartbeat {
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self {
            outgoing_ms,
            incoming_ms,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let (out, inc) = value
            .split_once(',')
            .ok_or_else(|| RealtimeError::Protocol(format!("bad heart-beat '{}'", value)))?;
        let parse = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| RealtimeError::Protocol(format!("bad heart-beat '{}'", value)))
        };
        Ok(Self::new(parse(out)?, parse(inc)?))
    }

    /// Negotiate with the server's CONNECTED value.
    ///
    /// Returns (how often we must send, how often we expect to receive);
    /// `None` where either side declined.
    pub fn negotiate(&self, server: &Heartbeat) -> (Option<Duration>, Option<Duration>) {
        let pick = |ours: u64, theirs: u64| {
            if ours == 0 || theirs == 0 {
                None
            } else {
                Some(Duration::from_millis(ours.max(theirs)))
            }
        };
        (
            pick(self.outgoing_ms, server.incoming_ms),
            pick(self.incoming_ms, server.outgoing_ms),
        )
    }
}

impl fmt::Display for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.outgoing_ms, self.incoming_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_subscribe() {
        let frame = Frame::subscribe("sub-0", "/topic/progress/a1");
        assert_eq!(
            frame.encode(),
            "SUBSCRIBE\nid:sub-0\ndestination:/topic/progress/a1\nack:auto\n\n\0"
        );
    }

    #[test]
    fn test_encode_connect_is_not_escaped() {
        let frame = Frame::connect("localhost:8080", Heartbeat::new(4000, 4000));
        let encoded = frame.encode();
        assert!(encoded.starts_with("CONNECT\naccept-version:1.2\nhost:localhost:8080\n"));
        assert!(encoded.contains("heart-beat:4000,4000\n"));
        assert!(encoded.ends_with("\n\n\0"));
    }

    #[test]
    fn test_decode_message() {
        let text = "MESSAGE\nsubscription:sub-3\ndestination:/topic/completion/A1\nmessage-id:7\ncontent-type:application/json\n\n{\"completed\":true}\0";
        let Decoded::Frame(frame) = decode(text).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("subscription"), Some("sub-3"));
        assert_eq!(frame.get("destination"), Some("/topic/completion/A1"));
        assert_eq!(frame.body, "{\"completed\":true}");
    }

    #[test]
    fn test_decode_honours_content_length_with_nul_in_body() {
        let text = "MESSAGE\ncontent-length:5\n\na\0bcd\0";
        let Decoded::Frame(frame) = decode(text).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(frame.body, "a\0bcd");
    }

    #[test]
    fn test_decode_crlf_and_leading_heartbeats() {
        let text = "\n\r\nCONNECTED\r\nversion:1.2\r\nheart-beat:0,10000\r\n\r\n\0";
        let Decoded::Frame(frame) = decode(text).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.get("version"), Some("1.2"));
        assert_eq!(frame.get("heart-beat"), Some("0,10000"));
    }

    #[test]
    fn test_decode_heartbeat() {
        assert_eq!(decode("\n").unwrap(), Decoded::Heartbeat);
        assert_eq!(decode("\r\n").unwrap(), Decoded::Heartbeat);
    }

    #[test]
    fn test_header_escaping() {
        let frame = Frame::new(Command::Message).header("note", "a:b\nc\\d");
        let encoded = frame.encode();
        assert!(encoded.contains("note:a\\cb\\nc\\\\d\n"));

        let Decoded::Frame(decoded) = decode(&encoded).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(decoded.get("note"), Some("a:b\nc\\d"));
    }

    #[test]
    fn test_repeated_header_keeps_first() {
        let text = "MESSAGE\nfoo:first\nfoo:second\n\n\0";
        let Decoded::Frame(frame) = decode(text).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(frame.get("foo"), Some("first"));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(decode("BOGUS\n\n\0").is_err());
    }

    #[test]
    fn test_missing_header_terminator_rejected() {
        assert!(decode("MESSAGE\nfoo:bar").is_err());
    }

    #[test]
    fn test_heartbeat_negotiation() {
        let ours = Heartbeat::new(4000, 4000);
        let (send, recv) = ours.negotiate(&Heartbeat::new(10000, 0));
        assert_eq!(send, None);
        assert_eq!(recv, Some(Duration::from_millis(10000)));

        let (send, recv) = ours.negotiate(&Heartbeat::new(1000, 2000));
        assert_eq!(send, Some(Duration::from_millis(4000)));
        assert_eq!(recv, Some(Duration::from_millis(4000)));
    }

    #[test]
    fn test_heartbeat_parse() {
        assert_eq!(Heartbeat::parse("0, 500").unwrap(), Heartbeat::new(0, 500));
        assert!(Heartbeat::parse("nope").is_err());
    }
}
