use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the server lives. Only `api_url` comes from the host application;
/// the WebSocket URL is derived from it.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Path of the raw WebSocket leg of the server's SockJS endpoint
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Delay between the last release and the actual teardown
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Upper bound for the WebSocket + STOMP handshake
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Heart-beat we offer to send (0 disables)
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_outgoing_ms: u64,
    /// Heart-beat we ask the server to send (0 disables)
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_incoming_ms: u64,
    /// Buffered payloads per topic before a slow listener starts lagging
    #[serde(default = "default_listener_capacity")]
    pub listener_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Ascending delay table, indexed by attempt and clamped to the last entry
    #[serde(default = "default_reconnect_delays")]
    pub delays_ms: Vec<u64>,
    /// Attempts after which "giving up" is reported. Retries continue.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Jitter factor (0.0 to 1.0)
    #[serde(default)]
    pub jitter_factor: f64,
}

/// Topics tailed by the command-line binary
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Subscriber settings for the binary; `RUST_LOG` overrides `filter`
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_api_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_ws_path() -> String {
    "/ws/websocket".to_string()
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_ms() -> u64 {
    4_000
}

fn default_listener_capacity() -> usize {
    256
}

fn default_reconnect_delays() -> Vec<u64> {
    vec![1_000, 2_000, 4_000, 8_000, 16_000]
}

fn default_max_attempts() -> u32 {
    5
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("endpoint.api_url", default_api_url())?
            .set_default("endpoint.ws_path", default_ws_path())?
            .set_default("connection.grace_period_ms", default_grace_period_ms())?
            .set_default("connection.connect_timeout_ms", default_connect_timeout_ms())?
            .set_default("reconnect.max_attempts", default_max_attempts())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // REALTIME_ENDPOINT__API_URL, REALTIME_CONNECTION__GRACE_PERIOD_MS, ...
            .add_source(
                Environment::with_prefix("REALTIME")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("reconnect.delays_ms")
                    .with_list_parse_key("watch.topics"),
            );

        builder.build()?.try_deserialize()
    }
}

impl ConnectionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ws_path: default_ws_path(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_outgoing_ms: default_heartbeat_ms(),
            heartbeat_incoming_ms: default_heartbeat_ms(),
            listener_capacity: default_listener_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::Text,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delays_ms: default_reconnect_delays(),
            max_attempts: default_max_attempts(),
            jitter_factor: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.endpoint.api_url, "http://localhost:8080");
        assert_eq!(settings.endpoint.ws_path, "/ws/websocket");
        assert_eq!(settings.connection.grace_period(), Duration::from_secs(5));
        assert_eq!(settings.connection.heartbeat_incoming_ms, 4_000);
        assert_eq!(settings.connection.listener_capacity, 256);
        assert_eq!(settings.reconnect.delays_ms, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
        assert_eq!(settings.reconnect.max_attempts, 5);
        assert!(settings.watch.topics.is_empty());
        assert_eq!(settings.logging.filter, "info");
        assert_eq!(settings.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{"endpoint": {"api_url": "https://analysis.example.com"}, "reconnect": {"max_attempts": 9}}"#,
        )
        .unwrap();
        assert_eq!(settings.endpoint.api_url, "https://analysis.example.com");
        assert_eq!(settings.endpoint.ws_path, "/ws/websocket");
        assert_eq!(settings.reconnect.max_attempts, 9);
        assert_eq!(settings.reconnect.delays_ms.len(), 5);
        assert_eq!(settings.connection.connect_timeout(), Duration::from_secs(10));
    }
}
