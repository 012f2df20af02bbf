//! Endpoint resolution: base API URL in, WebSocket URL out

use url::Url;

use crate::config::EndpointConfig;
use crate::error::{RealtimeError, Result};

/// Supplies the server's base URL. Read once, before the first connect.
pub trait EndpointSource: Send + Sync + 'static {
    fn api_url(&self) -> String;

    fn ws_path(&self) -> String {
        "/ws/websocket".to_string()
    }
}

impl EndpointSource for EndpointConfig {
    fn api_url(&self) -> String {
        self.api_url.clone()
    }

    fn ws_path(&self) -> String {
        self.ws_path.clone()
    }
}

/// Build the WebSocket URL from an HTTP(S) base URL and a path
pub fn websocket_url(api_url: &str, ws_path: &str) -> Result<Url> {
    let mut url = Url::parse(api_url)
        .map_err(|e| RealtimeError::InvalidEndpoint(format!("{}: {}", api_url, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RealtimeError::InvalidEndpoint(format!(
                "unsupported scheme '{}' in {}",
                other, api_url
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RealtimeError::InvalidEndpoint(api_url.to_string()))?;

    let base_path = url.path().trim_end_matches('/').to_string();
    let suffix = ws_path.trim_start_matches('/');
    url.set_path(&format!("{}/{}", base_path, suffix));
    url.set_query(None);
    url.set_fragment(None);

    Ok(url)
}
