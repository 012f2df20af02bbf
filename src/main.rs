use anyhow::Result;
use futures::stream::{SelectAll, StreamExt};
use serde_json::Value;
use tokio::signal;

use analysis_realtime_client::config::Settings;
use analysis_realtime_client::metrics;
use analysis_realtime_client::subscription::TopicStream;
use analysis_realtime_client::telemetry;
use analysis_realtime_client::RealtimeClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    telemetry::init_tracing(&settings.logging)?;
    tracing::info!(api_url = %settings.endpoint.api_url, "Configuration loaded");

    if settings.watch.topics.is_empty() {
        tracing::warn!("No topics configured, set REALTIME_WATCH__TOPICS to tail some");
    }

    let client = RealtimeClient::new(&settings);
    let lease = client.lease();

    let mut status = client.status_stream();
    tokio::spawn(async move {
        while let Some(connected) = status.next().await {
            tracing::info!(connected = connected, "Connection status");
        }
    });

    let mut streams: SelectAll<_> = SelectAll::new();
    for topic in &settings.watch.topics {
        let stream: TopicStream<Value> = client.get_messages(topic).await?;
        let topic = topic.clone();
        streams.push(stream.map(move |payload| (topic.clone(), payload)).boxed());
    }

    loop {
        tokio::select! {
            Some((topic, payload)) = streams.next(), if !streams.is_empty() => {
                println!("{} {}", topic, payload);
            }
            _ = signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    drop(lease);
    client.shutdown().await?;

    match metrics::encode_metrics() {
        Ok(snapshot) => tracing::debug!(metrics = %snapshot, "Final metrics"),
        Err(e) => tracing::warn!(error = %e, "Failed to encode metrics"),
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
