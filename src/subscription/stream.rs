//! Consumer-side view of a topic's fan-out emitter

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Payload as decoded once by the registry and shared by every listener
pub type SharedPayload = Arc<Value>;

/// A listener on one topic.
///
/// Yields every payload that arrives after the listener was created,
/// converted to `T`. Payloads that do not fit `T` are logged and skipped.
/// The stream ends when the topic is unsubscribed or the connection is torn
/// down; dropping it only removes this listener.
pub struct TopicStream<T> {
    topic: Arc<str>,
    inner: BroadcastStream<SharedPayload>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TopicStream<T> {
    pub(crate) fn new(topic: &str, receiver: broadcast::Receiver<SharedPayload>) -> Self {
        Self {
            topic: Arc::from(topic),
            inner: BroadcastStream::new(receiver),
            _marker: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl<T: DeserializeOwned> Stream for TopicStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        loop {
            match ready!(this.inner.poll_next_unpin(cx)) {
                None => return Poll::Ready(None),
                Some(Ok(payload)) => match T::deserialize(&*payload) {
                    Ok(item) => return Poll::Ready(Some(item)),
                    Err(e) => {
                        tracing::warn!(
                            topic = %this.topic,
                            error = %e,
                            "Payload does not match listener type, skipping"
                        );
                    }
                },
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(
                        topic = %this.topic,
                        skipped = skipped,
                        "Listener lagged behind, payloads skipped"
                    );
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for TopicStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicStream")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
