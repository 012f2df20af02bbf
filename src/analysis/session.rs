//! One consumer's analyses over the shared connection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::Instant;

use super::topics::AnalysisTopics;
use super::types::{
    AnalysisCompletion, AnalysisFailure, AnalysisMode, AnalysisOutcome, AnalysisProgress,
    AnalysisRequest, AnalysisResponse,
};
use crate::client::{ConnectionLease, RealtimeClient};
use crate::error::{RealtimeError, Result};
use crate::subscription::TopicStream;

/// Starts an analysis on the server and returns its id. The request/response
/// call itself lives outside this crate.
#[async_trait]
pub trait AnalysisStarter: Send + Sync {
    async fn start(&self, request: &AnalysisRequest) -> Result<AnalysisResponse>;
}

/// When a turn was submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnStart {
    started: Instant,
}

impl TurnStart {
    pub fn now() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Listeners on the topics currently in use
struct ActiveTopics {
    topics: AnalysisTopics,
    completion: TopicStream<AnalysisCompletion>,
    failure: TopicStream<AnalysisFailure>,
}

/// Holds a connection reference for its whole lifetime.
///
/// In simple mode each submission gets its own topics, dropped once the
/// outcome is in. In MCP mode the first turn's analysis id becomes the
/// conversation id and its topics carry every later turn.
pub struct AnalysisSession {
    client: RealtimeClient,
    starter: Arc<dyn AnalysisStarter>,
    mode: AnalysisMode,
    conversation_id: Option<String>,
    active: Option<ActiveTopics>,
    pending: HashMap<String, TurnStart>,
    _lease: ConnectionLease,
}

impl AnalysisSession {
    pub fn new(client: &RealtimeClient, starter: Arc<dyn AnalysisStarter>, mode: AnalysisMode) -> Self {
        Self {
            _lease: client.lease(),
            client: client.clone(),
            starter,
            mode,
            conversation_id: None,
            active: None,
            pending: HashMap::new(),
        }
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn topics(&self) -> Option<&AnalysisTopics> {
        self.active.as_ref().map(|a| &a.topics)
    }

    pub fn pending_turns(&self) -> usize {
        self.pending.len()
    }

    /// Start one turn
    #[tracing::instrument(skip(self, prompt), fields(mode = %self.mode))]
    pub async fn submit(&mut self, prompt: impl Into<String>) -> Result<AnalysisResponse> {
        let started = TurnStart::now();
        let request = AnalysisRequest {
            prompt: prompt.into(),
            mode: self.mode,
            conversation_id: match self.mode {
                AnalysisMode::Mcp => self.conversation_id.clone(),
                AnalysisMode::Simple => None,
            },
        };

        let response = self.starter.start(&request).await?;
        let analysis_id = response.analysis_id.clone();

        match self.mode {
            AnalysisMode::Simple => self.listen(&analysis_id).await?,
            AnalysisMode::Mcp if self.conversation_id.is_none() => {
                tracing::info!(conversation_id = %analysis_id, "Conversation started");
                self.conversation_id = Some(analysis_id.clone());
                self.listen(&analysis_id).await?;
            }
            AnalysisMode::Mcp => {
                tracing::debug!(analysis_id = %analysis_id, "Reusing conversation topics");
            }
        }

        self.pending.insert(analysis_id, started);
        Ok(response)
    }

    /// Wait for the current turn to complete or fail.
    ///
    /// A completion without `durationMs` gets the locally measured time since
    /// its turn was submitted.
    pub async fn next_outcome(&mut self) -> Result<AnalysisOutcome> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| RealtimeError::Analysis("no analysis submitted".into()))?;

        let outcome = tokio::select! {
            Some(completion) = active.completion.next() => AnalysisOutcome::Completed(completion),
            Some(failure) = active.failure.next() => AnalysisOutcome::Failed(failure),
            else => return Err(RealtimeError::ClientClosed),
        };

        let outcome = match outcome {
            AnalysisOutcome::Completed(mut completion) => {
                let turn = self.take_turn(completion.analysis_id.as_deref());
                if completion.duration_ms.is_none() {
                    completion.duration_ms = Some(turn.map(|t| t.elapsed_ms()).unwrap_or(0));
                }
                tracing::info!(
                    analysis_id = ?completion.analysis_id,
                    duration_ms = ?completion.duration_ms,
                    "Analysis completed"
                );
                AnalysisOutcome::Completed(completion)
            }
            AnalysisOutcome::Failed(failure) => {
                self.take_turn(None);
                tracing::warn!(error = %failure.error, "Analysis failed");
                AnalysisOutcome::Failed(failure)
            }
        };

        if self.mode == AnalysisMode::Simple {
            self.drop_topics();
        }

        Ok(outcome)
    }

    /// Progress updates of the topics in use
    pub async fn progress(&self) -> Result<TopicStream<AnalysisProgress>> {
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| RealtimeError::Analysis("no analysis submitted".into()))?;
        self.client.get_messages(active.topics.progress()).await
    }

    /// Forget the conversation and its topics
    pub fn reset(&mut self) {
        self.drop_topics();
        self.conversation_id = None;
        self.pending.clear();
    }

    async fn listen(&mut self, correlation_id: &str) -> Result<()> {
        self.drop_topics();

        let topics = AnalysisTopics::new(correlation_id);
        let completion = self.client.get_messages(topics.completion()).await?;
        let failure = self.client.get_messages(topics.error()).await?;
        tracing::debug!(correlation_id = %correlation_id, "Listening for analysis events");

        self.active = Some(ActiveTopics {
            topics,
            completion,
            failure,
        });
        Ok(())
    }

    fn drop_topics(&mut self) {
        if let Some(active) = self.active.take() {
            for topic in active.topics.all() {
                self.client.unsubscribe(topic);
            }
        }
    }

    /// The turn for `analysis_id`, or the most recent one
    fn take_turn(&mut self, analysis_id: Option<&str>) -> Option<TurnStart> {
        if let Some(turn) = analysis_id.and_then(|id| self.pending.remove(id)) {
            return Some(turn);
        }

        let latest = self
            .pending
            .iter()
            .max_by_key(|(_, turn)| turn.started)
            .map(|(id, _)| id.clone())?;
        self.pending.remove(&latest)
    }
}

impl Drop for AnalysisSession {
    fn drop(&mut self) {
        self.drop_topics();
    }
}
