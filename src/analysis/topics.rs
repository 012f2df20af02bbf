/// Kind of event published for an analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Progress,
    Completion,
    Error,
}

impl EventClass {
    pub const ALL: [EventClass; 3] = [EventClass::Progress, EventClass::Completion, EventClass::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::Progress => "progress",
            EventClass::Completion => "completion",
            EventClass::Error => "error",
        }
    }

    /// `/topic/<class>/<correlation id>`
    pub fn topic(&self, correlation_id: &str) -> String {
        format!("/topic/{}/{}", self.as_str(), correlation_id)
    }

    /// Split a topic name back into class and correlation id
    pub fn parse_topic(topic: &str) -> Option<(EventClass, &str)> {
        let rest = topic.strip_prefix("/topic/")?;
        let (class, id) = rest.split_once('/')?;
        if id.is_empty() {
            return None;
        }
        let class = Self::ALL.into_iter().find(|c| c.as_str() == class)?;
        Some((class, id))
    }
}

impl std::fmt::Display for EventClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three topics of one correlation id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisTopics {
    correlation_id: String,
    progress: String,
    completion: String,
    error: String,
}

impl AnalysisTopics {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        Self {
            progress: EventClass::Progress.topic(&correlation_id),
            completion: EventClass::Completion.topic(&correlation_id),
            error: EventClass::Error.topic(&correlation_id),
            correlation_id,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn progress(&self) -> &str {
        &self.progress
    }

    pub fn completion(&self) -> &str {
        &self.completion
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn get(&self, class: EventClass) -> &str {
        match class {
            EventClass::Progress => &self.progress,
            EventClass::Completion => &self.completion,
            EventClass::Error => &self.error,
        }
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.progress, &self.completion, &self.error]
    }
}
