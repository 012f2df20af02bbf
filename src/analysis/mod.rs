//! Analysis sessions on top of the realtime client.
//!
//! An analysis is started through an [`AnalysisStarter`]; its progress,
//! completion and error events then arrive on three topics keyed by the
//! analysis (or conversation) id.

mod session;
mod topics;
mod types;

pub use session::{AnalysisSession, AnalysisStarter, TurnStart};
pub use topics::{AnalysisTopics, EventClass};
pub use types::{
    AnalysisCompletion, AnalysisFailure, AnalysisMode, AnalysisOutcome, AnalysisProgress,
    AnalysisRequest, AnalysisResponse,
};
