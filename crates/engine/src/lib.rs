//! The staged prompt pipeline: orchestration, sessions, and service surfaces.
//!
//! A chat turn flows through five strictly ordered stages: template
//! preparation (no AI), pre-response AI resolution, main response streaming,
//! then post-response processing without and with AI.  Each turn owns a
//! [`ChatSession`] whose single cancellation flag is observed by the
//! resolver between modules, by the sandbox at every progress tick, and by
//! the provider layer at every streamed chunk.

mod admin;
mod bridge;
mod cancel;
mod error;
mod events;
mod orchestrator;
mod resolver;
mod service;
mod session;
mod tracker;
mod triggers;

pub use admin::{AdminError, ModuleAdmin};
pub use cancel::CancelFlag;
pub use error::EngineError;
pub use events::{SessionEvent, Stage, TurnMetadata};
pub use orchestrator::{Pipeline, PipelineDeps};
pub use service::{ChatRequest, ChatService, SessionHandle};
pub use session::{ChatSession, SessionPhase};
pub use tracker::{ModuleRunRecord, PromptTrace, StageTiming, Tracker};
pub use triggers::trigger_matches;

/// Module references nested deeper than this stay verbatim.
pub const MAX_RESOLUTION_DEPTH: usize = 10;
