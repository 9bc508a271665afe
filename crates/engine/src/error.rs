//! Engine error taxonomy.
//!
//! Only failures of the engine's own contracts become errors: a provider
//! failing the main response, a broken store, an internal invariant.  User
//! mistakes (bad references, failing scripts, cycles) degrade to warnings
//! and never abort a turn; cancellation is a terminal state, not an error.

use thiserror::Error;
use uuid::Uuid;

use promptstage_modules::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("persona {0} not found")]
    PersonaNotFound(Uuid),

    #[error("module `{0}` not found")]
    ModuleNotFound(String),

    /// Stage-3 provider failure — surfaced as an `error` event; Stage 4/5
    /// are skipped and no assistant message is written.
    #[error("provider failure: {0}")]
    Provider(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// An internal bug, e.g. an impossible state transition.  Logged and the
    /// turn aborted with an `error` event.
    #[error("invariant violated: {0}")]
    Invariant(String),
}
