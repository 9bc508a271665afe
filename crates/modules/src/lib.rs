//! Data model and repository façades for prompt modules.
//!
//! A *module* is a named, reusable unit of prompt content or executable
//! logic; a *persona* is a template whose resolution yields the system
//! prompt.  The engine reads modules and personas through the store traits
//! defined here and writes per-conversation post-response state back through
//! the same surface.  In-memory implementations back the test suite and
//! small deployments; durable backends live behind the same traits.

mod schema;
mod store;

pub use schema::{
    ExecutionContext, ExecutionMetadata, Message, MessageRole, Module, ModuleDraft, ModuleKind,
    Persona, PostStage, StateEntry, Variables, validate_module_name,
};
pub use store::{
    InMemoryMessageStore, InMemoryModuleStore, InMemoryPersonaStore, MessageStore, ModuleStore,
    PersonaStore, StoreError,
};
