//! Core record types shared across the engine.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Variables produced by a module script: name → JSON value.
pub type Variables = serde_json::Map<String, serde_json::Value>;

// ── Modules ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Static prompt text, no script.
    Simple,
    /// Content plus a sandboxed script that produces `${var}` bindings.
    Advanced,
}

/// When a module's script is eligible to run.
///
/// This is a property of the module *definition*: a module referenced from
/// several places still runs in exactly one stage per turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    /// Runs while the system prompt is being assembled (Stage 1 or 2).
    Immediate,
    /// Runs after the main response (Stage 4 or 5); its variables are read
    /// back in Stage 1 of the *next* turn.
    PostResponse,
    /// Never auto-runs; executed only through an explicit `run_module` call.
    OnDemand,
}

/// Which post-response stage a state entry belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PostStage {
    Stage4,
    Stage5,
}

/// A named, reusable unit of prompt content or executable logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub id: Uuid,
    /// Repository-unique, matches `^[a-z][a-z0-9_]{0,49}$`.
    pub name: String,
    pub kind: ModuleKind,
    /// Prompt text; `${var}` references resolve against script variables.
    pub content: String,
    /// Rhai source (advanced modules only).
    pub script: Option<String>,
    /// Post-response trigger: `*` matches always; a valid regex matches
    /// against the latest user and assistant messages; anything else is a
    /// case-insensitive whitespace-separated keyword set matched by
    /// substring.
    pub trigger_pattern: Option<String>,
    pub execution_context: ExecutionContext,
    /// Maintained by the engine from static analysis — never user-set.
    pub requires_ai_inference: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Module {
    /// Post-response stage this module's state lives under.
    pub fn post_stage(&self) -> PostStage {
        if self.requires_ai_inference { PostStage::Stage5 } else { PostStage::Stage4 }
    }

    pub fn has_script(&self) -> bool {
        self.script.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

/// User-supplied fields for creating or updating a module.
///
/// `requires_ai_inference` is intentionally absent — the admin surface
/// derives it from the script before the record is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDraft {
    pub name: String,
    pub kind: ModuleKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub trigger_pattern: Option<String>,
    pub execution_context: ExecutionContext,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

static MODULE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,49}$").expect("module name pattern"));

pub fn validate_module_name(name: &str) -> bool {
    MODULE_NAME.is_match(name)
}

// ── Personas ─────────────────────────────────────────────────────────────────

/// A named template whose resolution yields a system prompt.
///
/// Created and mutated by admin flows elsewhere; read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: Uuid,
    pub name: String,
    /// Text with `@module` / `${var}` references.
    pub template: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Post-response state ──────────────────────────────────────────────────────

/// How a single script execution went, persisted next to its variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Lines captured from `ctx.log(...)` during the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
    pub executed_at: DateTime<Utc>,
}

/// One persisted post-response result, unique per
/// `(conversation_id, module_id, stage)` and overwritten on each execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub conversation_id: Uuid,
    pub module_id: Uuid,
    pub stage: PostStage,
    pub variables: Variables,
    pub metadata: ExecutionMetadata,
}

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A stored conversation message as seen by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    /// Set when the assistant message was cut short by cancellation.
    #[serde(default)]
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: MessageRole::User,
            content: content.into(),
            cancelled: false,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(conversation_id: Uuid, content: impl Into<String>, cancelled: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: MessageRole::Assistant,
            content: content.into(),
            cancelled,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_module_names() {
        for name in ["a", "greeting", "mem_compress_v2", "x9"] {
            assert!(validate_module_name(name), "{name} should be valid");
        }
    }

    #[test]
    fn invalid_module_names() {
        for name in ["", "Greeting", "9lives", "_x", "has-dash", "has space"] {
            assert!(!validate_module_name(name), "{name} should be invalid");
        }
        // 51 characters — one past the cap.
        let long = "a".repeat(51);
        assert!(!validate_module_name(&long));
        assert!(validate_module_name(&"a".repeat(50)));
    }

    #[test]
    fn post_stage_follows_ai_flag() {
        let mut module = Module {
            id: Uuid::new_v4(),
            name: "counter".into(),
            kind: ModuleKind::Advanced,
            content: "n=${n}".into(),
            script: Some("let n = 1;".into()),
            trigger_pattern: None,
            execution_context: ExecutionContext::PostResponse,
            requires_ai_inference: false,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(module.post_stage(), PostStage::Stage4);
        module.requires_ai_inference = true;
        assert_eq!(module.post_stage(), PostStage::Stage5);
    }

    #[test]
    fn blank_script_does_not_count() {
        let module = Module {
            id: Uuid::new_v4(),
            name: "blank".into(),
            kind: ModuleKind::Advanced,
            content: String::new(),
            script: Some("   \n".into()),
            trigger_pattern: None,
            execution_context: ExecutionContext::Immediate,
            requires_ai_inference: false,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!module.has_script());
    }
}
