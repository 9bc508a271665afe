//! Per-invocation execution context — the `ctx` object a script sees.
//!
//! One `ScriptCtx` is built per script invocation.  It carries read-only
//! snapshots (messages, persona, summary) taken at stage start so a script
//! observes a stable world, plus the mutable bits that outlive the call:
//! the session-wide reflection counter and the cancellation probe.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use promptstage_modules::{Message, Variables};
use promptstage_template::{Warning, WarningKind};

/// Per-turn budget of AI plugin calls issued from scripts.
pub const MAX_REFLECTION_DEPTH: u32 = 3;

/// What an AI plugin returns when it cannot (or may not) call the model.
pub const AI_FALLBACK: &str = "[ai unavailable]";

// ── Clock ────────────────────────────────────────────────────────────────────

/// Time source for the time plugins and execution timestamps.
///
/// `Fixed` freezes the clock so Stage-1 output is byte-identical across
/// repeated runs in tests.
#[derive(Debug, Clone, Copy)]
pub enum Clock {
    System,
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(at) => *at,
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}

// ── AI bridge ────────────────────────────────────────────────────────────────

/// One LLM call requested from inside a script.
#[derive(Debug, Clone, Default)]
pub struct AiCallSpec {
    pub instructions: String,
    pub input: Option<String>,
    pub role: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// The stage-appropriate system prompt, filled in by the context.
    pub system_prompt: String,
    /// True for `ctx.reflect`, false for `ctx.generate`.
    pub reflect: bool,
}

/// Synchronous seam between the sandbox and the async LLM layer.
///
/// Scripts run on blocking worker threads, so the bridge implementation is
/// expected to block on the underlying async call and to observe the
/// session's cancellation flag while doing so.  Errors come back as plain
/// strings — the plugin degrades them to [`AI_FALLBACK`] and the script
/// keeps running.
pub trait AiBridge: Send + Sync {
    fn call(&self, spec: AiCallSpec) -> Result<String, String>;
}

// ── Persona snapshot ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PersonaInfo {
    pub name: String,
    pub description: String,
}

// ── Context ──────────────────────────────────────────────────────────────────

/// Everything needed to build a [`ScriptCtx`].
pub struct CtxSeed {
    pub conversation_id: Uuid,
    pub persona: PersonaInfo,
    /// Recent-message snapshot, chronological.
    pub messages: Vec<Message>,
    /// Total messages stored for the conversation at snapshot time.
    pub message_count: usize,
    pub conversation_summary: String,
    /// Pre-seeded variables (persisted post-response state for this module).
    pub variables: Variables,
    /// Effective system prompt for AI plugin calls made by this script.
    pub system_prompt: String,
    /// Session-wide counter shared by every script of the turn.
    pub reflection_depth: Arc<AtomicU32>,
    /// The owning session's cancellation probe.
    pub cancelled: Arc<AtomicBool>,
    pub ai: Option<Arc<dyn AiBridge>>,
    pub clock: Clock,
}

struct CtxInner {
    conversation_id: Uuid,
    persona: PersonaInfo,
    messages: Vec<Message>,
    message_count: usize,
    conversation_summary: String,
    system_prompt: String,
    variables: Mutex<Variables>,
    logs: Mutex<Vec<String>>,
    warnings: Mutex<Vec<Warning>>,
    reflection_depth: Arc<AtomicU32>,
    cancelled: Arc<AtomicBool>,
    ai: Option<Arc<dyn AiBridge>>,
    clock: Clock,
}

/// Handle handed to rhai as the `ctx` binding.  Cheap to clone; every clone
/// shares the same invocation state.
#[derive(Clone)]
pub struct ScriptCtx {
    inner: Arc<CtxInner>,
}

impl ScriptCtx {
    pub fn new(seed: CtxSeed) -> Self {
        Self {
            inner: Arc::new(CtxInner {
                conversation_id: seed.conversation_id,
                persona: seed.persona,
                messages: seed.messages,
                message_count: seed.message_count,
                conversation_summary: seed.conversation_summary,
                system_prompt: seed.system_prompt,
                variables: Mutex::new(seed.variables),
                logs: Mutex::new(Vec::new()),
                warnings: Mutex::new(Vec::new()),
                reflection_depth: seed.reflection_depth,
                cancelled: seed.cancelled,
                ai: seed.ai,
                clock: seed.clock,
            }),
        }
    }

    /// Bare context for explicit `run_module` calls and tests: empty
    /// snapshots, no AI bridge, system clock.
    pub fn detached(conversation_id: Uuid) -> Self {
        Self::new(CtxSeed {
            conversation_id,
            persona: PersonaInfo::default(),
            messages: Vec::new(),
            message_count: 0,
            conversation_summary: String::new(),
            variables: Variables::new(),
            system_prompt: String::new(),
            reflection_depth: Arc::new(AtomicU32::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
            ai: None,
            clock: Clock::System,
        })
    }

    // ── snapshot accessors (plugin surface) ──────────────────────────────

    pub fn conversation_id(&self) -> Uuid {
        self.inner.conversation_id
    }

    pub fn persona_info(&self) -> &PersonaInfo {
        &self.inner.persona
    }

    pub fn message_count(&self) -> usize {
        self.inner.message_count
    }

    /// Last `n` snapshot messages, chronological.
    pub fn recent_messages(&self, n: usize) -> &[Message] {
        let messages = &self.inner.messages;
        &messages[messages.len().saturating_sub(n)..]
    }

    /// Snapshot messages `[start, end)`, clamped to the window.
    pub fn message_range(&self, start: usize, end: usize) -> &[Message] {
        let messages = &self.inner.messages;
        let start = start.min(messages.len());
        let end = end.clamp(start, messages.len());
        &messages[start..end]
    }

    pub fn conversation_summary(&self) -> &str {
        &self.inner.conversation_summary
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_probe(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.cancelled)
    }

    // ── variables & logs ─────────────────────────────────────────────────

    pub fn get_variable(&self, name: &str) -> Option<serde_json::Value> {
        self.inner.variables.lock().expect("variables lock").get(name).cloned()
    }

    pub fn set_variable(&self, name: &str, value: serde_json::Value) {
        self.inner
            .variables
            .lock()
            .expect("variables lock")
            .insert(name.to_string(), value);
    }

    pub fn log(&self, line: impl Into<String>) {
        self.inner.logs.lock().expect("logs lock").push(line.into());
    }

    pub fn warn(&self, kind: WarningKind, message: impl Into<String>) {
        self.inner
            .warnings
            .lock()
            .expect("warnings lock")
            .push(Warning::new(kind, message));
    }

    /// Current variables map (set_variable results; the sandbox merges
    /// harvested top-level script locals on top after the run).
    pub fn variables_snapshot(&self) -> Variables {
        self.inner.variables.lock().expect("variables lock").clone()
    }

    pub fn drain_logs(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.logs.lock().expect("logs lock"))
    }

    pub fn drain_warnings(&self) -> Vec<Warning> {
        std::mem::take(&mut self.inner.warnings.lock().expect("warnings lock"))
    }

    // ── AI calls ─────────────────────────────────────────────────────────

    /// Issue an LLM call on behalf of `ctx.generate` / `ctx.reflect`.
    ///
    /// Degrades to [`AI_FALLBACK`] — never raises into the script — when the
    /// session is cancelled, the per-turn budget is spent, no bridge is
    /// attached, or the provider fails.
    pub fn ai_call(&self, mut spec: AiCallSpec) -> String {
        if self.is_cancelled() {
            return AI_FALLBACK.to_string();
        }

        // Reserve a slot without ever letting the observed depth pass the cap.
        let depth = &self.inner.reflection_depth;
        let mut current = depth.load(Ordering::SeqCst);
        loop {
            if current >= MAX_REFLECTION_DEPTH {
                self.warn(
                    WarningKind::ReflectionLimit,
                    format!(
                        "ai call budget exhausted ({MAX_REFLECTION_DEPTH} per turn); returning fallback"
                    ),
                );
                return AI_FALLBACK.to_string();
            }
            match depth.compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let Some(ai) = &self.inner.ai else {
            self.warn(WarningKind::ProviderError, "no LLM bridge attached; returning fallback");
            return AI_FALLBACK.to_string();
        };

        spec.system_prompt = self.inner.system_prompt.clone();
        match ai.call(spec) {
            Ok(text) => text,
            Err(err) => {
                self.warn(WarningKind::ProviderError, err);
                AI_FALLBACK.to_string()
            }
        }
    }
}
