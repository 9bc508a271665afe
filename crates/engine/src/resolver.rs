//! Recursive template resolution.
//!
//! Substitution is depth-first and left-to-right: a module reference is
//! replaced by its fully resolved body before the next reference is looked
//! at.  Cycle detection uses the live resolution stack rather than graph
//! pre-analysis, so partially edited module sets degrade gracefully.
//!
//! Two passes share this code.  Stage 1 resolves everything except
//! AI-requiring IMMEDIATE modules, which stay as `@name` markers; Stage 2
//! runs over the Stage-1 text and resolves exactly those markers, treating
//! every other leftover silently (it was already warned about).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};
use uuid::Uuid;

use promptstage_modules::{
    ExecutionContext, Message, Module, ModuleKind, ModuleStore, Variables,
};
use promptstage_script::{AiBridge, Clock, CtxSeed, ExecOutcome, PersonaInfo, Sandbox, ScriptCtx};
use promptstage_template::{Warning, WarningKind, parse};

use crate::MAX_RESOLUTION_DEPTH;
use crate::cancel::CancelFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolveMode {
    Stage1,
    Stage2,
}

/// One script run performed during resolution, for the tracker.
pub(crate) struct ModuleRunInfo {
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
}

/// Mutable accumulator threaded through one resolution pass.
pub(crate) struct ResolveState {
    pub mode: ResolveMode,
    stack: Vec<String>,
    pub warnings: Vec<Warning>,
    pub module_runs: Vec<ModuleRunInfo>,
    /// Stage-2 only: the prompt "so far", used as the effective system
    /// prompt for AI sub-calls.  Starts as the Stage-1 prompt and follows
    /// top-level substitutions as they land.
    pub effective_prompt: String,
}

impl ResolveState {
    pub fn new(mode: ResolveMode, effective_prompt: String) -> Self {
        Self { mode, stack: Vec::new(), warnings: Vec::new(), module_runs: Vec::new(), effective_prompt }
    }
}

/// Everything a resolution pass needs, borrowed from the orchestrator.
pub(crate) struct Resolver<'a> {
    pub modules: &'a HashMap<String, Module>,
    pub store: &'a dyn ModuleStore,
    pub sandbox: &'a Arc<Sandbox>,
    pub conversation_id: Uuid,
    pub persona: PersonaInfo,
    pub messages: &'a [Message],
    pub message_count: usize,
    pub summary: &'a str,
    pub reflection_depth: Arc<AtomicU32>,
    pub cancel: CancelFlag,
    /// Attached only when the pass may execute AI modules (Stage 2).
    pub ai: Option<Arc<dyn AiBridge>>,
    pub clock: Clock,
    pub script_timeout: Duration,
}

impl<'a> Resolver<'a> {
    /// Resolve `text` as the top level of a pass.
    pub async fn resolve(&self, text: &str, state: &mut ResolveState) -> String {
        // Stage 1 substitutes top-level `${var}`s from an (empty) persona
        // scope; Stage 2 must not touch leftovers a failed script produced.
        let top_vars = Variables::new();
        let vars = match state.mode {
            ResolveMode::Stage1 => Some(&top_vars),
            ResolveMode::Stage2 => None,
        };
        self.resolve_text(text.to_string(), vars, state).await
    }

    fn resolve_text<'s>(
        &'s self,
        text: String,
        vars: Option<&'s Variables>,
        state: &'s mut ResolveState,
    ) -> BoxFuture<'s, String> {
        async move {
            let parsed = parse(&text);
            // Malformed `@` runs are reported once, in the first pass.
            if state.mode == ResolveMode::Stage1 {
                state.warnings.extend(parsed.warnings);
            }

            let mut out = String::with_capacity(text.len());
            let mut cursor = 0;
            for reference in &parsed.references {
                out.push_str(&text[cursor..reference.start]);
                let verbatim = &text[reference.start..reference.end];
                match reference.kind {
                    promptstage_template::ReferenceKind::Variable => {
                        match vars {
                            Some(map) => match map.get(&reference.name) {
                                Some(value) => out.push_str(&variable_to_text(value)),
                                None => state.warnings.push(Warning::new(
                                    WarningKind::InvalidReference,
                                    format!(
                                        "variable `${{{}}}` is undefined; substituted empty string",
                                        reference.name
                                    ),
                                )),
                            },
                            None => out.push_str(verbatim),
                        }
                    }
                    promptstage_template::ReferenceKind::Module => {
                        let replacement =
                            self.resolve_module(verbatim, &reference.name, state).await;
                        out.push_str(&replacement);
                        // Keep the "prompt so far" current for AI sub-calls.
                        if state.mode == ResolveMode::Stage2 && state.stack.is_empty() {
                            state.effective_prompt =
                                format!("{out}{}", &text[reference.end..]);
                        }
                    }
                }
                cursor = reference.end;
            }
            out.push_str(&text[cursor..]);
            out
        }
        .boxed()
    }

    async fn resolve_module(&self, verbatim: &str, name: &str, state: &mut ResolveState) -> String {
        if state.stack.iter().any(|on_stack| on_stack == name) {
            state.warnings.push(Warning::new(
                WarningKind::Cycle,
                format!("module `{name}` is already being resolved; reference left verbatim"),
            ));
            return verbatim.to_string();
        }
        if state.stack.len() >= MAX_RESOLUTION_DEPTH {
            state.warnings.push(Warning::new(
                WarningKind::RecursionLimit,
                format!("resolution depth limit ({MAX_RESOLUTION_DEPTH}) reached at `{name}`"),
            ));
            return verbatim.to_string();
        }

        let Some(module) = self.modules.get(name).filter(|m| m.is_active) else {
            // Stage 2 sees Stage 1's leftovers; they were warned about then.
            if state.mode == ResolveMode::Stage1 {
                state.warnings.push(Warning::new(
                    WarningKind::InvalidReference,
                    format!("module `{name}` is missing or inactive; reference left verbatim"),
                ));
            }
            return verbatim.to_string();
        };

        // At the top level, Stage 2 resolves exactly the AI-IMMEDIATE markers
        // Stage 1 deferred.  Everything else still standing there (cycle or
        // depth leftovers, post-response splices) stays as it is — only refs
        // that first appear *inside* an AI module's body resolve normally.
        if state.mode == ResolveMode::Stage2
            && state.stack.is_empty()
            && !(module.execution_context == ExecutionContext::Immediate
                && module.requires_ai_inference)
        {
            return verbatim.to_string();
        }

        match module.execution_context {
            ExecutionContext::Immediate => {
                if module.requires_ai_inference && state.mode == ResolveMode::Stage1 {
                    // Deferred to Stage 2; deliberately no warning.
                    return verbatim.to_string();
                }
                let vars = if module.kind == ModuleKind::Advanced && module.has_script() {
                    let outcome = self.run_script(module, Variables::new(), state).await;
                    if outcome.success {
                        Some(outcome.variables)
                    } else {
                        state.warnings.push(Warning::new(
                            WarningKind::ScriptError,
                            format!(
                                "script of `{name}` failed ({}); content used as-is",
                                outcome.error.as_deref().unwrap_or("unknown error")
                            ),
                        ));
                        None
                    }
                } else {
                    Some(Variables::new())
                };
                self.expand_content(module, vars, state).await
            }
            ExecutionContext::PostResponse => {
                // Splice the state persisted by a previous turn; the script
                // itself only runs in Stage 4/5.
                let persisted = self
                    .store
                    .get_post_response_state(self.conversation_id, module.id, module.post_stage())
                    .await
                    .ok()
                    .flatten()
                    .map(|entry| entry.variables)
                    .unwrap_or_default();
                self.expand_content(module, Some(persisted), state).await
            }
            ExecutionContext::OnDemand => {
                // Never auto-executed; the reference renders static content.
                self.expand_content(module, Some(Variables::new()), state).await
            }
        }
    }

    async fn expand_content(
        &self,
        module: &Module,
        vars: Option<Variables>,
        state: &mut ResolveState,
    ) -> String {
        state.stack.push(module.name.clone());
        let resolved = self
            .resolve_text(module.content.clone(), vars.as_ref(), state)
            .await;
        state.stack.pop();
        resolved
    }

    async fn run_script(
        &self,
        module: &Module,
        seed: Variables,
        state: &mut ResolveState,
    ) -> ExecOutcome {
        let ctx = ScriptCtx::new(CtxSeed {
            conversation_id: self.conversation_id,
            persona: self.persona.clone(),
            messages: self.messages.to_vec(),
            message_count: self.message_count,
            conversation_summary: self.summary.to_string(),
            variables: seed,
            system_prompt: state.effective_prompt.clone(),
            reflection_depth: Arc::clone(&self.reflection_depth),
            cancelled: self.cancel.probe(),
            // Modules analyzed as non-AI get no bridge: a smuggled AI call
            // degrades to the fallback instead of violating stage placement.
            ai: if module.requires_ai_inference { self.ai.clone() } else { None },
            clock: self.clock,
        });

        let script = module.script.clone().unwrap_or_default();
        let outcome = run_sandboxed(self.sandbox, script, ctx, self.script_timeout).await;

        debug!(
            module = %module.name,
            success = outcome.success,
            duration_ms = outcome.duration_ms,
            "immediate module script finished"
        );
        state.warnings.extend(outcome.warnings.clone());
        state.module_runs.push(ModuleRunInfo {
            name: module.name.clone(),
            success: outcome.success,
            duration_ms: outcome.duration_ms,
        });
        outcome
    }
}

/// Run one script on a blocking worker.  A panicking worker is contained
/// and reported like any other script failure.
pub(crate) async fn run_sandboxed(
    sandbox: &Arc<Sandbox>,
    script: String,
    ctx: ScriptCtx,
    timeout: Duration,
) -> ExecOutcome {
    let sandbox = Arc::clone(sandbox);
    tokio::task::spawn_blocking(move || sandbox.execute_with_timeout(&script, &ctx, timeout))
        .await
        .unwrap_or_else(|join_error| {
            warn!(%join_error, "script worker panicked");
            ExecOutcome {
                success: false,
                error: Some("script worker panicked".to_string()),
                ..Default::default()
            }
        })
}

/// Render a JSON variable for prompt text: strings bare, scalars via
/// `Display`, null empty, containers as compact JSON.
pub(crate) fn variable_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variables_render_bare() {
        assert_eq!(variable_to_text(&serde_json::json!("text")), "text");
        assert_eq!(variable_to_text(&serde_json::json!(42)), "42");
        assert_eq!(variable_to_text(&serde_json::json!(true)), "true");
        assert_eq!(variable_to_text(&serde_json::json!(null)), "");
        assert_eq!(variable_to_text(&serde_json::json!([1, 2])), "[1,2]");
    }
}
