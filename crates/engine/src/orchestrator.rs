//! The five-stage pipeline orchestrator.
//!
//! Stage order is strict: template preparation (no AI), pre-response AI
//! resolution, main response streaming, post-response without AI,
//! post-response with AI.  The cancellation flag is observed between
//! stages, between modules, inside every script (progress hook), and at
//! every streamed token.
//!
//! State-write discipline: Stage 4 and Stage 5 each batch their entries and
//! commit at stage completion.  Cancellation mid-Stage-4 discards the whole
//! batch; mid-Stage-5 it keeps the committed Stage-4 batch, discards the
//! Stage-5 batch, and records a `success=false` marker for the module that
//! was in flight.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use promptstage_config::{EngineConfig, PromptSource};
use promptstage_llm::{ChatMessage, Completion, ProviderSelector, StreamDelta};
use promptstage_modules::{
    ExecutionContext, ExecutionMetadata, Message, MessageRole, MessageStore, Module, ModuleStore,
    PersonaStore, PostStage, StateEntry, Variables,
};
use promptstage_script::{
    AiBridge, Clock, CtxSeed, ExecOutcome, PersonaInfo, PluginRegistry, Sandbox, ScriptCtx,
};
use promptstage_template::{parse, unescape};

use crate::MAX_RESOLUTION_DEPTH;
use crate::bridge::SessionAiBridge;
use crate::error::EngineError;
use crate::events::{SessionEvent, Stage, TurnMetadata};
use crate::resolver::{ResolveMode, ResolveState, Resolver, run_sandboxed};
use crate::service::ChatRequest;
use crate::session::{ChatSession, SessionPhase};
use crate::tracker::Tracker;

/// External collaborators of the pipeline.
pub struct PipelineDeps {
    pub config: EngineConfig,
    pub modules: Arc<dyn ModuleStore>,
    pub personas: Arc<dyn PersonaStore>,
    pub messages: Arc<dyn MessageStore>,
    pub providers: Arc<dyn ProviderSelector>,
    pub clock: Clock,
}

/// Runs chat turns.  One instance serves every conversation; per-turn state
/// lives in the session and on the stack of [`Pipeline::run_turn`].
pub struct Pipeline {
    config: EngineConfig,
    modules: Arc<dyn ModuleStore>,
    personas: Arc<dyn PersonaStore>,
    messages: Arc<dyn MessageStore>,
    providers: Arc<dyn ProviderSelector>,
    registry: Arc<PluginRegistry>,
    sandbox: Arc<Sandbox>,
    clock: Clock,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        let registry = Arc::new(PluginRegistry::builtin());
        let sandbox = Arc::new(Sandbox::new(deps.config.script.clone(), Arc::clone(&registry)));
        Self {
            config: deps.config,
            modules: deps.modules,
            personas: deps.personas,
            messages: deps.messages,
            providers: deps.providers,
            registry,
            sandbox,
            clock: deps.clock,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn module_store(&self) -> &Arc<dyn ModuleStore> {
        &self.modules
    }

    fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.config.script.timeout_secs)
    }

    /// Execute one chat turn end to end, emitting events through `session`.
    ///
    /// Returns `Ok` for completed *and* cancelled turns; an `Err` is an
    /// engine-contract failure (provider, store, invariant) that the caller
    /// surfaces as an `error` event.
    #[instrument(skip_all, fields(session = %session.id(), conversation = %session.conversation_id()))]
    pub async fn run_turn(
        &self,
        session: Arc<ChatSession>,
        request: ChatRequest,
    ) -> Result<(), EngineError> {
        let conversation_id = session.conversation_id();

        // Persist the user turn immediately so it survives anything below.
        self.messages
            .append(Message::user(conversation_id, request.user_message.clone()))
            .await?;

        let (template, persona_info) = match request.persona_id {
            Some(id) => {
                let persona = self
                    .personas
                    .get(id)
                    .await?
                    .ok_or(EngineError::PersonaNotFound(id))?;
                (
                    persona.template.clone(),
                    PersonaInfo { name: persona.name, description: persona.description },
                )
            }
            None => (String::new(), PersonaInfo::default()),
        };

        let mut tracker = Tracker::new(self.config.tracker.enabled);
        tracker.set_template(&template);

        // Read-only snapshots for every script of this turn.
        let snapshot = self
            .messages
            .recent(conversation_id, self.config.pipeline.snapshot_messages)
            .await?;
        let message_count = self.messages.count(conversation_id).await?;
        let summary = build_summary(&snapshot);

        let (module_map, template_order) = self.collect_modules(&template).await?;

        // ── Stage 1 — template preparation (no AI) ───────────────────────
        session.set_phase(SessionPhase::AwaitingStage1)?;
        session.emit(SessionEvent::StageUpdate { stage: Stage::Stage1 }).await;
        tracker.stage_started(Stage::Stage1, self.clock.now());

        let mut state1 = ResolveState::new(ResolveMode::Stage1, String::new());
        let stage1_prompt = {
            let resolver = self.resolver(
                &module_map,
                conversation_id,
                &persona_info,
                &snapshot,
                message_count,
                &summary,
                &session,
                None,
            );
            resolver.resolve(&template, &mut state1).await
        };
        tracker.set_stage_prompt(Stage::Stage1, &stage1_prompt);
        for run in &state1.module_runs {
            tracker.module_ran(&run.name, Stage::Stage1, run.success, run.duration_ms);
        }
        tracker.stage_ended(Stage::Stage1, self.clock.now());
        let mut warnings = state1.warnings;

        if session.is_cancelled() {
            return self.finish_cancelled(&session).await;
        }

        // ── Stage 2 — pre-response AI resolution ─────────────────────────
        session.set_phase(SessionPhase::AwaitingStage2)?;
        session.emit(SessionEvent::StageUpdate { stage: Stage::Stage2 }).await;
        tracker.stage_started(Stage::Stage2, self.clock.now());

        let bridge: Arc<dyn AiBridge> = Arc::new(SessionAiBridge::new(
            tokio::runtime::Handle::current(),
            Arc::clone(&self.providers),
            request.provider,
            request.provider_settings.clone(),
            session.cancel_flag().clone(),
        ));

        let mut state2 = ResolveState::new(ResolveMode::Stage2, stage1_prompt.clone());
        let stage2_resolved = {
            let resolver = self.resolver(
                &module_map,
                conversation_id,
                &persona_info,
                &snapshot,
                message_count,
                &summary,
                &session,
                Some(Arc::clone(&bridge)),
            );
            resolver.resolve(&stage1_prompt, &mut state2).await
        };
        // Escapes survive both passes; collapse them only now.
        let stage2_prompt = unescape(&stage2_resolved);
        tracker.set_stage_prompt(Stage::Stage2, &stage2_prompt);
        for run in &state2.module_runs {
            tracker.module_ran(&run.name, Stage::Stage2, run.success, run.duration_ms);
        }
        tracker.stage_ended(Stage::Stage2, self.clock.now());
        warnings.extend(state2.warnings);

        if session.is_cancelled() {
            return self.finish_cancelled(&session).await;
        }

        // ── Stage 3 — main response ──────────────────────────────────────
        session.set_phase(SessionPhase::Streaming)?;
        session.emit(SessionEvent::StageUpdate { stage: Stage::Stage3 }).await;
        tracker.stage_started(Stage::Stage3, self.clock.now());

        let llm_messages = build_llm_messages(&stage2_prompt, &snapshot);
        let completion = self.main_response(&session, &request, &llm_messages).await?;
        tracker.stage_ended(Stage::Stage3, self.clock.now());

        let cancelled_mid_stream = completion.cancelled || session.is_cancelled();
        self.messages
            .append(Message::assistant(
                conversation_id,
                completion.content.clone(),
                cancelled_mid_stream,
            ))
            .await?;

        if cancelled_mid_stream {
            // Stage 4/5 skipped; their would-be writes never happen.
            return self.finish_cancelled(&session).await;
        }

        tracker.warnings(&warnings);
        session
            .emit(SessionEvent::Done {
                metadata: TurnMetadata {
                    content: completion.content.clone(),
                    thinking: completion.thinking.clone(),
                    input_tokens: completion.input_tokens,
                    output_tokens: completion.output_tokens,
                    cancelled: false,
                    warnings: warnings.clone(),
                    debug: tracker.snapshot(),
                },
            })
            .await;

        info!(chars = completion.content.len(), "main response complete");

        // ── Stages 4 & 5 — post-response processing ──────────────────────
        session.set_phase(SessionPhase::PostResponse)?;

        let stage5_prompt = match self.config.pipeline.stage5_prompt_source {
            PromptSource::Stage2 => stage2_prompt.as_str(),
            PromptSource::Stage1 => stage1_prompt.as_str(),
        };

        let stage4_done = self
            .run_post_stage(
                &session,
                PostStage::Stage4,
                &module_map,
                &template_order,
                &request.user_message,
                &completion.content,
                &snapshot,
                message_count,
                &summary,
                &persona_info,
                "",
                None,
                &mut tracker,
            )
            .await?;
        if !stage4_done {
            return self.finish_cancelled(&session).await;
        }

        let stage5_done = self
            .run_post_stage(
                &session,
                PostStage::Stage5,
                &module_map,
                &template_order,
                &request.user_message,
                &completion.content,
                &snapshot,
                message_count,
                &summary,
                &persona_info,
                stage5_prompt,
                Some(bridge),
                &mut tracker,
            )
            .await?;
        if !stage5_done {
            return self.finish_cancelled(&session).await;
        }

        session.emit(SessionEvent::PostResponseComplete).await;
        session.set_phase(SessionPhase::Done)?;
        Ok(())
    }

    /// Run a module explicitly (ON_DEMAND surface).  Nothing is persisted;
    /// the caller receives the raw outcome.
    pub async fn run_module_by_name(
        &self,
        name: &str,
        conversation_id: Uuid,
    ) -> Result<ExecOutcome, EngineError> {
        let module = self
            .modules
            .get_by_name(name)
            .await?
            .ok_or_else(|| EngineError::ModuleNotFound(name.to_string()))?;
        if !module.has_script() {
            return Ok(ExecOutcome { success: true, ..Default::default() });
        }

        let snapshot = self
            .messages
            .recent(conversation_id, self.config.pipeline.snapshot_messages)
            .await?;
        let message_count = self.messages.count(conversation_id).await?;
        let summary = build_summary(&snapshot);

        let ctx = ScriptCtx::new(CtxSeed {
            conversation_id,
            persona: PersonaInfo::default(),
            messages: snapshot,
            message_count,
            conversation_summary: summary,
            variables: Variables::new(),
            system_prompt: String::new(),
            reflection_depth: Arc::new(std::sync::atomic::AtomicU32::new(0)),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            ai: None,
            clock: self.clock,
        });
        let script = module.script.clone().unwrap_or_default();
        Ok(run_sandboxed(&self.sandbox, script, ctx, self.script_timeout()).await)
    }

    // ── internals ────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn resolver<'a>(
        &'a self,
        module_map: &'a HashMap<String, Module>,
        conversation_id: Uuid,
        persona: &'a PersonaInfo,
        snapshot: &'a [Message],
        message_count: usize,
        summary: &'a str,
        session: &'a ChatSession,
        ai: Option<Arc<dyn AiBridge>>,
    ) -> Resolver<'a> {
        Resolver {
            modules: module_map,
            store: self.modules.as_ref(),
            sandbox: &self.sandbox,
            conversation_id,
            persona: persona.clone(),
            messages: snapshot,
            message_count,
            summary,
            reflection_depth: session.reflection_depth(),
            cancel: session.cancel_flag().clone(),
            ai,
            clock: self.clock,
            script_timeout: self.script_timeout(),
        }
    }

    /// Fetch the transitive closure of modules referenced by `template`,
    /// plus their names in deterministic first-reference order (the order
    /// Stage 4/5 honor).  Bounded by the resolution depth limit, so
    /// reference chains that would never resolve are never fetched either.
    async fn collect_modules(
        &self,
        template: &str,
    ) -> Result<(HashMap<String, Module>, Vec<String>), EngineError> {
        let mut map = HashMap::new();
        let mut ordered = Vec::new();
        let mut pending = parse(template).module_names();
        let mut seen: HashSet<String> = pending.iter().cloned().collect();

        for _ in 0..=MAX_RESOLUTION_DEPTH {
            if pending.is_empty() {
                break;
            }
            let found = self.modules.get_active_by_names(&pending).await?;
            let mut next = Vec::new();
            for name in &pending {
                let Some(module) = found.get(name) else { continue };
                ordered.push(name.clone());
                for child in parse(&module.content).module_names() {
                    if seen.insert(child.clone()) {
                        next.push(child);
                    }
                }
            }
            map.extend(found);
            pending = next;
        }
        Ok((map, ordered))
    }

    async fn main_response(
        &self,
        session: &Arc<ChatSession>,
        request: &ChatRequest,
        llm_messages: &[ChatMessage],
    ) -> Result<Completion, EngineError> {
        let provider = self.providers.provider(request.provider);
        let cancel = session.cancel_flag().subscribe();

        if request.controls.stream {
            let (tx, mut rx) = mpsc::channel::<StreamDelta>(64);
            let forwarder = tokio::spawn({
                let session = Arc::clone(session);
                async move {
                    while let Some(delta) = rx.recv().await {
                        session
                            .emit(SessionEvent::Chunk {
                                content: delta.content,
                                thinking: delta.thinking,
                            })
                            .await;
                    }
                }
            });
            let result = provider
                .stream(&request.provider_settings, llm_messages, &request.controls, cancel, tx)
                .await;
            // The provider owned `tx`; the forwarder drains and exits.
            let _ = forwarder.await;
            result.map_err(|err| EngineError::Provider(err.to_string()))
        } else {
            provider
                .complete(&request.provider_settings, llm_messages, &request.controls, cancel)
                .await
                .map_err(|err| EngineError::Provider(err.to_string()))
        }
    }

    /// Run one post-response stage.  Returns `false` when cancellation cut
    /// the stage short (the turn then ends CANCELLED).
    #[allow(clippy::too_many_arguments)]
    async fn run_post_stage(
        &self,
        session: &Arc<ChatSession>,
        stage: PostStage,
        module_map: &HashMap<String, Module>,
        template_order: &[String],
        user_message: &str,
        assistant_message: &str,
        snapshot: &[Message],
        message_count: usize,
        summary: &str,
        persona: &PersonaInfo,
        effective_prompt: &str,
        ai: Option<Arc<dyn AiBridge>>,
        tracker: &mut Tracker,
    ) -> Result<bool, EngineError> {
        let conversation_id = session.conversation_id();
        let want_ai = stage == PostStage::Stage5;
        let stage_label = if want_ai { Stage::Stage5 } else { Stage::Stage4 };

        session.emit(SessionEvent::StageUpdate { stage: stage_label }).await;
        tracker.stage_started(stage_label, self.clock.now());

        let selected = self
            .select_post_modules(stage, module_map, template_order, user_message, assistant_message)
            .await?;
        debug!(stage = ?stage_label, modules = selected.len(), "post-response selection");

        let mut batch: Vec<StateEntry> = Vec::new();
        for module in &selected {
            if session.is_cancelled() {
                tracker.stage_ended(stage_label, self.clock.now());
                return Ok(false);
            }

            let seed = self
                .modules
                .get_post_response_state(conversation_id, module.id, stage)
                .await?
                .map(|entry| entry.variables)
                .unwrap_or_default();

            let ctx = ScriptCtx::new(CtxSeed {
                conversation_id,
                persona: persona.clone(),
                messages: snapshot.to_vec(),
                message_count,
                conversation_summary: summary.to_string(),
                variables: seed.clone(),
                system_prompt: effective_prompt.to_string(),
                reflection_depth: session.reflection_depth(),
                cancelled: session.cancel_flag().probe(),
                ai: if module.requires_ai_inference { ai.clone() } else { None },
                clock: self.clock,
            });

            let script = module.script.clone().unwrap_or_default();
            let outcome = run_sandboxed(&self.sandbox, script, ctx, self.script_timeout()).await;
            tracker.module_ran(&module.name, stage_label, outcome.success, outcome.duration_ms);

            if outcome.cancelled {
                // Abandoned mid-script.  Stage 5 records the failure marker
                // (Stage 4 must leave no trace — see the module docs).
                if stage == PostStage::Stage5 {
                    self.modules
                        .put_post_response_state(StateEntry {
                            conversation_id,
                            module_id: module.id,
                            stage,
                            variables: seed,
                            metadata: ExecutionMetadata {
                                success: false,
                                duration_ms: outcome.duration_ms,
                                error: outcome.error.clone(),
                                log: outcome.log.clone(),
                                executed_at: self.clock.now(),
                            },
                        })
                        .await?;
                }
                tracker.stage_ended(stage_label, self.clock.now());
                return Ok(false);
            }

            // A failed run still records an entry; the previous variables
            // are preserved so transient failures don't wipe counters.
            let variables = if outcome.success { outcome.variables } else { seed };
            batch.push(StateEntry {
                conversation_id,
                module_id: module.id,
                stage,
                variables,
                metadata: ExecutionMetadata {
                    success: outcome.success,
                    duration_ms: outcome.duration_ms,
                    error: outcome.error,
                    log: outcome.log,
                    executed_at: self.clock.now(),
                },
            });
        }

        for entry in batch {
            self.modules.put_post_response_state(entry).await?;
        }
        tracker.stage_ended(stage_label, self.clock.now());
        Ok(true)
    }

    /// Deterministic post-response selection: template-reference order
    /// first, then trigger matches ordered by module id.
    async fn select_post_modules(
        &self,
        stage: PostStage,
        module_map: &HashMap<String, Module>,
        template_order: &[String],
        user_message: &str,
        assistant_message: &str,
    ) -> Result<Vec<Module>, EngineError> {
        let want_ai = stage == PostStage::Stage5;
        let eligible = |module: &Module| {
            module.is_active
                && module.execution_context == ExecutionContext::PostResponse
                && module.requires_ai_inference == want_ai
        };

        let mut selected: Vec<Module> = Vec::new();
        for name in template_order {
            if let Some(module) = module_map.get(name)
                && eligible(module)
            {
                selected.push(module.clone());
            }
        }

        let mut triggered: Vec<Module> = self
            .modules
            .list()
            .await?
            .into_iter()
            .filter(|module| eligible(module))
            .filter(|module| !selected.iter().any(|chosen| chosen.id == module.id))
            .filter(|module| {
                module
                    .trigger_pattern
                    .as_deref()
                    .is_some_and(|pattern| {
                        crate::triggers::trigger_matches(pattern, user_message, assistant_message)
                    })
            })
            .collect();
        triggered.sort_by_key(|module| module.id);
        selected.extend(triggered);
        Ok(selected)
    }

    async fn finish_cancelled(&self, session: &Arc<ChatSession>) -> Result<(), EngineError> {
        warn!(session = %session.id(), "turn cancelled");
        session.emit(SessionEvent::Cancelled).await;
        session.set_phase(SessionPhase::Cancelled)?;
        Ok(())
    }
}

// ── free helpers ─────────────────────────────────────────────────────────────

fn build_llm_messages(system_prompt: &str, snapshot: &[Message]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(snapshot.len() + 1);
    if !system_prompt.is_empty() {
        messages.push(ChatMessage::system(system_prompt));
    }
    for message in snapshot {
        messages.push(match message.role {
            MessageRole::User => ChatMessage::user(message.content.clone()),
            MessageRole::Assistant => ChatMessage::assistant(message.content.clone()),
        });
    }
    messages
}

/// Cheap textual gist handed to `ctx.get_conversation_summary()`.
fn build_summary(snapshot: &[Message]) -> String {
    let last_user = snapshot
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| truncate(&m.content, 160));
    let last_assistant = snapshot
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant)
        .map(|m| truncate(&m.content, 160));

    match (last_user, last_assistant) {
        (None, None) => "empty conversation".to_string(),
        (user, assistant) => format!(
            "{} messages in window; last user: {}; last assistant: {}",
            snapshot.len(),
            user.unwrap_or_else(|| "—".to_string()),
            assistant.unwrap_or_else(|| "—".to_string()),
        ),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn llm_messages_start_with_the_system_prompt() {
        let conversation = Uuid::new_v4();
        let snapshot = vec![
            Message::user(conversation, "hi"),
            Message::assistant(conversation, "hello", false),
        ];
        let messages = build_llm_messages("SYS", &snapshot);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "SYS");
        assert_eq!(messages[2].content, "hello");
    }

    #[test]
    fn empty_system_prompt_is_not_sent() {
        let messages = build_llm_messages("", &[]);
        assert!(messages.is_empty());
    }

    #[test]
    fn summary_reflects_the_window() {
        let conversation = Uuid::new_v4();
        assert_eq!(build_summary(&[]), "empty conversation");

        let snapshot = vec![
            Message {
                id: Uuid::new_v4(),
                conversation_id: conversation,
                role: MessageRole::User,
                content: "what's new?".to_string(),
                cancelled: false,
                created_at: Utc::now(),
            },
        ];
        let summary = build_summary(&snapshot);
        assert!(summary.contains("what's new?"));
        assert!(summary.contains("1 messages"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo…");
        assert_eq!(truncate("short", 10), "short");
    }
}
