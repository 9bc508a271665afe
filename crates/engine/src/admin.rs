//! Module administration: the write side of the module repository.
//!
//! Every create/update runs the static analyzer so the stored
//! `requires_ai_inference` flag is always the engine's own judgement, never
//! user input.  Deletion cascades to post-response state (the store owns
//! that); startup revalidation re-derives the flag for every stored module
//! after a plugin-set change.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use promptstage_modules::{
    Module, ModuleDraft, ModuleKind, ModuleStore, StoreError, validate_module_name,
};
use promptstage_script::{Analysis, Analyzer, PluginRegistry};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("invalid module: {0}")]
    InvalidDraft(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ModuleAdmin {
    store: Arc<dyn ModuleStore>,
    analyzer: Analyzer,
}

impl ModuleAdmin {
    pub fn new(store: Arc<dyn ModuleStore>, registry: Arc<PluginRegistry>) -> Self {
        Self { store, analyzer: Analyzer::new(registry) }
    }

    pub async fn create(&self, draft: ModuleDraft) -> Result<(Module, Analysis), AdminError> {
        let (draft, analysis) = self.check(draft)?;
        let now = Utc::now();
        let module = Module {
            id: Uuid::new_v4(),
            name: draft.name,
            kind: draft.kind,
            content: draft.content,
            script: draft.script,
            trigger_pattern: draft.trigger_pattern,
            execution_context: draft.execution_context,
            requires_ai_inference: analysis.requires_ai,
            is_active: draft.is_active,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(module.clone()).await?;
        info!(module = %module.name, requires_ai = module.requires_ai_inference, "module created");
        Ok((module, analysis))
    }

    pub async fn update(&self, id: Uuid, draft: ModuleDraft) -> Result<(Module, Analysis), AdminError> {
        let existing = self
            .store
            .get_by_id(id)
            .await?
            .ok_or(StoreError::UnknownModule(id))?;
        let (draft, analysis) = self.check(draft)?;
        let module = Module {
            id,
            name: draft.name,
            kind: draft.kind,
            content: draft.content,
            script: draft.script,
            trigger_pattern: draft.trigger_pattern,
            execution_context: draft.execution_context,
            requires_ai_inference: analysis.requires_ai,
            is_active: draft.is_active,
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };
        self.store.update(module.clone()).await?;
        Ok((module, analysis))
    }

    /// Cascades to the module's post-response state.
    pub async fn delete(&self, id: Uuid) -> Result<(), AdminError> {
        self.store.delete(id).await?;
        Ok(())
    }

    pub async fn set_active(&self, id: Uuid, is_active: bool) -> Result<(), AdminError> {
        let mut module = self
            .store
            .get_by_id(id)
            .await?
            .ok_or(StoreError::UnknownModule(id))?;
        module.is_active = is_active;
        module.updated_at = Utc::now();
        self.store.update(module).await?;
        Ok(())
    }

    /// Startup pass: re-run the analyzer over every stored module and fix
    /// any stale `requires_ai_inference` flag.  Returns how many changed.
    pub async fn revalidate_all(&self) -> Result<usize, AdminError> {
        let mut changed = 0;
        for mut module in self.store.list().await? {
            let requires_ai = module
                .script
                .as_deref()
                .map(|script| self.analyzer.analyze(script).requires_ai)
                .unwrap_or(false);
            if requires_ai != module.requires_ai_inference {
                warn!(module = %module.name, requires_ai, "stale AI flag corrected");
                module.requires_ai_inference = requires_ai;
                module.updated_at = Utc::now();
                self.store.update(module).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Shared draft validation + analysis.
    fn check(&self, mut draft: ModuleDraft) -> Result<(ModuleDraft, Analysis), AdminError> {
        if !validate_module_name(&draft.name) {
            return Err(AdminError::InvalidDraft(format!(
                "name `{}` does not match ^[a-z][a-z0-9_]{{0,49}}$",
                draft.name
            )));
        }
        if draft.kind == ModuleKind::Simple && draft.script.as_deref().is_some_and(|s| !s.trim().is_empty())
        {
            return Err(AdminError::InvalidDraft(
                "simple modules cannot carry a script".to_string(),
            ));
        }
        // Blank trigger patterns and scripts are absent, not empty.
        if draft.trigger_pattern.as_deref().is_some_and(|p| p.trim().is_empty()) {
            draft.trigger_pattern = None;
        }
        if draft.script.as_deref().is_some_and(|s| s.trim().is_empty()) {
            draft.script = None;
        }

        let analysis = draft
            .script
            .as_deref()
            .map(|script| self.analyzer.analyze(script))
            .unwrap_or_else(|| Analysis { syntax_ok: true, ..Default::default() });
        Ok((draft, analysis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptstage_modules::{ExecutionContext, InMemoryModuleStore, PostStage, StateEntry};
    use promptstage_modules::{ExecutionMetadata, Variables};

    fn admin() -> ModuleAdmin {
        ModuleAdmin::new(
            Arc::new(InMemoryModuleStore::new()),
            Arc::new(PluginRegistry::builtin()),
        )
    }

    fn draft(name: &str, script: Option<&str>) -> ModuleDraft {
        ModuleDraft {
            name: name.to_string(),
            kind: if script.is_some() { ModuleKind::Advanced } else { ModuleKind::Simple },
            content: "body".to_string(),
            script: script.map(ToString::to_string),
            trigger_pattern: None,
            execution_context: ExecutionContext::Immediate,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn create_derives_the_ai_flag() {
        let admin = admin();
        let (module, analysis) = admin
            .create(draft("thinker", Some(r#"let r = ctx.reflect("ponder");"#)))
            .await
            .unwrap();
        assert!(module.requires_ai_inference);
        assert!(analysis.detected_plugins.contains("reflect"));

        let (module, _) = admin
            .create(draft("clock", Some(r#"let t = ctx.get_current_time("%H:%M");"#)))
            .await
            .unwrap();
        assert!(!module.requires_ai_inference);
    }

    #[tokio::test]
    async fn simple_module_with_script_is_rejected() {
        let admin = admin();
        let mut bad = draft("plain", None);
        bad.script = Some("let x = 1;".to_string());
        assert!(matches!(
            admin.create(bad).await,
            Err(AdminError::InvalidDraft(_))
        ));
    }

    #[tokio::test]
    async fn invalid_name_is_rejected() {
        let admin = admin();
        assert!(matches!(
            admin.create(draft("Not_Valid", None)).await,
            Err(AdminError::InvalidDraft(_))
        ));
    }

    #[tokio::test]
    async fn update_reanalyzes_the_script() {
        let admin = admin();
        let (module, _) = admin.create(draft("worker", Some("let x = 1;"))).await.unwrap();
        assert!(!module.requires_ai_inference);

        let (updated, _) = admin
            .update(module.id, draft("worker", Some(r#"let s = ctx.generate("go");"#)))
            .await
            .unwrap();
        assert!(updated.requires_ai_inference);
    }

    #[tokio::test]
    async fn revalidate_fixes_stale_flags() {
        let store = Arc::new(InMemoryModuleStore::new());
        let admin = ModuleAdmin::new(Arc::clone(&store) as Arc<dyn ModuleStore>, Arc::new(PluginRegistry::builtin()));

        let (module, _) = admin
            .create(draft("drifted", Some(r#"let s = ctx.generate("go");"#)))
            .await
            .unwrap();
        // Simulate a stale record written by an older engine.
        let mut stale = module.clone();
        stale.requires_ai_inference = false;
        store.update(stale).await.unwrap();

        assert_eq!(admin.revalidate_all().await.unwrap(), 1);
        let fixed = store.get_by_id(module.id).await.unwrap().unwrap();
        assert!(fixed.requires_ai_inference);
    }

    #[tokio::test]
    async fn delete_cascades_state() {
        let store = Arc::new(InMemoryModuleStore::new());
        let admin = ModuleAdmin::new(Arc::clone(&store) as Arc<dyn ModuleStore>, Arc::new(PluginRegistry::builtin()));
        let (module, _) = admin
            .create({
                let mut d = draft("counter", Some("let n = 1;"));
                d.execution_context = ExecutionContext::PostResponse;
                d
            })
            .await
            .unwrap();

        let conversation = Uuid::new_v4();
        store
            .put_post_response_state(StateEntry {
                conversation_id: conversation,
                module_id: module.id,
                stage: PostStage::Stage4,
                variables: Variables::new(),
                metadata: ExecutionMetadata {
                    success: true,
                    duration_ms: 1,
                    error: None,
                    log: vec![],
                    executed_at: Utc::now(),
                },
            })
            .await
            .unwrap();

        admin.delete(module.id).await.unwrap();
        assert!(store
            .get_post_response_state(conversation, module.id, PostStage::Stage4)
            .await
            .unwrap()
            .is_none());
    }
}
