//! Repository traits plus in-memory reference implementations.
//!
//! The engine never talks to a database directly.  It sees three narrow
//! façades: modules (read + post-response state write), personas (read),
//! messages (read + append).  `put_post_response_state` is an upsert keyed
//! on `(conversation_id, module_id, stage)`; backends are expected to give
//! single-writer-per-key semantics, which the in-memory stores get for free
//! from a `tokio::sync::RwLock`.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::schema::{
    Message, Module, Persona, PostStage, StateEntry, validate_module_name,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("module name `{0}` does not match ^[a-z][a-z0-9_]{{0,49}}$")]
    InvalidName(String),
    #[error("module name `{0}` already exists")]
    DuplicateName(String),
    #[error("unknown module {0}")]
    UnknownModule(Uuid),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

// ── Traits ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait ModuleStore: Send + Sync {
    /// Bulk fetch of active modules by name.  Unknown or inactive names are
    /// simply absent from the result — never an error.
    async fn get_active_by_names(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, Module>, StoreError>;

    async fn get_by_name(&self, name: &str) -> Result<Option<Module>, StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Module>, StoreError>;

    /// Every module record, active or not, in unspecified order.  Used by
    /// startup revalidation and post-response trigger selection.
    async fn list(&self) -> Result<Vec<Module>, StoreError>;

    async fn insert(&self, module: Module) -> Result<(), StoreError>;

    /// Replace an existing module record (matched by id).
    async fn update(&self, module: Module) -> Result<(), StoreError>;

    /// Delete a module and cascade to all of its post-response state.
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get_post_response_state(
        &self,
        conversation_id: Uuid,
        module_id: Uuid,
        stage: PostStage,
    ) -> Result<Option<StateEntry>, StoreError>;

    /// Upsert on `(conversation_id, module_id, stage)`.
    async fn put_post_response_state(&self, entry: StateEntry) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PersonaStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Persona>, StoreError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Most recent messages in chronological order, at most `limit`.
    async fn recent(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<Message>, StoreError>;

    async fn count(&self, conversation_id: Uuid) -> Result<usize, StoreError>;

    /// Messages `[start, end)` in chronological order, clamped to bounds.
    async fn range(
        &self,
        conversation_id: Uuid,
        start: usize,
        end: usize,
    ) -> Result<Vec<Message>, StoreError>;

    async fn append(&self, message: Message) -> Result<(), StoreError>;
}

// ── In-memory module store ───────────────────────────────────────────────────

type StateKey = (Uuid, Uuid, PostStage);

#[derive(Default)]
struct ModuleStoreInner {
    by_id: HashMap<Uuid, Module>,
    name_index: HashMap<String, Uuid>,
    state: HashMap<StateKey, StateEntry>,
}

/// Process-local module repository.
#[derive(Default)]
pub struct InMemoryModuleStore {
    inner: RwLock<ModuleStoreInner>,
}

impl InMemoryModuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModuleStore for InMemoryModuleStore {
    async fn get_active_by_names(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, Module>, StoreError> {
        let inner = self.inner.read().await;
        let mut found = HashMap::new();
        for name in names {
            if let Some(id) = inner.name_index.get(name)
                && let Some(module) = inner.by_id.get(id)
                && module.is_active
            {
                found.insert(name.clone(), module.clone());
            }
        }
        Ok(found)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Module>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .name_index
            .get(name)
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Module>, StoreError> {
        Ok(self.inner.read().await.by_id.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Module>, StoreError> {
        Ok(self.inner.read().await.by_id.values().cloned().collect())
    }

    async fn insert(&self, module: Module) -> Result<(), StoreError> {
        if !validate_module_name(&module.name) {
            return Err(StoreError::InvalidName(module.name));
        }
        let mut inner = self.inner.write().await;
        if inner.name_index.contains_key(&module.name) {
            return Err(StoreError::DuplicateName(module.name));
        }
        inner.name_index.insert(module.name.clone(), module.id);
        inner.by_id.insert(module.id, module);
        Ok(())
    }

    async fn update(&self, module: Module) -> Result<(), StoreError> {
        if !validate_module_name(&module.name) {
            return Err(StoreError::InvalidName(module.name));
        }
        let mut inner = self.inner.write().await;
        let Some(existing) = inner.by_id.get(&module.id).cloned() else {
            return Err(StoreError::UnknownModule(module.id));
        };
        // Renames must not collide with another module.
        if existing.name != module.name {
            if inner.name_index.contains_key(&module.name) {
                return Err(StoreError::DuplicateName(module.name));
            }
            inner.name_index.remove(&existing.name);
            inner.name_index.insert(module.name.clone(), module.id);
        }
        inner.by_id.insert(module.id, module);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let Some(module) = inner.by_id.remove(&id) else {
            return Err(StoreError::UnknownModule(id));
        };
        inner.name_index.remove(&module.name);
        inner.state.retain(|(_, module_id, _), _| *module_id != id);
        Ok(())
    }

    async fn get_post_response_state(
        &self,
        conversation_id: Uuid,
        module_id: Uuid,
        stage: PostStage,
    ) -> Result<Option<StateEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.state.get(&(conversation_id, module_id, stage)).cloned())
    }

    async fn put_post_response_state(&self, entry: StateEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .state
            .insert((entry.conversation_id, entry.module_id, entry.stage), entry);
        Ok(())
    }
}

// ── In-memory persona / message stores ───────────────────────────────────────

#[derive(Default)]
pub struct InMemoryPersonaStore {
    personas: RwLock<HashMap<Uuid, Persona>>,
}

impl InMemoryPersonaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, persona: Persona) {
        self.personas.write().await.insert(persona.id, persona);
    }
}

#[async_trait]
impl PersonaStore for InMemoryPersonaStore {
    async fn get(&self, id: Uuid) -> Result<Option<Persona>, StoreError> {
        Ok(self.personas.read().await.get(&id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    by_conversation: RwLock<HashMap<Uuid, Vec<Message>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn recent(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<Message>, StoreError> {
        let map = self.by_conversation.read().await;
        let messages = map.get(&conversation_id).map(Vec::as_slice).unwrap_or(&[]);
        let skip = messages.len().saturating_sub(limit);
        Ok(messages[skip..].to_vec())
    }

    async fn count(&self, conversation_id: Uuid) -> Result<usize, StoreError> {
        let map = self.by_conversation.read().await;
        Ok(map.get(&conversation_id).map_or(0, Vec::len))
    }

    async fn range(
        &self,
        conversation_id: Uuid,
        start: usize,
        end: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let map = self.by_conversation.read().await;
        let messages = map.get(&conversation_id).map(Vec::as_slice).unwrap_or(&[]);
        let start = start.min(messages.len());
        let end = end.clamp(start, messages.len());
        Ok(messages[start..end].to_vec())
    }

    async fn append(&self, message: Message) -> Result<(), StoreError> {
        let mut map = self.by_conversation.write().await;
        map.entry(message.conversation_id).or_default().push(message);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ExecutionContext, ExecutionMetadata, ModuleKind, Variables};
    use chrono::Utc;

    fn module(name: &str) -> Module {
        Module {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind: ModuleKind::Simple,
            content: format!("content of {name}"),
            script: None,
            trigger_pattern: None,
            execution_context: ExecutionContext::Immediate,
            requires_ai_inference: false,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn entry(conversation_id: Uuid, module_id: Uuid, stage: PostStage, n: i64) -> StateEntry {
        let mut variables = Variables::new();
        variables.insert("n".into(), serde_json::json!(n));
        StateEntry {
            conversation_id,
            module_id,
            stage,
            variables,
            metadata: ExecutionMetadata {
                success: true,
                duration_ms: 1,
                error: None,
                log: vec![],
                executed_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn bulk_fetch_skips_unknown_and_inactive() {
        let store = InMemoryModuleStore::new();
        store.insert(module("greeting")).await.unwrap();
        let mut dormant = module("dormant");
        dormant.is_active = false;
        store.insert(dormant).await.unwrap();

        let found = store
            .get_active_by_names(&["greeting".into(), "dormant".into(), "ghost".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("greeting"));
    }

    #[tokio::test]
    async fn insert_rejects_duplicates_and_bad_names() {
        let store = InMemoryModuleStore::new();
        store.insert(module("alpha")).await.unwrap();
        assert!(matches!(
            store.insert(module("alpha")).await,
            Err(StoreError::DuplicateName(_))
        ));
        assert!(matches!(
            store.insert(module("Alpha")).await,
            Err(StoreError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn rename_updates_the_name_index() {
        let store = InMemoryModuleStore::new();
        let mut m = module("before");
        store.insert(m.clone()).await.unwrap();
        m.name = "after".into();
        store.update(m).await.unwrap();

        assert!(store.get_by_name("before").await.unwrap().is_none());
        assert!(store.get_by_name("after").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn state_upsert_overwrites_on_same_key() {
        let store = InMemoryModuleStore::new();
        let conversation = Uuid::new_v4();
        let module_id = Uuid::new_v4();

        store
            .put_post_response_state(entry(conversation, module_id, PostStage::Stage4, 1))
            .await
            .unwrap();
        store
            .put_post_response_state(entry(conversation, module_id, PostStage::Stage4, 2))
            .await
            .unwrap();

        let read = store
            .get_post_response_state(conversation, module_id, PostStage::Stage4)
            .await
            .unwrap()
            .expect("entry");
        assert_eq!(read.variables["n"], serde_json::json!(2));

        // Different stage, different key.
        assert!(store
            .get_post_response_state(conversation, module_id, PostStage::Stage5)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_cascades_to_state() {
        let store = InMemoryModuleStore::new();
        let m = module("counter");
        let module_id = m.id;
        store.insert(m).await.unwrap();
        let conversation = Uuid::new_v4();
        store
            .put_post_response_state(entry(conversation, module_id, PostStage::Stage4, 7))
            .await
            .unwrap();

        store.delete(module_id).await.unwrap();
        assert!(store
            .get_post_response_state(conversation, module_id, PostStage::Stage4)
            .await
            .unwrap()
            .is_none());
        assert!(store.get_by_name("counter").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn message_windows() {
        let store = InMemoryMessageStore::new();
        let conversation = Uuid::new_v4();
        for i in 0..5 {
            store
                .append(Message::user(conversation, format!("m{i}")))
                .await
                .unwrap();
        }

        assert_eq!(store.count(conversation).await.unwrap(), 5);
        let recent = store.recent(conversation, 2).await.unwrap();
        assert_eq!(
            recent.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["m3", "m4"]
        );
        let range = store.range(conversation, 1, 3).await.unwrap();
        assert_eq!(
            range.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2"]
        );
        // Out-of-bounds ranges clamp instead of panicking.
        assert!(store.range(conversation, 9, 12).await.unwrap().is_empty());
    }
}
