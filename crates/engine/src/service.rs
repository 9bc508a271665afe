//! The chat service surface: one async entry point per turn.
//!
//! `submit` serializes turns per conversation: a request arriving while a
//! previous session is live first raises that session's cancel flag and
//! waits for its terminal event.  Each turn runs on its own task; the
//! caller consumes the returned event stream at its own pace.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info};
use uuid::Uuid;

use promptstage_llm::{ChatControls, ProviderKind, ProviderSettings};
use promptstage_script::ExecOutcome;

use crate::error::EngineError;
use crate::events::SessionEvent;
use crate::orchestrator::Pipeline;
use crate::session::{ChatSession, SessionPhase};

/// One chat turn as submitted by the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_message: String,
    /// `None` starts a new conversation.
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub persona_id: Option<Uuid>,
    #[serde(default)]
    pub provider: ProviderKind,
    pub provider_settings: ProviderSettings,
    #[serde(default)]
    pub controls: ChatControls,
}

/// Live handle to a submitted turn.
pub struct SessionHandle {
    pub session_id: Uuid,
    pub conversation_id: Uuid,
    pub events: mpsc::Receiver<SessionEvent>,
}

struct ServiceInner {
    pipeline: Arc<Pipeline>,
    sessions: Mutex<HashMap<Uuid, Arc<ChatSession>>>,
    live_by_conversation: Mutex<HashMap<Uuid, Arc<ChatSession>>>,
}

/// Entry point the transport layer talks to.  Cheap to clone; clones share
/// the session registry.
#[derive(Clone)]
pub struct ChatService {
    inner: Arc<ServiceInner>,
}

impl ChatService {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                pipeline,
                sessions: Mutex::new(HashMap::new()),
                live_by_conversation: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.inner.pipeline
    }

    /// Submit one chat turn and receive its event stream.
    pub async fn submit(&self, request: ChatRequest) -> Result<SessionHandle, EngineError> {
        let conversation_id = request.conversation_id.unwrap_or_else(Uuid::new_v4);

        // A turn already in flight for this conversation must reach a
        // terminal state before the new one starts.
        let previous = self
            .inner
            .live_by_conversation
            .lock()
            .await
            .get(&conversation_id)
            .cloned();
        if let Some(previous) = previous {
            info!(conversation = %conversation_id, "cancelling previous session");
            previous.cancel();
            previous.wait_terminal().await;
        }

        let (events_tx, events_rx) = mpsc::channel(64);
        let session = Arc::new(ChatSession::new(conversation_id, events_tx));
        let session_id = session.id();

        self.inner.sessions.lock().await.insert(session_id, Arc::clone(&session));
        self.inner
            .live_by_conversation
            .lock()
            .await
            .insert(conversation_id, Arc::clone(&session));

        session
            .emit(SessionEvent::SessionStart { session_id, conversation_id })
            .await;

        let inner = Arc::clone(&self.inner);
        let turn_session = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(err) = inner
                .pipeline
                .run_turn(Arc::clone(&turn_session), request)
                .await
            {
                error!(%err, session = %turn_session.id(), "turn aborted");
                turn_session
                    .emit(SessionEvent::Error { message: err.to_string() })
                    .await;
                if !turn_session.phase().is_terminal() {
                    let _ = turn_session.set_phase(SessionPhase::Done);
                }
            }
            retire(&inner, &turn_session).await;
        });

        Ok(SessionHandle { session_id, conversation_id, events: events_rx })
    }

    /// Raise a session's cancellation flag and wait until the session has
    /// observed it.  Returns `false` for unknown (or already retired)
    /// session ids.
    pub async fn cancel(&self, session_id: Uuid) -> bool {
        let session = self.inner.sessions.lock().await.get(&session_id).cloned();
        match session {
            Some(session) => {
                session.cancel();
                session.wait_terminal().await;
                true
            }
            None => false,
        }
    }

    /// Execute one module explicitly (ON_DEMAND surface).
    pub async fn run_module(
        &self,
        name: &str,
        conversation_id: Uuid,
    ) -> Result<ExecOutcome, EngineError> {
        self.inner.pipeline.run_module_by_name(name, conversation_id).await
    }
}

async fn retire(inner: &Arc<ServiceInner>, session: &Arc<ChatSession>) {
    // A newer session may already own the conversation slot.
    {
        let mut live = inner.live_by_conversation.lock().await;
        if live
            .get(&session.conversation_id())
            .is_some_and(|current| current.id() == session.id())
        {
            live.remove(&session.conversation_id());
        }
    }
    inner.sessions.lock().await.remove(&session.id());
}
