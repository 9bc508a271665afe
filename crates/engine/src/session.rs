//! Per-turn chat session: phase machine, event emission, cancellation.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::error::EngineError;
use crate::events::SessionEvent;

/// Lifecycle of one chat turn.
///
/// ```text
/// Idle → AwaitingStage1 → AwaitingStage2 → Streaming → PostResponse → Done
///              ↓                ↓              ↓            ↓
///          Cancelled ←──────────┴──────────────┴────────────┘
/// ```
///
/// `Done` is additionally reachable from any live phase so a provider
/// failure can close the turn after its `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    AwaitingStage1,
    AwaitingStage2,
    Streaming,
    PostResponse,
    Done,
    Cancelled,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Done | SessionPhase::Cancelled)
    }

    fn next_allowed(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Cancelled | Done => true,
            AwaitingStage1 => self == Idle,
            AwaitingStage2 => self == AwaitingStage1,
            Streaming => self == AwaitingStage2,
            PostResponse => self == Streaming,
            Idle => false,
        }
    }
}

/// One in-flight chat turn.  Owns the cancellation flag observed by the
/// resolver, the sandbox, and the provider layer, plus the session-wide
/// reflection counter shared by every script of the turn.
pub struct ChatSession {
    id: Uuid,
    conversation_id: Uuid,
    cancel: CancelFlag,
    reflection_depth: Arc<AtomicU32>,
    events: mpsc::Sender<SessionEvent>,
    phase: watch::Sender<SessionPhase>,
}

impl ChatSession {
    pub fn new(conversation_id: Uuid, events: mpsc::Sender<SessionEvent>) -> Self {
        let (phase, _) = watch::channel(SessionPhase::Idle);
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            cancel: CancelFlag::new(),
            reflection_depth: Arc::new(AtomicU32::new(0)),
            events,
            phase,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn reflection_depth(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.reflection_depth)
    }

    /// One-shot external cancellation.
    pub fn cancel(&self) {
        self.cancel.raise();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_raised()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Advance the phase machine; an impossible transition is an engine bug.
    pub fn set_phase(&self, next: SessionPhase) -> Result<(), EngineError> {
        let current = self.phase();
        if !current.next_allowed(next) {
            return Err(EngineError::Invariant(format!(
                "illegal session transition {current:?} → {next:?}"
            )));
        }
        debug!(session = %self.id, ?current, ?next, "session phase");
        let _ = self.phase.send(next);
        Ok(())
    }

    /// Deliver an event to the external surface.  A gone receiver means the
    /// caller stopped listening; the turn still runs to completion.
    pub async fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }

    /// Resolves once the session reaches `Done` or `Cancelled`.
    pub async fn wait_terminal(&self) -> SessionPhase {
        let mut rx = self.phase.subscribe();
        loop {
            let current = *rx.borrow();
            if current.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (ChatSession, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (ChatSession::new(Uuid::new_v4(), tx), rx)
    }

    #[tokio::test]
    async fn happy_path_transitions() {
        let (session, _rx) = session();
        for phase in [
            SessionPhase::AwaitingStage1,
            SessionPhase::AwaitingStage2,
            SessionPhase::Streaming,
            SessionPhase::PostResponse,
            SessionPhase::Done,
        ] {
            session.set_phase(phase).unwrap();
        }
        assert!(session.phase().is_terminal());
    }

    #[tokio::test]
    async fn skipping_a_stage_is_an_invariant_violation() {
        let (session, _rx) = session();
        session.set_phase(SessionPhase::AwaitingStage1).unwrap();
        assert!(matches!(
            session.set_phase(SessionPhase::Streaming),
            Err(EngineError::Invariant(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_is_reachable_from_any_live_phase() {
        let (session, _rx) = session();
        session.set_phase(SessionPhase::AwaitingStage1).unwrap();
        session.set_phase(SessionPhase::Cancelled).unwrap();
        // ... and terminal states are sticky.
        assert!(session.set_phase(SessionPhase::Done).is_err());
    }

    #[tokio::test]
    async fn wait_terminal_wakes_on_done() {
        let (session, _rx) = session();
        let session = std::sync::Arc::new(session);
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_terminal().await })
        };

        session.set_phase(SessionPhase::AwaitingStage1).unwrap();
        session.set_phase(SessionPhase::Done).unwrap();
        assert_eq!(waiter.await.unwrap(), SessionPhase::Done);
    }

    #[tokio::test]
    async fn events_flow_to_the_receiver() {
        let (session, mut rx) = session();
        session.emit(SessionEvent::Cancelled).await;
        assert!(matches!(rx.recv().await, Some(SessionEvent::Cancelled)));
    }
}
