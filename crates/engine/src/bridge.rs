//! Synchronous LLM bridge handed to sandboxed scripts.
//!
//! Scripts run on blocking worker threads, so `ctx.generate` / `ctx.reflect`
//! reach the async provider layer by blocking on the runtime handle captured
//! when the turn started.  The session's cancellation flag rides along: a
//! cancelled session turns the pending call into an error string, which the
//! plugin degrades to its fallback.

use std::sync::Arc;

use promptstage_llm::{
    ChatControls, ChatMessage, ChatRole, ProviderKind, ProviderSelector, ProviderSettings,
};
use promptstage_script::{AiBridge, AiCallSpec};

use crate::cancel::CancelFlag;

pub(crate) struct SessionAiBridge {
    handle: tokio::runtime::Handle,
    providers: Arc<dyn ProviderSelector>,
    kind: ProviderKind,
    settings: ProviderSettings,
    cancel: CancelFlag,
}

impl SessionAiBridge {
    pub fn new(
        handle: tokio::runtime::Handle,
        providers: Arc<dyn ProviderSelector>,
        kind: ProviderKind,
        settings: ProviderSettings,
        cancel: CancelFlag,
    ) -> Self {
        Self { handle, providers, kind, settings, cancel }
    }
}

fn spec_messages(spec: &AiCallSpec) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if !spec.system_prompt.is_empty() {
        messages.push(ChatMessage::system(spec.system_prompt.clone()));
    }
    let content = match &spec.input {
        Some(input) => format!("{}\n\n{input}", spec.instructions),
        None => spec.instructions.clone(),
    };
    let role = match spec.role.as_deref() {
        Some("assistant") => ChatRole::Assistant,
        Some("system") => ChatRole::System,
        _ => ChatRole::User,
    };
    messages.push(ChatMessage { role, content });
    messages
}

impl AiBridge for SessionAiBridge {
    fn call(&self, spec: AiCallSpec) -> Result<String, String> {
        let messages = spec_messages(&spec);
        let controls = ChatControls {
            temperature: spec.temperature,
            max_tokens: spec.max_tokens,
            stop: Vec::new(),
            stream: false,
        };
        let cancel = self.cancel.subscribe();

        let result = self.handle.block_on(async {
            self.providers
                .provider(self.kind)
                .complete(&self.settings, &messages, &controls, cancel)
                .await
        });

        match result {
            Ok(completion) if completion.cancelled => Err("llm call cancelled".to_string()),
            Ok(completion) => Ok(completion.content),
            Err(err) => Err(err.to_string()),
        }
    }
}
