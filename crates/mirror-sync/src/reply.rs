use chrono::{DateTime, Utc};
use openagents_gateway_proto::{ChatEvent, TokenUsage};
use openagents_mirror_store::{Interruption, Message, Role};

/// Assistant output accumulated for one run until it ends.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingReply {
    pub run_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub content: String,
    pub model: Option<String>,
    pub started_at: DateTime<Utc>,
    pub usage: Option<TokenUsage>,
}

impl StreamingReply {
    pub fn new(
        run_id: impl Into<String>,
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            content: String::new(),
            model: None,
            started_at,
            usage: None,
        }
    }

    /// Fold one delta in. Delta text is appended.
    pub fn absorb_delta(&mut self, event: &ChatEvent) {
        self.content.push_str(&event.text());
        if event.model.is_some() {
            self.model.clone_from(&event.model);
        }
    }

    /// Fold the final event in. A final event that carries text replaces
    /// what the deltas built.
    pub fn absorb_final(&mut self, event: &ChatEvent) {
        let text = event.text();
        if !text.is_empty() {
            self.content = text;
        }
        if event.model.is_some() {
            self.model.clone_from(&event.model);
        }
        if event.usage.is_some() {
            self.usage = event.usage;
        }
    }

    pub fn into_message(self, interrupted: Option<Interruption>) -> Message {
        let usage_tokens = self.usage.and_then(|usage| {
            usage.total_tokens.or_else(|| match (usage.input, usage.output) {
                (None, None) => None,
                (input, output) => Some(input.unwrap_or(0) + output.unwrap_or(0)),
            })
        });
        let mut message = Message::new(
            self.message_id,
            self.conversation_id,
            Role::Assistant,
            self.content,
            self.started_at,
        );
        message.model_used = self.model;
        message.usage_tokens = usage_tokens;
        message.interrupted = interrupted;
        message
    }
}
