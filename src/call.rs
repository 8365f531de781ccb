//! Call requests and results exchanged with a transport.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::budget::{TokenUsage, TokenUsageParser};
use crate::error::TransportError;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Attach a participant name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A call waiting to be admitted and executed.
///
/// Only `messages`, `output_cap` and `output_count` are read by the queue;
/// everything in `options` is passed through to the transport untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCall {
    /// Resource class (model) the call is routed to.
    pub resource_class: String,
    /// Conversation to send.
    pub messages: Vec<Message>,
    /// Explicit cap on generated tokens per output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_cap: Option<u64>,
    /// Number of outputs requested. Zero is treated as one.
    #[serde(default = "default_output_count")]
    pub output_count: u32,
    /// Additional request parameters for the transport.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

fn default_output_count() -> u32 {
    1
}

impl PendingCall {
    /// Create a call for a resource class with the given messages.
    pub fn new(resource_class: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            resource_class: resource_class.into(),
            messages,
            output_cap: None,
            output_count: 1,
            options: Map::new(),
        }
    }

    /// Cap the number of generated tokens per output.
    pub fn with_output_cap(mut self, tokens: u64) -> Self {
        self.output_cap = Some(tokens);
        self
    }

    /// Request several outputs in one call.
    pub fn with_output_count(mut self, n: u32) -> Self {
        self.output_count = n;
        self
    }

    /// Set a passthrough request option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Effective output multiplier, never below one.
    pub fn multiplier(&self) -> u64 {
        u64::from(self.output_count.max(1))
    }

    /// Whether the caller bounded the output length.
    pub fn has_output_cap(&self) -> bool {
        self.output_cap.is_some()
    }
}

/// Successful outcome of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    /// Raw response from the service.
    pub response: Value,
    /// Tokens reported by the service.
    pub usage: TokenUsage,
}

impl CallResult {
    pub fn new(response: Value, usage: TokenUsage) -> Self {
        Self { response, usage }
    }

    /// Build a result from a JSON response carrying a `usage` object.
    pub fn from_response(response: Value) -> Result<Self, TransportError> {
        let usage = TokenUsageParser::new().parse_value(&response).ok_or_else(|| {
            TransportError::MalformedResponse("response has no usage information".to_string())
        })?;
        Ok(Self { response, usage })
    }

    /// Total tokens the service billed for this call.
    pub fn actual_tokens_consumed(&self) -> u64 {
        self.usage.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_call_builder() {
        let call = PendingCall::new("gpt-4", vec![Message::user("hi")])
            .with_output_cap(100)
            .with_output_count(3)
            .with_option("temperature", 0.2);

        assert_eq!(call.output_cap, Some(100));
        assert_eq!(call.multiplier(), 3);
        assert!(call.has_output_cap());
        assert_eq!(call.options["temperature"], json!(0.2));
    }

    #[test]
    fn test_zero_output_count_counts_as_one() {
        let call = PendingCall::new("gpt-4", vec![]).with_output_count(0);
        assert_eq!(call.multiplier(), 1);
    }

    #[test]
    fn test_message_serializes_lowercase_role() {
        let value = serde_json::to_value(Message::system("be brief")).unwrap();
        assert_eq!(value, json!({"role": "system", "content": "be brief"}));
    }

    #[test]
    fn test_call_result_from_openai_response() {
        let result = CallResult::from_response(json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42}
        }))
        .unwrap();

        assert_eq!(result.usage.prompt_tokens, 12);
        assert_eq!(result.usage.completion_tokens, 30);
        assert_eq!(result.actual_tokens_consumed(), 42);
    }

    #[test]
    fn test_call_result_without_usage_is_malformed() {
        let err = CallResult::from_response(json!({"choices": []})).unwrap_err();
        assert!(matches!(err, TransportError::MalformedResponse(_)));
    }
}
