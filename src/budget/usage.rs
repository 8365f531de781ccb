//! Actual token usage reported by the completion service.
//!
//! Services report usage in different shapes:
//!
//! - **OpenAI**: `{"usage": {"prompt_tokens": N, "completion_tokens": N}}`
//! - **Anthropic**: `{"usage": {"input_tokens": N, "output_tokens": N}}`
//!
//! The parser accepts either, on the whole response or on the usage object itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tokens consumed by a completed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt-side tokens
    pub prompt_tokens: u64,
    /// Generated tokens across all outputs
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Get total tokens.
    pub fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

impl std::ops::Add for TokenUsage {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens.saturating_add(other.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(other.completion_tokens),
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

/// Anthropic usage format.
#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

/// OpenAI usage format.
#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Extracts [`TokenUsage`] from service responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsageParser;

impl TokenUsageParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse usage from a raw response body.
    pub fn parse(&self, body: &str) -> Option<TokenUsage> {
        let value: Value = serde_json::from_str(body.trim()).ok()?;
        self.parse_value(&value)
    }

    /// Parse usage from a decoded response, or from a bare usage object.
    pub fn parse_value(&self, value: &Value) -> Option<TokenUsage> {
        match value.get("usage") {
            Some(usage) => self.parse_usage_object(usage),
            None => self.parse_usage_object(value),
        }
    }

    fn parse_usage_object(&self, value: &Value) -> Option<TokenUsage> {
        if !value.is_object() {
            return None;
        }

        if let Ok(usage) = serde_json::from_value::<AnthropicUsage>(value.clone()) {
            return Some(TokenUsage::new(usage.input_tokens, usage.output_tokens));
        }

        // Embedding-style responses omit completion_tokens.
        if let Ok(usage) = serde_json::from_value::<OpenAIUsage>(value.clone()) {
            return Some(TokenUsage::new(usage.prompt_tokens, usage.completion_tokens));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_openai_usage() {
        let body = r#"{"usage": {"prompt_tokens": 1000, "completion_tokens": 800, "total_tokens": 1800}}"#;
        let usage = TokenUsageParser::new().parse(body).unwrap();

        assert_eq!(usage.prompt_tokens, 1000);
        assert_eq!(usage.completion_tokens, 800);
        assert_eq!(usage.total(), 1800);
    }

    #[test]
    fn test_parse_anthropic_usage() {
        let body = r#"{"id":"msg_123","type":"message","role":"assistant","content":[{"type":"text","text":"Hello!"}],"usage":{"input_tokens":42,"output_tokens":15}}"#;
        let usage = TokenUsageParser::new().parse(body).unwrap();

        assert_eq!(usage, TokenUsage::new(42, 15));
    }

    #[test]
    fn test_parse_bare_usage_object() {
        let usage = TokenUsageParser::new()
            .parse_value(&json!({"prompt_tokens": 7, "completion_tokens": 3}))
            .unwrap();
        assert_eq!(usage.total(), 10);
    }

    #[test]
    fn test_parse_without_completion_tokens() {
        let usage = TokenUsageParser::new()
            .parse_value(&json!({"usage": {"prompt_tokens": 9, "total_tokens": 9}}))
            .unwrap();
        assert_eq!(usage, TokenUsage::new(9, 0));
    }

    #[test]
    fn test_parse_no_usage() {
        let parser = TokenUsageParser::new();
        assert!(parser.parse("Just some plain text").is_none());
        assert!(parser.parse_value(&json!({"choices": []})).is_none());
        assert!(parser.parse_value(&json!({"usage": 12})).is_none());
    }

    #[test]
    fn test_usage_addition() {
        let mut total = TokenUsage::new(100, 200) + TokenUsage::new(50, 100);
        total += TokenUsage::new(1, 1);
        assert_eq!(total, TokenUsage::new(151, 301));
    }

    #[test]
    fn test_oversized_reported_counts_saturate() {
        let usage = TokenUsageParser::new()
            .parse_value(&json!({
                "usage": {"prompt_tokens": u64::MAX, "completion_tokens": 10}
            }))
            .unwrap();
        assert_eq!(usage.total(), u64::MAX);

        let mut sum = usage + TokenUsage::new(1, 1);
        sum += TokenUsage::new(1, 0);
        assert_eq!(sum.prompt_tokens, u64::MAX);
        assert_eq!(sum.completion_tokens, 11);
    }
}
