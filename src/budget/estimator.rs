//! Pre-call cost estimation.
//!
//! The cost of a call is only known once the service answers, but admission
//! has to reserve budget before sending. The estimate is the prompt cost plus
//! the requested output cap, scaled by the number of outputs requested.
//! Prompt counting is pluggable through [`PromptCounter`]; [`TokenEstimator`]
//! is a tokenizer-free heuristic used by default.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::call::{Message, PendingCall};
use crate::error::EstimationError;

/// Framing tokens added to every chat message.
const TOKENS_PER_MESSAGE: u64 = 3;
/// Extra token when a message carries a participant name.
const TOKENS_PER_NAME: u64 = 1;
/// Tokens priming the assistant reply.
const REPLY_PRIMER_TOKENS: u64 = 3;

/// Counts the prompt-side tokens of a conversation.
///
/// Implementations must be deterministic and free of side effects.
pub trait PromptCounter: Send + Sync {
    fn count(&self, messages: &[Message]) -> Result<u64, EstimationError>;
}

impl<F> PromptCounter for F
where
    F: Fn(&[Message]) -> Result<u64, EstimationError> + Send + Sync,
{
    fn count(&self, messages: &[Message]) -> Result<u64, EstimationError> {
        self(messages)
    }
}

/// Token estimation strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimationMethod {
    /// Simple character-based estimation (3.5 chars ≈ 1 token)
    CharacterBased,
    /// Word-based estimation (1 word ≈ 1.3 tokens)
    WordBased,
    /// Higher of the two, with a safety margin
    #[default]
    Conservative,
}

/// Heuristic token counter for chat text.
#[derive(Debug, Clone)]
pub struct TokenEstimator {
    method: EstimationMethod,
    /// Multiplier applied to the raw estimate
    safety_margin: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            method: EstimationMethod::Conservative,
            safety_margin: 1.2,
        }
    }
}

impl TokenEstimator {
    /// Create an estimator with the specified method.
    pub fn new(method: EstimationMethod) -> Self {
        let safety_margin = match method {
            EstimationMethod::CharacterBased | EstimationMethod::WordBased => 1.0,
            EstimationMethod::Conservative => 1.2,
        };
        Self {
            method,
            safety_margin,
        }
    }

    /// Create a conservative estimator with a custom safety margin (at least 1.0).
    pub fn conservative(safety_margin: f64) -> Self {
        Self {
            method: EstimationMethod::Conservative,
            safety_margin: safety_margin.max(1.0),
        }
    }

    /// Estimate tokens in a piece of text.
    pub fn estimate(&self, text: &str) -> u64 {
        let base = match self.method {
            EstimationMethod::CharacterBased => estimate_by_chars(text),
            EstimationMethod::WordBased => estimate_by_words(text),
            EstimationMethod::Conservative => estimate_by_chars(text).max(estimate_by_words(text)),
        };
        (base as f64 * self.safety_margin).ceil() as u64
    }

    /// Estimate tokens of a chat conversation including message framing.
    pub fn estimate_messages(&self, messages: &[Message]) -> Result<u64, EstimationError> {
        if messages.is_empty() {
            return Err(EstimationError::EmptyConversation);
        }

        let mut total = REPLY_PRIMER_TOKENS;
        for message in messages {
            if message.content.contains('\0') {
                return Err(EstimationError::MalformedContent(
                    "message content contains a NUL byte".to_string(),
                ));
            }
            total += TOKENS_PER_MESSAGE;
            total += self.estimate(message.role.as_str());
            total += self.estimate(&message.content);
            if let Some(name) = &message.name {
                total += self.estimate(name) + TOKENS_PER_NAME;
            }
        }
        Ok(total)
    }
}

impl PromptCounter for TokenEstimator {
    fn count(&self, messages: &[Message]) -> Result<u64, EstimationError> {
        self.estimate_messages(messages)
    }
}

fn estimate_by_chars(text: &str) -> u64 {
    (text.chars().count() as f64 / 3.5).ceil() as u64
}

fn estimate_by_words(text: &str) -> u64 {
    (text.split_whitespace().count() as f64 * 1.3).ceil() as u64
}

/// Breakdown of a call's reserved cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Prompt tokens for a single output
    pub prompt_tokens: u64,
    /// Output cap across all outputs (zero when uncapped)
    pub output_allowance: u64,
    /// Output multiplicity applied
    pub multiplier: u64,
    /// Tokens reserved at admission
    pub total: u64,
}

/// Computes the tokens a call must reserve before it is sent.
#[derive(Clone)]
pub struct CostEstimator {
    counter: Arc<dyn PromptCounter>,
}

impl Default for CostEstimator {
    fn default() -> Self {
        Self::new(TokenEstimator::default())
    }
}

impl fmt::Debug for CostEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CostEstimator").finish_non_exhaustive()
    }
}

impl CostEstimator {
    pub fn new(counter: impl PromptCounter + 'static) -> Self {
        Self {
            counter: Arc::new(counter),
        }
    }

    pub fn from_arc(counter: Arc<dyn PromptCounter>) -> Self {
        Self { counter }
    }

    /// `(prompt + cap) × max(1, n)`.
    pub fn estimate(&self, call: &PendingCall) -> Result<CostEstimate, EstimationError> {
        let prompt_tokens = self.counter.count(&call.messages)?;
        let cap = call.output_cap.unwrap_or(0);
        let multiplier = call.multiplier();

        Ok(CostEstimate {
            prompt_tokens,
            output_allowance: cap.saturating_mul(multiplier),
            multiplier,
            total: prompt_tokens.saturating_add(cap).saturating_mul(multiplier),
        })
    }
}
