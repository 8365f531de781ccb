//! Error types for dispatch, transport, estimation and configuration.

use std::path::PathBuf;

use thiserror::Error;

/// Failure reported by a transport for a single attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection-level failure (DNS, reset, timeout).
    #[error("network error: {0}")]
    Network(String),

    /// The remote service answered with an error status.
    #[error("remote error {status}: {message}")]
    Remote { status: u16, message: String },

    /// The response could not be interpreted.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The attempt ended without producing a response (panic or abort).
    #[error("attempt aborted: {0}")]
    Aborted(String),
}

/// Failure computing the pre-call cost of a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EstimationError {
    #[error("cannot estimate a call with no messages")]
    EmptyConversation,

    #[error("malformed content: {0}")]
    MalformedContent(String),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Layered configuration could not be read.
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    /// TOML document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A resource class has unusable limits.
    #[error("invalid resource class '{name}': {reason}")]
    InvalidClass { name: String, reason: String },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Caller-visible dispatch failures.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No queue is registered under this name.
    #[error("unknown resource class: {name}")]
    UnknownResourceClass { name: String },

    /// Every attempt failed.
    #[error("call to '{resource_class}' failed after {attempts} attempts: {last_error}")]
    Exhausted {
        resource_class: String,
        attempts: u32,
        last_error: TransportError,
    },

    /// The cost of the call could not be estimated.
    #[error("estimation failed: {0}")]
    Estimation(#[from] EstimationError),

    /// The call can never fit into one minute of token budget.
    #[error(
        "estimated cost {estimated} exceeds token capacity {capacity} of '{resource_class}'"
    )]
    CostExceedsCapacity {
        resource_class: String,
        estimated: u64,
        capacity: u64,
    },

    /// Registration was attempted with unusable limits.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

impl DispatchError {
    /// Whether the caller may reasonably try the same call again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Exhausted { .. })
    }
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
