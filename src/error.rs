use thiserror::Error;

/// Normalized error type for the bridge.
///
/// Every variant maps to a machine-readable kind string (see [`BridgeError::kind`])
/// that tools surface to the client alongside a single-sentence message.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid arguments: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Blocked by policy: {0}")]
    Blocked(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Kernel runtime error: {0}")]
    KernelRuntime(String),

    #[error("Sub-agent limit exhausted: {0}")]
    SandboxLimit(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// Machine-readable error kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Validation(_) => "validation",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::Blocked(_) => "blocked",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::Transport(_) => "transport",
            BridgeError::KernelRuntime(_) => "kernel_runtime",
            BridgeError::SandboxLimit(_) => "sandbox_limit",
            BridgeError::RateLimited(_) => "rate_limited",
            BridgeError::Unavailable(_) => "unavailable",
            BridgeError::Conflict(_) => "conflict",
            BridgeError::Serialization(_)
            | BridgeError::Io(_)
            | BridgeError::Internal(_)
            | BridgeError::Other(_) => "internal",
        }
    }

    /// True for kinds the caller may retry (transport-level flakes).
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Transport(_) | BridgeError::Timeout(_))
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BridgeError::Timeout(err.to_string())
        } else if err.is_connect() {
            BridgeError::Transport(format!("connection failed: {err}"))
        } else {
            BridgeError::Transport(err.to_string())
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
