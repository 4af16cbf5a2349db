//! Typed errors that make further iterations pointless.
//!
//! Everything else (agent crashes, gate failures, tracker write failures)
//! is contained: it becomes a recorded [`crate::r#loop::IterationResult`]
//! and the loop decides what to do next.

/// Fatal per-invocation errors raised by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("This tool must be run inside a git repository (git init).")]
    NotAGitRepo,

    #[error(
        "Rate limit reached ({limit}/hour). Wait ~{wait_seconds}s or increase rate_limit_per_hour."
    )]
    RateLimitExceeded { limit: u32, wait_seconds: u64 },

    #[error("Unknown agent '{agent}'. Available runners: {available}")]
    UnknownAgent { agent: String, available: String },
}
