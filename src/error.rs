use thiserror::Error;

/// Rejections raised by [`Engine::execute`](crate::engine::Engine::execute)
/// before any sandbox is committed.
///
/// Outcomes of a committed execution (compile errors, timeouts, crashes...) are
/// never reported through this type; they are folded into
/// [`ExecutionResult::status`](crate::engine::ExecutionResult::status).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl EngineError {
    /// Stable machine-readable reason, used by the HTTP layer and the statistics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnsupportedLanguage(_) => "UnsupportedLanguage",
            Self::InvalidInput(_) => "InvalidInput",
            Self::ResourceExhausted(_) => "ResourceExhausted",
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
