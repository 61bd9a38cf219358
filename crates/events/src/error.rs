use beacon_core::error::CoreError;

/// Errors surfaced by the engine.
///
/// Domain failures (not found, validation, lost optimistic races) travel as
/// [`CoreError`]; storage failures keep their `sqlx` source.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Core(CoreError::Conflict(_)))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Core(CoreError::NotFound { .. }))
    }
}

impl From<validator::ValidationErrors> for EngineError {
    fn from(errors: validator::ValidationErrors) -> Self {
        EngineError::Core(errors.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
