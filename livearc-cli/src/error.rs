use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Capture error: {0}")]
    Archive(#[from] livearc_engine::ArchiveError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl AppError {
    /// The capture was interrupted by the user rather than failing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Archive(livearc_engine::ArchiveError::Cancelled))
    }
}
