#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("image not available: {0}")]
    ImageUnavailable(String),

    #[error("instance creation failed: {0}")]
    CreationFailed(String),

    #[error("execution failed: {0}")]
    ExecFailed(String),

    #[error("copy failed: {0}")]
    CopyFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
