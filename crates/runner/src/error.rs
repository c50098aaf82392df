use sandbox::SandboxError;
use sandbox_pool::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("execution fault: {0}")]
    Fault(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SandboxError> for RunnerError {
    fn from(e: SandboxError) -> Self {
        Self::SandboxUnavailable(e.to_string())
    }
}

impl From<PoolError> for RunnerError {
    fn from(e: PoolError) -> Self {
        Self::SandboxUnavailable(e.to_string())
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;
