use sandbox::SandboxError;

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no instance available in pool {pool} (image {image}): {detail}")]
    Exhausted {
        pool: String,
        image: String,
        detail: String,
    },

    #[error("pool {0} was shut down")]
    ShutDown(String),

    #[error("pool {pool}: background task failed: {detail}")]
    Task { pool: String, detail: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}
