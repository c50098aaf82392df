use std::path::Path;

use async_trait::async_trait;

use crate::config::{InstanceSpec, Label};
use crate::error::Result;
use crate::types::{ExecRequest, ExecResult};

/// The narrow command surface of an isolation backend.
///
/// Instances are addressed by the opaque id returned from [`start`](Self::start).
/// Implementations must be cancel-safe: dropping an `exec` future abandons
/// the in-instance process but must not leave host-side helpers running.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Human-readable backend name (e.g. "docker").
    fn name(&self) -> &str;

    // -- lifecycle --
    /// Start a detached, long-lived instance and return its id.
    async fn start(&self, spec: &InstanceSpec) -> Result<String>;
    /// Destroy an instance, running or not.
    async fn remove(&self, id: &str) -> Result<()>;
    /// Liveness probe.
    async fn is_running(&self, id: &str) -> Result<bool>;
    /// Ids of all instances carrying `label`, running or not.
    async fn list(&self, label: &Label) -> Result<Vec<String>>;

    // -- operations --
    async fn exec(&self, id: &str, request: &ExecRequest<'_>) -> Result<ExecResult>;
    /// Copy a host file or directory to `dest` inside the instance.
    async fn copy_in(&self, id: &str, source: &Path, dest: &str) -> Result<()>;
    /// Copy `source` from the instance into the host directory `dest_dir`,
    /// keeping its base name. Returns [`SandboxError::NotFound`] when
    /// `source` does not exist.
    ///
    /// [`SandboxError::NotFound`]: crate::SandboxError::NotFound
    async fn copy_out(&self, id: &str, source: &str, dest_dir: &Path) -> Result<()>;
}
