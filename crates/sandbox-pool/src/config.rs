use std::time::Duration;

use sandbox::{InstanceSpec, Label, SecurityPolicy};

/// Label key stamped on every instance a pool starts; the value is the pool
/// name.
pub const POOL_LABEL_KEY: &str = "code-runner.pool";

/// Configuration for a [`ContainerPool`](crate::ContainerPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Short name used in logs and in the instance label (`python`, `cpp`).
    pub name: String,
    pub image: String,
    /// Keep-alive command the instance runs; empty means the image default.
    pub command: Vec<String>,
    pub policy: SecurityPolicy,
    /// Target number of pre-warmed instances. The total never exceeds twice this.
    pub size: usize,
    /// Available instances unused for longer than this are removed.
    pub idle_timeout: Duration,
    /// Period of the background idle sweep.
    pub eviction_interval: Duration,
    /// How many times `acquire` re-checks before giving up.
    pub acquire_attempts: u32,
    /// Upper bound on each wait between re-checks.
    pub acquire_interval: Duration,
    /// Directories whose contents are wiped when an instance is returned.
    pub scrub_dirs: Vec<String>,
    /// Kill every process in the instance (except its init) on return.
    pub reap_processes: bool,
    /// Remove labelled instances left behind by a previous process on
    /// `initialize`.
    pub sweep_stale: bool,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            policy: SecurityPolicy::default(),
            size: 5,
            idle_timeout: Duration::from_secs(120),
            eviction_interval: Duration::from_secs(30),
            acquire_attempts: 50,
            acquire_interval: Duration::from_millis(100),
            scrub_dirs: vec!["/tmp".to_string()],
            reap_processes: true,
            sweep_stale: true,
        }
    }

    /// Upper bound on instances in any state.
    pub fn ceiling(&self) -> usize {
        self.size.saturating_mul(2)
    }

    pub fn label(&self) -> Label {
        Label::new(POOL_LABEL_KEY, &self.name)
    }

    pub(crate) fn instance_spec(&self) -> InstanceSpec {
        InstanceSpec {
            image: self.image.clone(),
            command: self.command.clone(),
            policy: self.policy.clone(),
            label: self.label(),
        }
    }
}
