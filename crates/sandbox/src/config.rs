use std::fmt;

/// Resource ceilings applied to every instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Fractional CPU share (e.g. `0.5` = half a core).
    pub cpus: f64,
    pub memory_mb: u32,
    /// Maximum number of processes/threads inside the instance.
    pub pids: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: 0.5,
            memory_mb: 300,
            pids: 20,
        }
    }
}

/// Isolation settings for one pool's instances.
///
/// Everything except `read_only_rootfs` defaults to the locked-down value.
/// The root filesystem lock is left to each pool because both runners
/// write into the instance (figures, staged sources, compiled binaries).
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityPolicy {
    pub network_disabled: bool,
    pub drop_all_capabilities: bool,
    pub no_new_privileges: bool,
    pub read_only_rootfs: bool,
    pub limits: ResourceLimits,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            network_disabled: true,
            drop_all_capabilities: true,
            no_new_privileges: true,
            read_only_rootfs: false,
            limits: ResourceLimits::default(),
        }
    }
}

/// A `key=value` tag attached to instances so a pool can find its own
/// instances again (e.g. stale ones left by a previous process).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Everything the runtime needs to start one long-lived instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub image: String,
    /// Keep-alive command run as the instance's main process.
    pub command: Vec<String>,
    pub policy: SecurityPolicy,
    pub label: Label,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_locked_down_except_rootfs() {
        let policy = SecurityPolicy::default();
        assert!(policy.network_disabled);
        assert!(policy.drop_all_capabilities);
        assert!(policy.no_new_privileges);
        assert!(!policy.read_only_rootfs);
        assert_eq!(policy.limits.pids, 20);
        assert_eq!(policy.limits.memory_mb, 300);
    }

    #[test]
    fn label_displays_as_key_value() {
        let label = Label::new("code-runner.pool", "python");
        assert_eq!(label.to_string(), "code-runner.pool=python");
    }
}
