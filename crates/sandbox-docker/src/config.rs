use std::time::Duration;

use crate::command::Privilege;

#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Docker CLI binary name or path.
    pub binary: String,
    pub privilege: Privilege,
    /// Pull images that are not present locally.
    pub pull_missing: bool,
    /// `--platform` passed to `docker pull` (e.g. `linux/amd64`).
    pub platform: Option<String>,
    /// Settle time after `docker run` before an instance is handed out.
    pub ready_delay: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            privilege: Privilege::User,
            pull_missing: true,
            platform: None,
            ready_delay: Duration::from_millis(500),
        }
    }
}
