use sandbox::SandboxError;

use crate::command::exec;
use crate::config::DockerConfig;

/// Verify that the docker CLI is installed and the daemon answers.
///
/// Collects all failures and returns them in a single `BackendNotAvailable` error.
pub async fn check_prerequisites(config: &DockerConfig) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    check_binary(&config.binary, &mut errors);
    if errors.is_empty() {
        check_daemon(config, &mut errors).await;
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(errors.join("; ")))
    }
}

fn check_binary(binary: &str, errors: &mut Vec<String>) {
    if which::which(binary).is_err() {
        errors.push(format!("required command not found: {binary}"));
    }
}

async fn check_daemon(config: &DockerConfig, errors: &mut Vec<String>) {
    if let Err(e) = exec(
        &config.binary,
        &["version", "--format", "{{.Server.Version}}"],
        config.privilege,
    )
    .await
    {
        errors.push(format!(
            "docker daemon is not reachable; start it or check permissions ({})",
            e.detail
        ));
    }
}
