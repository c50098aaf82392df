use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sandbox::{ExecRequest, ExecResult, InstanceSpec, Label, SandboxError, SandboxRuntime};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::command::{CommandError, exec, exec_raw};
use crate::config::DockerConfig;
use crate::policy::run_args;

/// Sandbox runtime backed by the `docker` CLI.
///
/// Every invocation is an argument vector handed straight to the binary;
/// no shell is involved on the host side.
pub struct DockerRuntime {
    config: DockerConfig,
    /// One cell per image, set once the image is confirmed present. The map
    /// lock is only held for the lookup, so a slow pull of one image never
    /// blocks starts of another.
    images: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl DockerRuntime {
    /// Check prerequisites and build the runtime.
    pub async fn new(config: DockerConfig) -> Result<Self, SandboxError> {
        crate::prerequisites::check_prerequisites(&config).await?;
        info!(binary = %config.binary, privilege = ?config.privilege, "docker runtime ready");
        Ok(Self {
            config,
            images: Mutex::new(HashMap::new()),
        })
    }

    async fn docker(&self, args: &[&str]) -> Result<String, CommandError> {
        exec(&self.config.binary, args, self.config.privilege).await
    }

    /// Make sure `image` exists locally, pulling it if allowed. Concurrent
    /// callers for the same image share one inspect/pull.
    async fn ensure_image(&self, image: &str) -> sandbox::Result<()> {
        let cell = {
            let mut images = self.images.lock().await;
            Arc::clone(images.entry(image.to_string()).or_default())
        };
        cell.get_or_try_init(|| self.fetch_image(image)).await?;
        Ok(())
    }

    async fn fetch_image(&self, image: &str) -> sandbox::Result<()> {
        if self.docker(&["image", "inspect", image]).await.is_ok() {
            return Ok(());
        }
        if !self.config.pull_missing {
            return Err(SandboxError::ImageUnavailable(format!(
                "{image} not found locally and pulling is disabled"
            )));
        }

        info!(image, "image not found locally, pulling");
        let mut args = vec!["pull"];
        if let Some(platform) = &self.config.platform {
            args.push("--platform");
            args.push(platform);
        }
        args.push(image);
        if let Err(pull_err) = self.docker(&args).await {
            if self.docker(&["info"]).await.is_err() {
                return Err(SandboxError::BackendNotAvailable(
                    "docker daemon is not running".into(),
                ));
            }
            return Err(SandboxError::ImageUnavailable(format!(
                "{image} not found locally and could not be pulled: {}",
                pull_err.detail
            )));
        }
        info!(image, "image pulled");
        Ok(())
    }
}

fn is_missing(detail: &str) -> bool {
    detail.contains("No such") || detail.contains("Could not find")
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn start(&self, spec: &InstanceSpec) -> sandbox::Result<String> {
        self.ensure_image(&spec.image).await?;

        let args = run_args(spec);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self
            .docker(&arg_refs)
            .await
            .map_err(|e| SandboxError::CreationFailed(e.to_string()))?;
        if id.is_empty() {
            return Err(SandboxError::CreationFailed(format!(
                "docker run printed no container id for {}",
                spec.image
            )));
        }

        tokio::time::sleep(self.config.ready_delay).await;
        Ok(id)
    }

    async fn remove(&self, id: &str) -> sandbox::Result<()> {
        match self.docker(&["rm", "-f", id]).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e.detail) => Ok(()),
            Err(e) => Err(SandboxError::ExecFailed(e.to_string())),
        }
    }

    async fn is_running(&self, id: &str) -> sandbox::Result<bool> {
        match self
            .docker(&["inspect", "--format", "{{.State.Running}}", id])
            .await
        {
            Ok(state) => Ok(state == "true"),
            Err(e) if is_missing(&e.detail) => Ok(false),
            Err(e) => Err(SandboxError::BackendNotAvailable(e.to_string())),
        }
    }

    async fn list(&self, label: &Label) -> sandbox::Result<Vec<String>> {
        let filter = format!("label={label}");
        let out = self
            .docker(&["ps", "-a", "-q", "--no-trunc", "--filter", &filter])
            .await
            .map_err(|e| SandboxError::BackendNotAvailable(e.to_string()))?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn exec(&self, id: &str, request: &ExecRequest<'_>) -> sandbox::Result<ExecResult> {
        let env_pairs: Vec<String> = request.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut args: Vec<&str> = vec!["exec"];
        if request.stdin.is_some() {
            args.push("-i");
        }
        if let Some(dir) = request.workdir {
            args.push("-w");
            args.push(dir);
        }
        for pair in &env_pairs {
            args.push("-e");
            args.push(pair);
        }
        args.push(id);
        args.extend_from_slice(request.argv);

        let output = exec_raw(&self.config.binary, &args, self.config.privilege, request.stdin)
            .await
            .map_err(|e| SandboxError::ExecFailed(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        // A non-zero status may come from the command or from docker itself
        // (instance gone). Output is the command's own and is never parsed;
        // the liveness probe decides.
        if !output.status.success() && !self.is_running(id).await? {
            debug!(id, "exec failed because the instance is not running");
            return Err(SandboxError::NotFound(format!("instance {id} is not running")));
        }

        Ok(ExecResult {
            exit_code: exit_code(output.status),
            stdout,
            stderr,
        })
    }

    async fn copy_in(&self, id: &str, source: &Path, dest: &str) -> sandbox::Result<()> {
        let source = source.to_string_lossy();
        let target = format!("{id}:{dest}");
        self.docker(&["cp", &source, &target])
            .await
            .map_err(|e| SandboxError::CopyFailed(e.to_string()))?;
        Ok(())
    }

    async fn copy_out(&self, id: &str, source: &str, dest_dir: &Path) -> sandbox::Result<()> {
        let from = format!("{id}:{source}");
        let dest = dest_dir.to_string_lossy();
        match self.docker(&["cp", &from, &dest]).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e.detail) => Err(SandboxError::NotFound(source.to_string())),
            Err(e) => Err(SandboxError::CopyFailed(e.to_string())),
        }
    }
}
