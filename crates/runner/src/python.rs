use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sandbox::{ExecRequest, ExecResult, SandboxError};
use sandbox_pool::ContainerPool;
use tracing::{debug, info, warn};

use crate::error::RunnerResult;
use crate::types::{ErrorKind, ExecutionResult, Image};

/// Directory inside the instance that figures are saved to.
const OUTPUT_DIR: &str = "/tmp/output";
/// Base name of [`OUTPUT_DIR`], where `copy_out` lands it on the host.
const OUTPUT_DIR_NAME: &str = "output";
const WORKDIR: &str = "/tmp";

pub(crate) const TIMEOUT_MESSAGE: &str = "Execution timeout: Code took too long to run";

/// Runs before user code. Names are prefixed so user code does not clash.
const PROLOGUE: &str = r#"import os as _cr_os
_cr_os.makedirs("/tmp/output", exist_ok=True)
"#;

/// Runs after user code. Saves every open figure, touching matplotlib only
/// when the submission imported it.
const EPILOGUE: &str = r#"
import sys as _cr_sys
if "matplotlib.pyplot" in _cr_sys.modules:
    _cr_plt = _cr_sys.modules["matplotlib.pyplot"]
    for _cr_i, _cr_num in enumerate(_cr_plt.get_fignums()):
        _cr_plt.figure(_cr_num).savefig(_cr_os.path.join("/tmp/output", f"figure_{_cr_i + 1}.png"))
"#;

#[derive(Debug, Clone)]
pub struct PythonSettings {
    /// Interpreter argv; the wrapped program is fed on stdin.
    pub interpreter: Vec<String>,
    pub timeout: Duration,
}

/// Executes Python submissions in instances leased from a pool.
#[derive(Clone)]
pub struct PythonRunner {
    pool: ContainerPool,
    settings: PythonSettings,
}

impl PythonRunner {
    pub fn new(pool: ContainerPool, settings: PythonSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &ContainerPool {
        &self.pool
    }

    /// Run `code` and collect its stdout and saved images.
    ///
    /// Failures of the submission itself (exceptions, timeouts) come back as
    /// data. Only an instance that cannot be acquired is an error.
    pub async fn run(&self, code: &str) -> RunnerResult<ExecutionResult> {
        let scratch = tempfile::Builder::new().prefix("py-run-").tempdir()?;
        let lease = self.pool.lease().await?;
        debug!(id = lease.id(), "running python submission");

        let result = self.execute(lease.id(), code, scratch.path()).await;
        lease.release().await;
        result
    }

    async fn execute(&self, id: &str, code: &str, scratch: &Path) -> RunnerResult<ExecutionResult> {
        let script = wrap(code);
        let argv: Vec<&str> = self.settings.interpreter.iter().map(String::as_str).collect();
        let env = [("MPLBACKEND", "Agg")];
        let request = ExecRequest::new(&argv)
            .workdir(WORKDIR)
            .env(&env)
            .stdin(script.as_bytes());

        let runtime = self.pool.runtime();
        let exec = match tokio::time::timeout(self.settings.timeout, runtime.exec(id, &request)).await
        {
            Ok(Ok(exec)) => exec,
            Ok(Err(e)) => {
                warn!(id = %id, error = %e, "python execution could not reach the sandbox");
                return Ok(ExecutionResult::failed(
                    e.to_string(),
                    ErrorKind::SandboxUnavailable,
                ));
            }
            Err(_) => {
                info!(
                    id,
                    timeout_ms = self.settings.timeout.as_millis() as u64,
                    "python execution timed out"
                );
                return Ok(ExecutionResult::failed(TIMEOUT_MESSAGE, ErrorKind::Timeout));
            }
        };

        if !exec.success() {
            return Ok(ExecutionResult::output(failure_output(&exec)));
        }

        let images = match runtime.copy_out(id, OUTPUT_DIR, scratch).await {
            Ok(()) => read_images(&scratch.join(OUTPUT_DIR_NAME)).await?,
            Err(SandboxError::NotFound(_)) => Vec::new(),
            Err(e) => {
                warn!(id = %id, error = %e, "failed to copy figures out of the sandbox");
                Vec::new()
            }
        };

        Ok(ExecutionResult {
            output: exec.stdout.trim().to_string(),
            images,
            error_kind: None,
        })
    }
}

fn wrap(code: &str) -> String {
    format!("{PROLOGUE}\n{code}\n{EPILOGUE}")
}

/// Diagnostic text for a submission that exited non-zero.
fn failure_output(exec: &ExecResult) -> String {
    let stderr = exec.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = exec.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("Process exited with status {}", exec.exit_code)
}

fn image_mime(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        _ => None,
    }
}

/// Sort key so `figure_2.png` comes before `figure_10.png`.
fn ordinal_key(name: &str) -> (&str, Option<u64>, &str) {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let prefix = stem.trim_end_matches(|c: char| c.is_ascii_digit());
    let number = stem.strip_prefix(prefix).and_then(|d| d.parse().ok());
    (prefix, number, name)
}

/// Read accepted image files in `dir` as data URIs. A missing directory
/// yields no images.
async fn read_images(dir: &Path) -> std::io::Result<Vec<Image>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(mime) = image_mime(&name) else {
            continue;
        };
        if entry.file_type().await?.is_file() {
            found.push((name, mime));
        }
    }
    found.sort_by(|(a, _), (b, _)| ordinal_key(a).cmp(&ordinal_key(b)));

    let mut images = Vec::with_capacity(found.len());
    for (filename, mime) in found {
        let bytes = tokio::fs::read(dir.join(&filename)).await?;
        images.push(Image {
            data: format!("data:{mime};base64,{}", STANDARD.encode(bytes)),
            filename,
        });
    }
    Ok(images)
}
