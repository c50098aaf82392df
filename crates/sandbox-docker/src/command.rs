use std::fmt;
use std::io::ErrorKind;
use std::process::{Output, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::trace;

/// A container CLI invocation that could not be run or exited non-zero.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// How a command should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Prefix with `sudo` (docker socket owned by root).
    Sudo,
    /// Run as the current user (member of the `docker` group).
    User,
}

/// One argv-only invocation of the container CLI.
struct Invocation<'a> {
    program: &'a str,
    args: &'a [&'a str],
    privilege: Privilege,
}

impl<'a> Invocation<'a> {
    fn new(program: &'a str, args: &'a [&'a str], privilege: Privilege) -> Self {
        Self {
            program,
            args,
            privilege,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = if self.privilege == Privilege::Sudo {
            let mut sudo = Command::new("sudo");
            sudo.arg("-n").arg(self.program);
            sudo
        } else {
            Command::new(self.program)
        };
        cmd.args(self.args).kill_on_drop(true);
        cmd
    }

    fn error(&self, detail: impl Into<String>) -> CommandError {
        CommandError {
            command: self.to_string(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Invocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.privilege == Privilege::Sudo {
            f.write_str("sudo ")?;
        }
        f.write_str(self.program)?;
        for arg in self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Run `program` and return its trimmed stdout, or its stderr as the error
/// detail when it exits non-zero.
pub async fn exec(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<String, CommandError> {
    let invocation = Invocation::new(program, args, privilege);
    trace!(command = %invocation, "docker");

    let output = invocation
        .command()
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| invocation.error(e.to_string()))?;

    let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).trim().to_string();
    if output.status.success() {
        Ok(text(&output.stdout))
    } else {
        Err(invocation.error(text(&output.stderr)))
    }
}

/// Run `program` with optional `stdin` and hand back the raw output,
/// whatever the exit status.
///
/// Only a failure to spawn or wait is an error. The child is killed if the
/// returned future is dropped before it completes.
pub async fn exec_raw(
    program: &str,
    args: &[&str],
    privilege: Privilege,
    stdin: Option<&[u8]>,
) -> Result<Output, CommandError> {
    let invocation = Invocation::new(program, args, privilege);
    trace!(
        command = %invocation,
        stdin_bytes = stdin.map_or(0, <[u8]>::len),
        "docker (raw)"
    );

    let stdin_mode = if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    };
    let mut child = invocation
        .command()
        .stdin(stdin_mode)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| invocation.error(e.to_string()))?;

    let pipe = child.stdin.take();
    let feed = async move {
        if let (Some(mut pipe), Some(bytes)) = (pipe, stdin) {
            pipe.write_all(bytes).await?;
            pipe.shutdown().await?;
        }
        Ok::<(), std::io::Error>(())
    };

    // A child that exits without reading its stdin closes the pipe early.
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    if let Err(e) = fed
        && e.kind() != ErrorKind::BrokenPipe
    {
        return Err(invocation.error(format!("write stdin: {e}")));
    }
    output.map_err(|e| invocation.error(e.to_string()))
}
