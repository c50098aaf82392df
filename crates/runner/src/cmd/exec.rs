use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use sandbox_docker::DockerRuntime;
use tracing::debug;

use crate::config::{self, Overrides};
use crate::error::{RunnerError, RunnerResult};
use crate::service::Service;
use crate::types::{ExecutionRequest, Language};

#[derive(Args)]
pub struct ExecArgs {
    /// Language of the submission
    #[arg(long, short, value_enum)]
    language: Language,
    /// Source file to run
    file: PathBuf,
    /// File fed to the program on stdin (C++ only)
    #[arg(long, short)]
    input: Option<PathBuf>,
    #[command(flatten)]
    overrides: Overrides,
}

/// Run one submission through a one-instance pool and print the result.
///
/// The pool is not pre-warmed, so containers owned by a running gateway
/// are left alone.
pub async fn run_exec(args: ExecArgs) -> RunnerResult<ExitCode> {
    let code = read(&args.file).await?;
    let input = match &args.input {
        Some(path) => Some(read(path).await?),
        None => None,
    };

    let mut config = config::resolve(&args.overrides).await?;
    config.python.size = 1;
    config.cpp.size = 1;

    let runtime = DockerRuntime::new(config.docker_config()).await?;
    let service = Service::from_config(&config, Arc::new(runtime));

    debug!(language = args.language.as_str(), file = %args.file.display(), "running submission");
    let request = ExecutionRequest {
        code: Some(code),
        input,
    };
    let outcome = service.execute(args.language, request).await;
    service.cleanup().await;
    let result = outcome?;

    let json = serde_json::to_string_pretty(&result)
        .map_err(|e| RunnerError::Fault(format!("encode result: {e}")))?;
    println!("{json}");

    Ok(if result.error_kind.is_none() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn read(path: &Path) -> RunnerResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Validation(format!("read {}: {e}", path.display())))
}
