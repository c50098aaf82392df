mod cmd;
mod config;
mod cpp;
mod error;
mod python;
mod server;
mod service;
#[cfg(test)]
mod testutil;
mod types;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        write!(
            w,
            "[{:02}:{:02}:{:03}]",
            total_secs / 60,
            total_secs % 60,
            d.subsec_millis()
        )
    }
}

#[derive(Parser)]
#[command(name = "code-runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the execution gateway backed by warm container pools
    Serve(Box<cmd::ServeArgs>),
    /// Run one source file in a fresh container and print the JSON result
    Exec(Box<cmd::ExecArgs>),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve(args) => cmd::run_serve(*args).await.map(|()| ExitCode::SUCCESS),
        Command::Exec(args) => cmd::run_exec(*args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
