use std::sync::Arc;

use clap::Args;
use sandbox_docker::DockerRuntime;
use tracing::{info, warn};

use crate::config::{self, Overrides};
use crate::error::{RunnerError, RunnerResult};
use crate::server::{self, AppState};
use crate::service::Service;

#[derive(Args)]
pub struct ServeArgs {
    #[command(flatten)]
    overrides: Overrides,
}

/// Serve the gateway until SIGINT or SIGTERM, then tear down both pools.
pub async fn run_serve(args: ServeArgs) -> RunnerResult<()> {
    let config = config::resolve(&args.overrides).await?;
    let runtime = DockerRuntime::new(config.docker_config()).await?;
    let service = Service::from_config(&config, Arc::new(runtime));

    if config.api_key.is_none() {
        warn!("no API key configured, execution endpoints accept every request");
    }

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .map_err(|e| RunnerError::Config(format!("bind {}: {e}", config.listen)))?;
    info!(listen = %config.listen, "gateway listening");

    // Pools warm up behind the listener so a cold image pull does not
    // delay health checks.
    let warmup = tokio::spawn({
        let service = service.clone();
        async move { service.initialize().await }
    });

    let app = server::router(AppState::new(service.clone(), config.api_key.clone()));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    warmup.abort();
    info!("shutting down, removing pooled containers");
    service.cleanup().await;

    served.map_err(RunnerError::Io)
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();
    if sigterm.is_none() || sigint.is_none() {
        warn!("failed to register a shutdown signal handler");
    }

    tokio::select! {
        _ = recv_signal(&mut sigterm) => info!("received SIGTERM"),
        _ = recv_signal(&mut sigint) => info!("received SIGINT"),
    }
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
