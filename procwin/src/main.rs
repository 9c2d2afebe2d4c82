use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::net::SocketAddr;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use procwin_gate::{AccessGate, GateConfig};

mod cmdline;
mod processor;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    let env_vars: HashMap<String, String> = env::vars().collect();

    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();
    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let result = match matches.subcommand() {
        Some(("processor", args)) => {
            let mut settings = processor::ProcessorSettings::try_from(env_vars)?;
            settings.serve_metrics = !args.get_flag("no-metrics");
            info!(?settings, "Starting processor");
            processor::run(settings, cln_token).await
        }
        Some(("gate", _)) => {
            let config = GateConfig::try_from(env_vars)?;
            info!(?config, "Starting access gate");
            run_gate(config, cln_token).await
        }
        other => Err(format!("unknown subcommand {other:?}").into()),
    };

    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    result
}

async fn run_gate(config: GateConfig, cln_token: CancellationToken) -> Result<(), Box<dyn Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    // nothing is served behind the gate besides health and metrics
    let inner = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .merge(procwin_core::metrics::metrics_router());

    tokio::select! {
        result = AccessGate::new(&config).start_server(addr, inner) => result?,
        _ = cln_token.cancelled() => info!("Access gate stopped"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
