use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;

use tally::{
    api::{build_router, AppState},
    backends::{Backends, StartupError},
    config::{CliArgs, Config},
    start_workers, telemetry,
};

fn main() -> ExitCode {
    let cli = CliArgs::parse();
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tally: {}", e);
            return ExitCode::FAILURE;
        }
    };
    telemetry::init_tracing(&config.logging);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), StartupError> {
    let metrics = telemetry::init_metrics().map_err(|e| StartupError::Metrics(e.to_string()))?;

    // The blocking database clients must be created outside the runtime.
    let backends = Backends::open(&config)?;
    let shutdown = Arc::new(AtomicBool::new(false));

    let workers = if config.role.runs_workers() {
        start_workers(&backends, &config.worker, shutdown.clone())?
    } else {
        Vec::new()
    };

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let served = runtime.block_on(async {
        if config.role.serves_http() {
            let addr = config.listen_addr()?;
            let app = build_router(AppState::new(&backends, Some(metrics)));
            tracing::info!(%addr, role = ?config.role, "API listening");
            axum::Server::try_bind(&addr)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, e))?
                .serve(app.into_make_service())
                .with_graceful_shutdown(shutdown_signal())
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        } else {
            shutdown_signal().await;
        }
        Ok::<_, StartupError>(())
    });

    tracing::info!("Shutting down, waiting for in-flight tasks");
    shutdown.store(true, Ordering::SeqCst);
    for worker in workers {
        if worker.join().is_err() {
            tracing::error!("Consumer thread panicked");
        }
    }
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
