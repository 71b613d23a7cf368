use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

mod chunker;
mod cli;
mod config;
mod docstore;
mod embedding;
mod error;
mod github;
mod identity;
mod importer;
mod lang;
mod llm;
mod models;
mod pipeline;
mod rag;
mod routes;
mod search;
mod server;
mod state;
#[cfg(test)]
mod testutil;
mod vectorstore;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    init_tracing();

    let config = match config::AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(cli::EXIT_CONFIG);
        }
    };

    let runtime = tokio::runtime::Runtime::new()?;
    match args.command {
        None | Some(cli::Command::Serve) => runtime.block_on(serve(config)),
        Some(command) => {
            if let Err(e) = runtime.block_on(cli::run_admin(&command, &config)) {
                eprintln!("{e}");
                std::process::exit(cli::exit_code_for(&e));
            }
            Ok(())
        }
    }
}

fn init_tracing() {
    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("repodex").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".repodex-logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    // Daily rotated file output next to compact stdout.
    let file_appender = tracing_appender::rolling::daily(&log_dir, "repodex-backend.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
    // Keep the writer alive for the process lifetime.
    Box::leak(Box::new(guard));

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "repodex_backend=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Log panics before aborting.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "repodex_backend::panic", location = %location, payload = %payload,
            "PANIC: thread panicked");
        default_panic(info);
    }));
}

async fn serve(config: config::AppConfig) -> Result<()> {
    routes::health::init_start_time();

    let addr: SocketAddr = config.listen_addr().parse()?;
    info!(
        listen_addr = %config.listen_addr(),
        vector_dimension = config.vector_dimension,
        chunk_size = config.chunk_size,
        chunk_overlap = config.chunk_overlap,
        embedding_workers = config.embedding_workers,
        embedding_batch_size = config.embedding_batch_size,
        "repodex backend starting"
    );

    let app_state = match state::AppState::new(config).await {
        Ok(state) => state,
        Err(e @ error::AppError::ConfigInvalid(_)) => {
            eprintln!("{e}");
            std::process::exit(cli::EXIT_CONFIG);
        }
        Err(e) => return Err(e.into()),
    };

    // Background pipeline owns its workers; reclaims any leases a previous
    // process left behind.
    app_state.pipeline.start();

    let pipeline = app_state.pipeline.clone();
    let app = server::create_app(app_state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("repodex backend listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain in-flight embedding batches before exiting.
    pipeline.stop().await;
    info!("repodex backend shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("Received terminate signal, initiating shutdown"); },
    }
}
