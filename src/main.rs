// src/main.rs

//! # Hotswap Main Entry Point
//!
//! Loads configuration and logging, performs the initial build and load, binds
//! the listener once, and runs the event loop, the web server and (outside
//! production mode) the change detector until Ctrl-C.

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use hotswap::config::AppConfig;
use hotswap::dylib::DylibSource;
use hotswap::event_loop::{EventLoop, LoopCommand, LoopSettings};
use hotswap::reload::{ReloadCoordinator, ReloadFlag};
use hotswap::watcher::ChangeDetector;
use hotswap::web::{self, WebState};

/// Commands buffered between the transport and the event loop.
const COMMAND_BUFFER: usize = 256;

/// The main entry point for the Hotswap host.
///
/// 1. Loads the configuration and installs the tracing subscriber.
/// 2. Builds and loads the first module; failure exits non-zero.
/// 3. Starts the change detector (development mode); failure exits non-zero.
/// 4. Binds the listener once and spawns the web server and event loop.
/// 5. Waits for Ctrl-C, then shuts everything down in order.
#[tokio::main]
async fn main() -> Result<()> {
    let app_config = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing subscriber for logging with environment filter and max level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&app_config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(std::io::stderr) // Log to stderr
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    tracing::info!("Hotswap starting with configuration: {:?}", app_config);

    let build_command = (!app_config.prod).then(|| app_config.build_command.clone());
    let source = DylibSource::new(build_command, &app_config.artifact)?;
    let mut coordinator = ReloadCoordinator::new(Box::new(source));
    if let Err(e) = coordinator.initial_load(!app_config.prod) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }

    let reload = ReloadFlag::new();
    let detector = if app_config.prod {
        tracing::info!("PRODUCTION MODE: not watching for changes.");
        None
    } else {
        match ChangeDetector::spawn(&app_config.watch_dir, reload.clone()) {
            Ok(detector) => Some(detector),
            Err(e) => {
                tracing::error!("{}", e);
                std::process::exit(1);
            }
        }
    };

    // The listener is created once and outlives every reload.
    let listener = web::bind(&app_config.web_addr).await?;

    // Shutdown signal channel for graceful shutdown of all tasks.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (command_tx, command_rx) = mpsc::channel::<LoopCommand>(COMMAND_BUFFER);

    let mut tasks = Vec::new();

    let event_loop = EventLoop::new(coordinator, reload, LoopSettings::from_config(&app_config));
    let loop_shutdown_rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        event_loop.run(command_rx, loop_shutdown_rx).await;
    }));

    let web_state = WebState::from_config(command_tx, &app_config);
    let web_shutdown_rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = web::start_server(listener, web_state, web_shutdown_rx).await {
            tracing::error!("Web server exited with error: {}", e);
        }
    }));

    tracing::info!("Ready (ctrl-c to quit)");

    // Wait for Ctrl-C signal to initiate shutdown.
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Ctrl-C received, initiating shutdown...");
        }
        Err(err) => {
            tracing::error!("Failed to listen for Ctrl-C signal: {}", err);
        }
    }

    // Signal all tasks to shutdown.
    if shutdown_tx.send(true).is_err() {
        tracing::error!("Failed to send shutdown signal");
    }

    // Wait for all tasks to complete.
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("A task panicked or exited with error: {}", e);
        }
    }

    if let Some(detector) = detector {
        detector.shutdown();
    }

    tracing::info!("Hotswap shut down.");
    Ok(())
}
