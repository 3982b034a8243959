// Camkeeper - network camera recording supervisor
// Main library entry point

pub mod backend;
pub mod commands;
pub mod config;
pub mod recording;
pub mod session;
pub mod video;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::backend::{DisabledBackend, HttpBackend, RecordingBackend};
use crate::recording::registry::RegistryOptions;
use crate::recording::{FfmpegLauncher, SupervisorRegistry, WallClock};
use crate::session::SessionStore;

/// Initialize and run the daemon until Ctrl-C
pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = config::resolve_config_path(config_path);
    let config = config::Config::load_or_default(&config_path);
    if let Err(e) = config.validate() {
        anyhow::bail!("Invalid config {}: {}", config_path.display(), e);
    }
    log::info!("[Camkeeper] Config from {}", config_path.display());
    log::info!("[Camkeeper] Recording to {}", config.storage_path.display());

    // Initialize session store
    let store = match SessionStore::open(&config.database_path) {
        Ok(store) => store,
        Err(e) => {
            log::error!(
                "Failed to open session store {}: {}",
                config.database_path.display(),
                e
            );
            log::warn!("Sessions will not survive a restart");
            SessionStore::open_in_memory()?
        }
    };

    let backend: Arc<dyn RecordingBackend> = match &config.backend_url {
        Some(url) => {
            log::info!("[Camkeeper] Reconciling with backend at {}", url);
            Arc::new(HttpBackend::new(url)?)
        }
        None => Arc::new(DisabledBackend),
    };

    let time = Arc::new(WallClock);
    let registry = SupervisorRegistry::new(RegistryOptions {
        launcher: Arc::new(FfmpegLauncher::new(config.ffmpeg_path.clone())),
        backend,
        store: Arc::new(store),
        time: time.clone(),
        config: config.supervisor.clone(),
        storage_path: config.storage_path.clone(),
    });

    match registry.rehydrate() {
        Ok(0) => {}
        Ok(n) => log::info!("[Camkeeper] Resumed {} recording(s) from last run", n),
        Err(e) => log::error!("Failed to restore sessions: {}", e),
    }

    let shutdown = CancellationToken::new();

    let watchdog = recording::watchdog::spawn(
        registry.clone(),
        time,
        config.watchdog.clone(),
        shutdown.clone(),
    );

    // Surface terminal failures in the log
    let mut events = registry.subscribe();
    let event_shutdown = shutdown.clone();
    let event_logger = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = event_shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => log_event(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[Camkeeper] Missed {} registry events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(commands::AppState {
        registry: registry.clone(),
        config: RwLock::new(config),
        config_path,
        http: reqwest::Client::new(),
    });

    cancel_on_signal(tokio::signal::ctrl_c(), shutdown.clone());

    let served = commands::serve(state, &bind_addr, shutdown.clone()).await;
    shutdown.cancel();

    registry.shutdown().await;
    let _ = watchdog.await;
    let _ = event_logger.await;

    served
}

/// Cancel `shutdown` when `signal` fires. If the handler cannot be
/// installed the daemon keeps running and only the error is logged.
fn cancel_on_signal<F>(signal: F, shutdown: CancellationToken) -> tokio::task::JoinHandle<()>
where
    F: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                log::info!("[Camkeeper] Shutting down");
                shutdown.cancel();
            }
            Err(e) => log::error!("[Camkeeper] Cannot listen for Ctrl-C: {}", e),
        }
    })
}

fn log_event(event: &recording::RegistryEvent) {
    use recording::RegistryEvent;
    match event {
        RegistryEvent::StateChanged { camera_id, state } => {
            log::debug!("[Camkeeper] {} is {}", camera_id, state);
        }
        RegistryEvent::LaunchFailed { camera_id, reason } => {
            log::error!("[Camkeeper] {} could not start: {}", camera_id, reason);
        }
        RegistryEvent::ReconnectExhausted { camera_id, attempts } => {
            log::error!(
                "[Camkeeper] {} stopped after {} reconnect attempts; restart it manually",
                camera_id,
                attempts
            );
        }
        RegistryEvent::StopFailed { camera_id, reason } => {
            log::error!("[Camkeeper] {} did not stop: {}", camera_id, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_cancels_shutdown() {
        let shutdown = CancellationToken::new();
        cancel_on_signal(async { Ok(()) }, shutdown.clone()).await.unwrap();
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_unavailable_signal_keeps_running() {
        let shutdown = CancellationToken::new();
        let signal = async {
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "no signal driver",
            ))
        };
        cancel_on_signal(signal, shutdown.clone()).await.unwrap();
        assert!(!shutdown.is_cancelled());
    }
}
