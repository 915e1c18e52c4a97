//! Server lifecycle management
//!
//! Wires the core components together, serves HTTP, and tears everything down
//! on shutdown:
//! - session reclaimer
//! - metadata broadcaster
//! - open WebRTC sessions

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use devicecast_core::{
    logging, BroadcastPublisher, Config, FrameSource, MetadataBroadcaster, SessionManager,
    TransportEngine,
};

use crate::http::{create_router, AppState};

/// Load and validate the configuration, then install logging.
///
/// Meant to run first in the embedding application's `main`.
pub fn bootstrap(config_file: Option<&str>) -> anyhow::Result<Config> {
    let config = Config::load(config_file)?;
    validate(&config)?;

    logging::init_logging(&config.logging)?;
    info!("DeviceCast starting, HTTP address {}", config.http_address());
    Ok(config)
}

fn validate(config: &Config) -> anyhow::Result<()> {
    config.validate().map_err(|errors| {
        anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        )
    })
}

pub struct Server {
    config: Config,
    state: AppState,
}

impl Server {
    /// Build every component from `config`. The frame source and transport
    /// engine are supplied by the embedding application.
    ///
    /// Fails when `config` does not pass [`Config::validate`].
    pub fn new(
        config: Config,
        source: Arc<dyn FrameSource>,
        engine: Arc<dyn TransportEngine>,
    ) -> anyhow::Result<Self> {
        validate(&config)?;

        let events = BroadcastPublisher::new(config.broadcast.channel_capacity);
        let session_manager = Arc::new(SessionManager::new(
            Arc::clone(&source),
            engine,
            &config.webrtc,
            config.track.clone(),
        ));
        let broadcaster = Arc::new(MetadataBroadcaster::new(
            source,
            Arc::new(events.clone()),
            config.broadcast.clone(),
        ));

        Ok(Self {
            state: AppState::new(session_manager, broadcaster, events),
            config,
        })
    }

    #[must_use]
    pub const fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until `shutdown` resolves, then release every session
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let http_address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address).await?;
        info!("HTTP server listening on {}", listener.local_addr()?);

        let reclaimer_cancel = CancellationToken::new();
        let reclaimer = self
            .state
            .session_manager
            .spawn_reclaimer(reclaimer_cancel.clone());

        let router = create_router(self.state.clone());
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("HTTP server error: {}", e);
        }

        info!("Shutting down DeviceCast server...");

        reclaimer_cancel.cancel();
        if let Some(handle) = reclaimer {
            let _ = handle.await;
        }
        self.state.broadcaster.stop().await;
        let closed = self.state.session_manager.close_all().await;

        info!(closed_sessions = closed, "Shutdown complete");
        Ok(())
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
