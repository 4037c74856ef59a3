//! Broker Server
//!
//! Wires the registries, dispatcher, statistics, control plane, restart
//! watcher, and the TCP/TLS accept loop together. `start` binds everything
//! and returns a handle (tests bind port 0 and read the actual addresses);
//! `run` additionally installs signal handlers and blocks until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::app::{AppRegistry, MemoryAppRegistry};
use crate::config::BrokerConfig;
use crate::control::spawn_control_listener;
use crate::dispatch::Dispatcher;
use crate::error::{BrokerError, Result};
use crate::http::{create_router, HttpState};
use crate::metrics::BrokerMetrics;
use crate::registry::ChannelRegistry;
use crate::resolver::ControllerRegistry;
use crate::restart::{
    spawn_restart_watcher, wait_for_shutdown, MarkerStore, Shutdown, ShutdownMode,
    RESTART_CHECK_INTERVAL,
};
use crate::session::{handle_socket, SessionDeps};
use crate::stats::{spawn_statistics_flusher, SqliteStatisticsStore, StatisticsCollector};
use crate::tls;

/// How long a drain waits for connections to finish closing.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A started broker. Dropping the handle does not stop the broker; trigger
/// shutdown through [`BrokerHandle::shutdown`].
pub struct BrokerHandle {
    pub ws_addr: std::net::SocketAddr,
    pub http_addr: std::net::SocketAddr,
    pub registry: Arc<ChannelRegistry>,
    pub apps: Arc<dyn AppRegistry>,
    pub shutdown: Shutdown,
}

impl BrokerHandle {
    pub fn trigger_shutdown(&self, mode: ShutdownMode) {
        self.shutdown.trigger(mode);
    }
}

/// Binds all listeners and spawns the broker's tasks.
pub async fn start(config: BrokerConfig, controllers: ControllerRegistry) -> Result<BrokerHandle> {
    config.validate()?;

    let metrics = BrokerMetrics::new();
    let registry = Arc::new(ChannelRegistry::new());
    let apps: Arc<dyn AppRegistry> = Arc::new(MemoryAppRegistry::new(config.apps.clone()));
    let controllers = Arc::new(controllers);
    controllers.preload();
    let dispatcher = Arc::new(Dispatcher::new(
        controllers,
        registry.clone(),
        metrics.clone(),
    ));
    let stats = Arc::new(StatisticsCollector::new(config.statistics.enabled));
    let shutdown = Shutdown::new();

    if config.statistics.enabled {
        let store = Arc::new(SqliteStatisticsStore::open(
            &config.statistics.database_path,
        )?);
        spawn_statistics_flusher(
            stats.clone(),
            store,
            config.statistics_interval(),
            Duration::from_secs(config.statistics.retention_days * 24 * 3600),
            shutdown.clone(),
        );
        info!(
            interval = config.statistics.interval_seconds,
            "statistics collection enabled"
        );
    }

    let marker_store = Arc::new(MarkerStore::open(&config.restart_marker_path)?);
    spawn_restart_watcher(marker_store, shutdown.clone(), RESTART_CHECK_INTERVAL);

    if config.broadcast_socket_enabled {
        spawn_control_listener(
            config.broadcast_socket_path.clone(),
            registry.clone(),
            metrics.clone(),
            shutdown.clone(),
        );
    }

    let http_listener = TcpListener::bind(&config.http_addr).await.map_err(|e| {
        BrokerError::Config(format!("cannot bind http listener {}: {}", config.http_addr, e))
    })?;
    let http_addr = http_listener
        .local_addr()
        .map_err(|e| BrokerError::Config(e.to_string()))?;
    let router = create_router(HttpState {
        apps: apps.clone(),
        registry: registry.clone(),
        metrics: metrics.clone(),
    });
    let http_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let serve = axum::serve(http_listener, router).with_graceful_shutdown(async move {
            wait_for_shutdown(http_shutdown).await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "http server failed");
        }
    });
    info!(addr = %http_addr, "http listening");

    let tls_acceptor = tls::acceptor(&config.ssl)?;

    let ws_listener = TcpListener::bind(config.listen_addr()?).await.map_err(|e| {
        BrokerError::Config(format!(
            "cannot bind websocket listener {}:{}: {}",
            config.host, config.port, e
        ))
    })?;
    let ws_addr = ws_listener
        .local_addr()
        .map_err(|e| BrokerError::Config(e.to_string()))?;
    info!(addr = %ws_addr, tls = tls_acceptor.is_some(), "websocket listening");

    let deps = SessionDeps {
        apps: apps.clone(),
        registry: registry.clone(),
        dispatcher,
        stats,
        metrics,
        max_request_size: config.max_request_size(),
    };
    let accept_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut shutdown_rx = accept_shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = ws_listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let deps = deps.clone();
                    let tls_acceptor = tls_acceptor.clone();
                    tokio::spawn(async move {
                        match tls_acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    handle_socket(tls_stream, peer_addr, deps).await;
                                }
                                Err(e) => {
                                    warn!(peer = %peer_addr, error = %e, "tls handshake failed");
                                }
                            },
                            None => {
                                handle_socket(stream, peer_addr, deps).await;
                            }
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }
    });

    Ok(BrokerHandle {
        ws_addr,
        http_addr,
        registry,
        apps,
        shutdown,
    })
}

/// Starts the broker, installs signal handlers, and blocks until shutdown
/// completes (including the drain on a soft stop).
pub async fn run(config: BrokerConfig, controllers: ControllerRegistry) -> Result<()> {
    let default_mode = if config.soft_shutdown {
        ShutdownMode::Soft
    } else {
        ShutdownMode::Hard
    };
    let handle = start(config, controllers).await?;

    let signal_shutdown = handle.shutdown.clone();
    tokio::spawn(async move {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("shutdown signal received");
        signal_shutdown.trigger(default_mode);
    });

    let mode = wait_for_shutdown(handle.shutdown.subscribe()).await;
    if mode == ShutdownMode::Soft {
        drain(&handle.registry).await;
    }
    info!("broker stopped");
    Ok(())
}

/// Soft shutdown: stop admissions, close every local connection, and wait
/// for the writers to flush their close frames.
pub async fn drain(registry: &ChannelRegistry) {
    registry.decline_new_connections();
    let connections = registry.local_connections(None);
    info!(count = connections.len(), "draining connections");
    for connection in &connections {
        connection.close(1000, "server is restarting");
    }

    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if registry.local_connections(None).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
