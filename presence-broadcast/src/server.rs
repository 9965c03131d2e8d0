use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    connection::handle_connection,
    registry::Registry,
    scheduler::{Scheduler, SchedulerState},
    shutdown::{Shutdown, interrupted},
};

/// State shared by the accept loop, every connection task, and the scheduler.
#[derive(Debug)]
pub struct ServerState {
    pub registry: Arc<Registry>,
    pub scheduler: Scheduler,
    pub shutdown: Shutdown,
    pub config: ServerConfig,
}

impl ServerState {
    fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let shutdown = Shutdown::new();
        let scheduler = Scheduler::new(Arc::clone(&registry), config.interval, shutdown.clone());
        Self {
            registry,
            scheduler,
            shutdown,
            config,
        }
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState::new(config)),
        }
    }

    /// Binds `config.bind`. Failure here is fatal for the process.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("failed to bind {}", config.bind))?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    /// Handle for cancelling the server from outside `run_until`.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.state.shutdown.clone()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.state.scheduler.state()
    }

    /// Accepts clients until `signal` resolves or the shutdown handle is
    /// cancelled, then waits for every task to drain.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(signal);

        loop {
            select! {
                biased;
                _ = &mut signal => {
                    info!("server shutting down");
                    break;
                }
                _ = state.shutdown.cancelled() => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        drop(listener);
        state.shutdown.cancel();
        if state.shutdown.wait_timeout(state.config.shutdown_timeout).await {
            info!("all connections drained");
        }
        Ok(())
    }

    pub async fn run_until_interrupted(self) -> Result<()> {
        self.run_until(interrupted()).await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    debug!(%peer, "accepted connection");
    let task_state = Arc::clone(state);
    state.shutdown.spawn(async move {
        if let Err(err) = handle_connection(stream, peer, task_state).await {
            warn!(peer = %peer, error = %err, "connection closed before registration");
        }
    });
}
