//! `Node` — a started `DataServer` behind a running `Reactor`.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use flatdb_net::{NetError, Reactor, ReactorConfig};
use flatdb_server::{BackendRegistry, DataServer, LifecycleError, ServerConfig, ServerError};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Net(#[from] NetError),
}

/// Reactor settings derived from the server configuration.
pub fn reactor_config(config: &ServerConfig) -> ReactorConfig {
    ReactorConfig {
        port: config.port,
        backlog: config.backlog,
        buffer_size: config.buffer_size,
        max_idle_buffers: config.max_idle_buffers,
        max_frame_len: config.max_frame_len,
        poll_timeout_ms: config.poll_timeout_ms,
        verbose_errors: config.verbose_errors,
        max_outbound_bytes: config.max_outbound_bytes,
        max_in_flight: config.max_in_flight,
        ..ReactorConfig::default()
    }
}

pub struct Node {
    server: Arc<DataServer>,
    reactor: Reactor,
    startup: Option<LifecycleError>,
}

impl Node {
    /// Open all partitions, then start serving.
    ///
    /// Partitions that fail to open do not prevent startup; they are
    /// logged, reject their requests, and are reported by
    /// [`Node::startup_failures`].
    pub fn start(config: &ServerConfig, registry: &BackendRegistry) -> Result<Self, NodeError> {
        let server = DataServer::new(config, registry)?;
        Self::serve(server, reactor_config(config))
    }

    /// Start an already built server with explicit reactor settings.
    pub fn serve(server: DataServer, reactor: ReactorConfig) -> Result<Self, NodeError> {
        let startup = match server.start() {
            Ok(()) => None,
            Err(e) => {
                warn!(failed = ?e.failed_partitions(), error = %e, "some partitions did not start");
                Some(e)
            }
        };
        let server = Arc::new(server);
        let reactor = Reactor::start(reactor, server.clone())?;
        info!(db = server.name(), addr = %reactor.local_addr(), "node serving");
        Ok(Self {
            server,
            reactor,
            startup,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.reactor.local_addr()
    }

    pub fn server(&self) -> &DataServer {
        &self.server
    }

    pub fn startup_failures(&self) -> Option<&LifecycleError> {
        self.startup.as_ref()
    }

    /// Stop serving, then close every started partition.
    pub fn shutdown(&mut self) -> Result<(), LifecycleError> {
        self.reactor.shutdown();
        let result = self.server.stop();
        info!(db = self.server.name(), "node stopped");
        result
    }

    /// Stop serving but leave backends open.
    pub fn halt(&mut self) {
        self.reactor.shutdown();
        info!(db = self.server.name(), "node halted; backends left open");
    }
}
