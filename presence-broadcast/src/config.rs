//! Runtime settings derived from the command line.

use std::time::Duration;

use crate::cli::{ClientArgs, ServerArgs};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address handed to `TcpListener::bind`, e.g. `localhost:8080`.
    pub bind: String,
    /// Period between snapshot broadcasts.
    pub interval: Duration,
    /// Deadline for a single liveness read.
    pub probe_timeout: Duration,
    /// How long a new connection may take to send its registration.
    pub registration_timeout: Duration,
    /// How long to wait for tasks to acknowledge shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "localhost:8080".to_string(),
            interval: Duration::from_secs(23),
            probe_timeout: Duration::from_millis(500),
            registration_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            bind: format!("{}:{}", args.host, args.port),
            interval: Duration::from_secs(args.interval),
            probe_timeout: Duration::from_millis(args.probe_timeout_ms),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub clients: u32,
    pub name_prefix: String,
}

impl ClientConfig {
    pub fn names(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.clients).map(|index| format!("{}_{index}", self.name_prefix))
    }
}

impl From<ClientArgs> for ClientConfig {
    fn from(args: ClientArgs) -> Self {
        Self {
            server: format!("{}:{}", args.host, args.port),
            clients: args.clients,
            name_prefix: args.name_prefix,
        }
    }
}
