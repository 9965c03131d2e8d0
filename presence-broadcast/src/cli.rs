use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept clients and periodically broadcast the list of who is connected.
    Server(ServerArgs),
    /// Launch one or more clients that print every snapshot they receive.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Host or address to bind.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Port to bind. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Broadcast period in seconds.
    #[arg(long, default_value_t = 23, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: u64,

    /// Deadline for each liveness probe read, in milliseconds.
    #[arg(long, default_value_t = 500, value_parser = clap::value_parser!(u64).range(1..))]
    pub probe_timeout_ms: u64,

    /// Seconds to wait for connections to drain after an interrupt.
    #[arg(long, default_value_t = 5)]
    pub shutdown_timeout: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Server host to dial.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Server port to dial.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Number of concurrent clients to launch.
    #[arg(long, default_value_t = 13, value_parser = clap::value_parser!(u32).range(1..))]
    pub clients: u32,

    /// Display names are `<prefix>_<index>`.
    #[arg(long, default_value = "client")]
    pub name_prefix: String,
}
