//! Real-time presence broadcast over TCP.
//!
//! See `README.md` for usage and the wire format. Each module focuses on a
//! concrete responsibility:
//!
//! - [`frame`] reads and writes 4-byte big-endian length-prefixed frames.
//! - [`message`] layers the JSON registration and snapshot messages on top.
//! - [`registry`] keeps the connected clients and the cached snapshot under
//!   one lock, plus the single-slot mailboxes used to wake connections.
//! - [`scheduler`] refreshes the snapshot on a fixed period once the first
//!   client registers, and pulses every connection.
//! - [`connection`] runs one task per socket: register, deliver, probe, clean up.
//! - [`server`] accepts sockets and coordinates shutdown through [`shutdown`].
//! - [`client`] dials the server and prints the snapshots it receives.
//! - [`cli`] and [`config`] turn command-line flags into runtime settings.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod frame;
pub mod message;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod shutdown;
