//! Per-connection task: registration, snapshot delivery, liveness probing.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    frame::{FrameError, write_frame},
    message::{ClientToServer, read_message},
    registry::{Lease, Mailbox, Registry, RegistryError, mailbox},
    server::ServerState,
};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to read registration: {0}")]
    Registration(#[from] FrameError),
    #[error("no registration within {0:?}")]
    RegistrationTimeout(Duration),
    #[error("registration carried an empty name")]
    EmptyName,
    #[error("shutdown requested before registration")]
    Cancelled,
}

/// Why a registered connection stopped being served.
#[derive(Debug)]
enum Exit {
    Cancelled,
    PeerClosed,
    /// Our notify handle was dropped from the registry.
    Evicted,
    WriteFailed(FrameError),
    ReadFailed(std::io::Error),
}

/// Deregisters the client when dropped, on every exit path.
///
/// Only the entry this connection created is removed; a newer registration
/// under the same identity survives.
struct Registration<'a> {
    registry: &'a Registry,
    lease: Lease,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        match self.registry.release(&self.lease) {
            Ok(_) => {}
            Err(RegistryError::Superseded(id)) => {
                debug!(client = %id, "entry already replaced; leaving it registered");
            }
            Err(error) => warn!(%error, "client already gone during cleanup"),
        }
    }
}

pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), ConnectionError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let name = await_registration(&mut reader, &state).await?;

    let (notify, mut mailbox) = mailbox();
    let registration = Registration {
        registry: &state.registry,
        lease: state.registry.add(name.clone(), peer, notify),
    };
    info!(%peer, client = %registration.lease.id, %name, "client registered");
    state.scheduler.ensure_started();

    let exit = serve(&mut reader, &mut writer, &mut mailbox, &state).await;
    match &exit {
        Exit::Cancelled => debug!(%peer, "closing connection for shutdown"),
        Exit::PeerClosed => info!(%peer, %name, "client disconnected"),
        Exit::Evicted => warn!(%peer, %name, "client evicted from registry"),
        Exit::WriteFailed(error) => info!(%peer, %name, %error, "failed to deliver snapshot"),
        Exit::ReadFailed(error) => info!(%peer, %name, %error, "liveness probe failed"),
    }

    if let Err(error) = writer.shutdown().await {
        debug!(%peer, %error, "failed to shut down socket cleanly");
    }
    drop(registration);
    Ok(())
}

async fn await_registration<R>(
    reader: &mut R,
    state: &ServerState,
) -> Result<String, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let limit = state.config.registration_timeout;
    let message = select! {
        biased;
        _ = state.shutdown.cancelled() => return Err(ConnectionError::Cancelled),
        read = timeout(limit, read_message::<_, ClientToServer>(reader)) => {
            read.map_err(|_| ConnectionError::RegistrationTimeout(limit))??
        }
    };

    let ClientToServer::Register { name } = message;
    let name = name.trim();
    if name.is_empty() {
        return Err(ConnectionError::EmptyName);
    }
    Ok(name.to_string())
}

async fn serve<R, W>(
    reader: &mut R,
    writer: &mut W,
    mailbox: &mut Mailbox,
    state: &ServerState,
) -> Exit
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let probe_timeout = state.config.probe_timeout;
    let mut scratch = [0u8; 64];

    loop {
        select! {
            biased;
            _ = state.shutdown.cancelled() => return Exit::Cancelled,
            pulse = mailbox.recv() => {
                if pulse.is_none() {
                    return Exit::Evicted;
                }
                // A peer that stops reading stalls this write, so it has to
                // yield to shutdown like every other wait.
                let snapshot = state.registry.snapshot();
                select! {
                    biased;
                    _ = state.shutdown.cancelled() => return Exit::Cancelled,
                    written = write_frame(writer, &snapshot) => {
                        if let Err(error) = written {
                            return Exit::WriteFailed(error);
                        }
                    }
                }
            }
            probe = timeout(probe_timeout, reader.read(&mut scratch)) => match probe {
                Err(_) => {}
                Ok(Ok(0)) => return Exit::PeerClosed,
                Ok(Ok(read)) => debug!(bytes = read, "discarding unsolicited client data"),
                Ok(Err(error)) => return Exit::ReadFailed(error),
            },
        }
    }
}
