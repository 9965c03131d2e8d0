use std::net::SocketAddr;

use anyhow::Result;
use chrono::SecondsFormat;
use futures::future::join_all;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::ClientConfig,
    frame::FrameError,
    message::{ClientToServer, ServerToClient, Snapshot, read_message, write_message},
    shutdown::interrupted,
};

/// Snapshots decoded ahead of rendering before the reader waits.
const UPDATE_BUFFER: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(#[source] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// One connected client mirroring the server's registry.
///
/// A background task decodes snapshots; any error there cancels the
/// session's token, which is the only way a dead server is noticed.
pub struct ClientSession {
    name: String,
    server: SocketAddr,
    writer: OwnedWriteHalf,
    updates: mpsc::Receiver<Snapshot>,
    token: CancellationToken,
    reader: JoinHandle<()>,
}

impl ClientSession {
    /// Dials `addr` and registers as `name`.
    ///
    /// `token` is cancelled when the reader fails; pass a child token to
    /// keep that failure local to this session.
    pub async fn connect<A>(
        addr: A,
        name: &str,
        token: CancellationToken,
    ) -> Result<Self, ClientError>
    where
        A: ToSocketAddrs,
    {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        let server = stream.peer_addr().map_err(ClientError::Connect)?;
        let (reader, mut writer) = stream.into_split();
        debug!(%server, name, "connected");

        write_message(
            &mut writer,
            &ClientToServer::Register {
                name: name.to_string(),
            },
        )
        .await?;

        let (tx, updates) = mpsc::channel(UPDATE_BUFFER);
        let reader = tokio::spawn(read_snapshots(
            BufReader::new(reader),
            tx,
            token.clone(),
            name.to_string(),
        ));

        Ok(Self {
            name: name.to_string(),
            server,
            writer,
            updates,
            token,
            reader,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Next snapshot, or `None` once the session has been cancelled.
    pub async fn next_snapshot(&mut self) -> Option<Snapshot> {
        select! {
            biased;
            _ = self.token.cancelled() => None,
            update = self.updates.recv() => update,
        }
    }

    pub async fn close(mut self) {
        self.token.cancel();
        if let Err(error) = self.writer.shutdown().await {
            debug!(name = %self.name, ?error, "failed to shut down writer cleanly");
        }
        self.reader.abort();
        let _ = self.reader.await;
    }
}

async fn read_snapshots(
    mut reader: BufReader<OwnedReadHalf>,
    updates: mpsc::Sender<Snapshot>,
    token: CancellationToken,
    name: String,
) {
    loop {
        let message = select! {
            biased;
            _ = token.cancelled() => return,
            message = read_message::<_, ServerToClient>(&mut reader) => message,
        };

        match message {
            Ok(ServerToClient::Snapshot(snapshot)) => {
                if updates.send(snapshot).await.is_err() {
                    break;
                }
            }
            Err(error) if error.is_eof() => {
                info!(%name, "server closed the connection");
                break;
            }
            Err(error) => {
                warn!(%name, %error, "failed to read from server");
                break;
            }
        }
    }
    token.cancel();
}

/// Launches every configured client and waits until all have stopped.
pub async fn run(config: ClientConfig) -> Result<()> {
    let root = CancellationToken::new();
    let signal_token = root.clone();
    let signals = tokio::spawn(async move {
        select! {
            _ = interrupted() => signal_token.cancel(),
            _ = signal_token.cancelled() => {}
        }
    });

    let sessions = config
        .names()
        .map(|name| run_client(config.server.clone(), name, root.child_token()));
    let results = join_all(sessions).await;

    root.cancel();
    let _ = signals.await;

    let failed = results.iter().filter(|result| result.is_err()).count();
    for error in results.into_iter().filter_map(Result::err) {
        warn!(%error, "client failed");
    }
    if failed == config.clients as usize {
        anyhow::bail!("no client could connect to {}", config.server);
    }
    Ok(())
}

async fn run_client(
    server: String,
    name: String,
    token: CancellationToken,
) -> Result<(), ClientError> {
    let mut session = ClientSession::connect(server.as_str(), &name, token).await?;
    info!(%name, server = %session.server(), "client listening");

    while let Some(snapshot) = session.next_snapshot().await {
        if let Some(rendered) = render_snapshot(session.name(), &snapshot) {
            write_stdout(&rendered).await;
        }
    }

    info!(%name, "client shutting down");
    session.close().await;
    Ok(())
}

/// Formats a snapshot for the terminal. Empty snapshots render as nothing.
pub fn render_snapshot(me: &str, snapshot: &Snapshot) -> Option<String> {
    if snapshot.clients.is_empty() {
        return None;
    }

    let mut out = format!(
        "{me} received snapshot at {} ({} clients)",
        snapshot.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        snapshot.clients.len()
    );
    for client in &snapshot.clients {
        out.push_str(&format!(
            "\n  {} @ {}, connected {}",
            client.name,
            client.address,
            client.connected_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }
    Some(out)
}

async fn write_stdout(block: &str) {
    let mut stdout = tokio::io::stdout();
    let mut bytes = block.as_bytes().to_vec();
    bytes.push(b'\n');
    if let Err(error) = stdout.write_all(&bytes).await {
        warn!(?error, "failed to write to stdout");
        return;
    }
    let _ = stdout.flush().await;
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::message::ClientDescriptor;

    #[test]
    fn render_lists_every_client() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("timestamp");
        let snapshot = Snapshot {
            generated_at: at,
            clients: vec![
                ClientDescriptor {
                    name: "A".into(),
                    address: "127.0.0.1:5000".parse().expect("addr"),
                    connected_at: at,
                },
                ClientDescriptor {
                    name: "C".into(),
                    address: "127.0.0.1:5001".parse().expect("addr"),
                    connected_at: at,
                },
            ],
        };

        let rendered = render_snapshot("me", &snapshot).expect("rendered");
        assert_eq!(
            rendered,
            "me received snapshot at 2024-05-01T12:00:00Z (2 clients)\n  \
             A @ 127.0.0.1:5000, connected 2024-05-01T12:00:00Z\n  \
             C @ 127.0.0.1:5001, connected 2024-05-01T12:00:00Z"
        );
    }

    #[test]
    fn empty_snapshot_renders_nothing() {
        let snapshot = Snapshot {
            generated_at: Utc::now(),
            clients: Vec::new(),
        };
        assert!(render_snapshot("me", &snapshot).is_none());
    }
}
