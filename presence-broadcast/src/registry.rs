//! Live set of registered clients plus the cached snapshot pushed to them.
//!
//! One mutex covers the records and the cached bytes, so a reader sees
//! either the previous snapshot or the fully rebuilt one. The lock is never
//! held across an `.await`.

use std::{
    collections::{HashMap, hash_map::Entry as Slot},
    fmt,
    net::SocketAddr,
    sync::{Mutex, MutexGuard},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::message::{ClientDescriptor, ServerToClient, Snapshot};

/// Opaque connection identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    pub fn generate() -> Self {
        Self(nanoid::nanoid!())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub name: String,
    pub address: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

impl ClientRecord {
    fn descriptor(&self) -> ClientDescriptor {
        ClientDescriptor {
            name: self.name.clone(),
            address: self.address,
            connected_at: self.connected_at,
        }
    }
}

/// Creates the single-slot "data ready" channel for one connection.
pub fn mailbox() -> (NotifyHandle, Mailbox) {
    let (tx, rx) = mpsc::channel(1);
    (NotifyHandle(tx), Mailbox(rx))
}

/// Sending side of a connection's mailbox, held by the registry.
#[derive(Debug, Clone)]
pub struct NotifyHandle(mpsc::Sender<()>);

/// Receiving side of a connection's mailbox, owned by the connection task.
#[derive(Debug)]
pub struct Mailbox(mpsc::Receiver<()>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    Delivered,
    /// The mailbox already held an unconsumed pulse.
    AlreadyPending,
    /// The connection task has gone away.
    Closed,
}

impl NotifyHandle {
    /// Never blocks: a full mailbox already means "data ready".
    pub fn pulse(&self) -> Pulse {
        match self.0.try_send(()) {
            Ok(()) => Pulse::Delivered,
            Err(TrySendError::Full(())) => Pulse::AlreadyPending,
            Err(TrySendError::Closed(())) => Pulse::Closed,
        }
    }
}

impl Mailbox {
    /// Resolves on the next pulse, or `None` once every handle is dropped.
    pub async fn recv(&mut self) -> Option<()> {
        self.0.recv().await
    }

    pub fn try_recv(&mut self) -> bool {
        self.0.try_recv().is_ok()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("client {0} is not registered")]
    UnknownClient(ClientId),
    #[error("client {0} was replaced by a newer registration")]
    Superseded(ClientId),
    #[error("failed to serialize snapshot: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Proof of one particular registration.
///
/// Releasing through a lease only removes the entry it created, never one
/// that later overwrote the same identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: ClientId,
    generation: u64,
}

#[derive(Debug)]
struct Entry {
    record: ClientRecord,
    notify: NotifyHandle,
    generation: u64,
}

#[derive(Debug, Default)]
struct Inner {
    clients: HashMap<ClientId, Entry>,
    next_generation: u64,
    snapshot: Bytes,
    generated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking connection task must not wedge every other client.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a client under a freshly generated identity.
    pub fn add(&self, name: String, address: SocketAddr, notify: NotifyHandle) -> Lease {
        let record = ClientRecord {
            name,
            address,
            connected_at: Utc::now(),
        };
        self.insert(ClientId::generate(), record, notify)
    }

    /// Stores `record` under `id`, replacing any existing entry.
    pub fn insert(&self, id: ClientId, record: ClientRecord, notify: NotifyHandle) -> Lease {
        let mut inner = self.lock();
        info!(client = %id, name = %record.name, address = %record.address, "adding client");

        let generation = inner.next_generation;
        inner.next_generation += 1;
        let entry = Entry {
            record,
            notify,
            generation,
        };
        if let Some(previous) = inner.clients.insert(id.clone(), entry) {
            warn!(
                client = %id,
                replaced = %previous.record.name,
                "client identity already registered; overwriting"
            );
        }
        Lease { id, generation }
    }

    pub fn remove(&self, id: &ClientId) -> Result<ClientRecord, RegistryError> {
        let mut inner = self.lock();
        match inner.clients.remove(id) {
            Some(entry) => {
                info!(client = %id, name = %entry.record.name, "removing client");
                Ok(entry.record)
            }
            None => Err(RegistryError::UnknownClient(id.clone())),
        }
    }

    /// Removes the entry created by `lease`, leaving any replacement alone.
    pub fn release(&self, lease: &Lease) -> Result<ClientRecord, RegistryError> {
        let mut inner = self.lock();
        match inner.clients.entry(lease.id.clone()) {
            Slot::Occupied(slot) if slot.get().generation == lease.generation => {
                let entry = slot.remove();
                info!(client = %lease.id, name = %entry.record.name, "removing client");
                Ok(entry.record)
            }
            Slot::Occupied(_) => Err(RegistryError::Superseded(lease.id.clone())),
            Slot::Vacant(_) => Err(RegistryError::UnknownClient(lease.id.clone())),
        }
    }

    /// Rebuilds the cached snapshot from the current records.
    ///
    /// On failure the previous snapshot stays in place.
    pub fn refresh(&self, now: DateTime<Utc>) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        debug!(clients = inner.clients.len(), "refreshing snapshot");

        let mut clients: Vec<ClientDescriptor> = inner
            .clients
            .values()
            .map(|entry| entry.record.descriptor())
            .collect();
        clients.sort_by(|a, b| {
            (a.connected_at, &a.name, a.address).cmp(&(b.connected_at, &b.name, b.address))
        });

        let message = ServerToClient::Snapshot(Snapshot {
            generated_at: now,
            clients,
        });
        let payload = serde_json::to_vec(&message).map_err(RegistryError::Encode)?;

        inner.snapshot = Bytes::from(payload);
        inner.generated_at = Some(now);
        Ok(())
    }

    /// Last cached snapshot bytes; empty until the first refresh.
    pub fn snapshot(&self) -> Bytes {
        self.lock().snapshot.clone()
    }

    pub fn snapshot_generated_at(&self) -> Option<DateTime<Utc>> {
        self.lock().generated_at
    }

    /// Pulses every registered connection. Returns how many were newly woken.
    pub fn notify_all(&self) -> usize {
        let inner = self.lock();
        let mut woken = 0;
        for (id, entry) in &inner.clients {
            match entry.notify.pulse() {
                Pulse::Delivered => woken += 1,
                Pulse::AlreadyPending => debug!(client = %id, "pulse already pending"),
                Pulse::Closed => debug!(client = %id, "connection mailbox closed"),
            }
        }
        woken
    }

    pub fn len(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.lock().clients.contains_key(id)
    }

    pub fn records(&self) -> Vec<(ClientId, ClientRecord)> {
        self.lock()
            .clients
            .iter()
            .map(|(id, entry)| (id.clone(), entry.record.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn decode(bytes: &Bytes) -> Snapshot {
        match serde_json::from_slice::<ServerToClient>(bytes).expect("snapshot json") {
            ServerToClient::Snapshot(snapshot) => snapshot,
        }
    }

    #[test]
    fn add_and_remove_track_membership() {
        let registry = Registry::new();
        let (notify, _mailbox) = mailbox();
        let id = registry.add("alice".into(), addr(1), notify).id;

        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);

        let record = registry.remove(&id).expect("remove");
        assert_eq!(record.name, "alice");
        assert!(registry.is_empty());
    }

    #[test]
    fn removing_unknown_client_is_reported() {
        let registry = Registry::new();
        let err = registry.remove(&ClientId::from("ghost")).expect_err("unknown");
        assert!(matches!(err, RegistryError::UnknownClient(id) if id.as_str() == "ghost"));
    }

    #[test]
    fn duplicate_identity_overwrites() {
        let registry = Registry::new();
        let id = ClientId::from("same");
        let record = |name: &str| ClientRecord {
            name: name.into(),
            address: addr(2),
            connected_at: Utc::now(),
        };
        registry.insert(id.clone(), record("first"), mailbox().0);
        registry.insert(id.clone(), record("second"), mailbox().0);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.records()[0].1.name, "second");
    }

    #[test]
    fn stale_lease_leaves_replacement_registered() {
        let registry = Registry::new();
        let id = ClientId::from("same");
        let record = |name: &str| ClientRecord {
            name: name.into(),
            address: addr(2),
            connected_at: Utc::now(),
        };
        let first = registry.insert(id.clone(), record("first"), mailbox().0);
        let second = registry.insert(id.clone(), record("second"), mailbox().0);
        assert_ne!(first, second);

        let err = registry.release(&first).expect_err("superseded");
        assert!(matches!(err, RegistryError::Superseded(ref gone) if *gone == id));
        assert!(registry.contains(&id));
        assert_eq!(registry.records()[0].1.name, "second");

        let released = registry.release(&second).expect("release");
        assert_eq!(released.name, "second");
        assert!(registry.is_empty());

        let err = registry.release(&second).expect_err("already released");
        assert!(matches!(err, RegistryError::UnknownClient(_)));
    }

    #[test]
    fn snapshot_is_empty_until_refreshed() {
        let registry = Registry::new();
        registry.add("alice".into(), addr(3), mailbox().0);

        assert!(registry.snapshot().is_empty());
        assert!(registry.snapshot_generated_at().is_none());
    }

    #[test]
    fn refresh_captures_current_records() {
        let registry = Registry::new();
        let a = registry.add("a".into(), addr(4), mailbox().0).id;
        registry.add("b".into(), addr(5), mailbox().0);

        let now = Utc::now();
        registry.refresh(now).expect("refresh");
        let snapshot = decode(&registry.snapshot());
        assert_eq!(snapshot.generated_at, now);
        let names: HashSet<&str> = snapshot.names().into_iter().collect();
        assert_eq!(names, HashSet::from(["a", "b"]));

        // Cached bytes do not change until the next refresh.
        registry.remove(&a).expect("remove");
        assert_eq!(decode(&registry.snapshot()).clients.len(), 2);

        registry.refresh(Utc::now()).expect("refresh");
        assert_eq!(decode(&registry.snapshot()).names(), vec!["b"]);
    }

    #[tokio::test]
    async fn notify_all_never_blocks_on_full_mailboxes() {
        let registry = Registry::new();
        let (notify, mut mailbox) = mailbox();
        registry.add("slow".into(), addr(6), notify);
        let (closed, dropped) = super::mailbox();
        registry.add("gone".into(), addr(7), closed);
        drop(dropped);

        assert_eq!(registry.notify_all(), 1);
        assert_eq!(registry.notify_all(), 0);

        assert!(mailbox.try_recv());
        assert!(!mailbox.try_recv());
    }

    #[test]
    fn pulse_reports_outcome() {
        let (notify, mailbox) = mailbox();
        assert_eq!(notify.pulse(), Pulse::Delivered);
        assert_eq!(notify.pulse(), Pulse::AlreadyPending);
        drop(mailbox);
        assert_eq!(notify.pulse(), Pulse::Closed);
    }

    #[test]
    fn concurrent_add_remove_leaves_no_duplicates() {
        let registry = Arc::new(Registry::new());
        let workers: Vec<_> = (0..8u16)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let mut kept = Vec::new();
                    for i in 0..50u16 {
                        let id = registry.add(format!("{worker}-{i}"), addr(i), mailbox().0).id;
                        if i % 2 == 0 {
                            registry.remove(&id).expect("remove own client");
                        } else {
                            kept.push(id);
                        }
                    }
                    kept
                })
            })
            .collect();

        let mut kept = HashSet::new();
        for worker in workers {
            for id in worker.join().expect("worker") {
                assert!(kept.insert(id), "identity handed out twice");
            }
        }

        assert_eq!(registry.len(), kept.len());
        assert_eq!(kept.len(), 8 * 25);
        let listed: HashSet<ClientId> = registry.records().into_iter().map(|(id, _)| id).collect();
        assert_eq!(listed, kept);
    }

    #[test]
    fn refresh_orders_clients_by_connect_time() {
        let registry = Registry::new();
        let early = Utc::now() - chrono::Duration::seconds(10);
        registry.insert(
            ClientId::from("late"),
            ClientRecord {
                name: "late".into(),
                address: addr(8),
                connected_at: Utc::now(),
            },
            mailbox().0,
        );
        registry.insert(
            ClientId::from("early"),
            ClientRecord {
                name: "early".into(),
                address: addr(9),
                connected_at: early,
            },
            mailbox().0,
        );

        registry.refresh(Utc::now()).expect("refresh");
        let snapshot = decode(&registry.snapshot());
        assert_eq!(snapshot.names(), vec!["early", "late"]);
    }
}
