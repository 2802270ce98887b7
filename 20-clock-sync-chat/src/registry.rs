use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, MutexGuard},
    time::timeout,
};
use tracing::debug;

use crate::{
    error::ChatError,
    wire::{WireUnit, write_frame},
};

pub type ConnectionId = u64;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Server-side view of one peer: its identity plus the write half.
///
/// The read half is owned by the connection's receive loop and never stored
/// here. Every writer (broadcast, sync replies) goes through `writer`, so
/// frames from different tasks never interleave on the wire.
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    writer: Mutex<BoxedWriter>,
    malformed: AtomicU32,
}

impl Connection {
    pub fn new<W>(id: ConnectionId, peer: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            peer,
            writer: Mutex::new(Box::new(writer)),
            malformed: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Exclusive access to the write half, for callers that must sample
    /// something (like the clock) only once the writer is theirs.
    pub async fn lock_writer(&self) -> MutexGuard<'_, BoxedWriter> {
        self.writer.lock().await
    }

    /// Writes one pre-encoded frame, giving up after `limit`.
    pub async fn send_frame(&self, frame: &[u8], limit: Duration) -> Result<(), ChatError> {
        let mut writer = self.writer.lock().await;
        write_with_limit(&mut *writer, frame, limit).await
    }

    pub async fn send_unit(&self, unit: &WireUnit, limit: Duration) -> Result<(), ChatError> {
        let frame = unit.encode()?;
        self.send_frame(&frame, limit).await
    }

    /// Bumps the malformed-unit counter and returns the new total.
    pub fn record_malformed(&self) -> u32 {
        self.malformed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn malformed_count(&self) -> u32 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Shuts down the write half. The peer sees end-of-stream.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.shutdown().await {
            debug!(connection = self.id, ?error, "write half already gone");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("malformed", &self.malformed_count())
            .finish()
    }
}

pub(crate) async fn write_with_limit<W>(
    writer: &mut W,
    frame: &[u8],
    limit: Duration,
) -> Result<(), ChatError>
where
    W: AsyncWrite + Unpin,
{
    match timeout(limit, write_frame(writer, frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(ChatError::write_failure(source)),
        Err(_) => Err(ChatError::write_failure(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("write not accepted within {limit:?}"),
        ))),
    }
}

/// Lock-guarded set of live connections.
///
/// Cloning the registry hands out another handle to the same set. The lock is
/// only ever held for the list operation itself, never across network I/O.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    connections: Mutex<Vec<Arc<Connection>>>,
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, connection: Arc<Connection>) {
        self.inner.connections.lock().await.push(connection);
    }

    /// Removes the connection with `id`. Unknown ids are a no-op.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut connections = self.inner.connections.lock().await;
        let index = connections.iter().position(|conn| conn.id() == id)?;
        Some(connections.remove(index))
    }

    /// Point-in-time copy in registration order, for iterating outside the lock.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.connections.lock().await.clone()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner
            .connections
            .lock()
            .await
            .iter()
            .any(|conn| conn.id() == id)
    }

    pub async fn len(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.connections.lock().await.is_empty()
    }

    /// Empties the registry, returning everything that was in it.
    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut *self.inner.connections.lock().await)
    }
}
