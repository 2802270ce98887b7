use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::{
    registry::{Connection, ConnectionId, ConnectionRegistry},
    wire::{WireError, WireUnit},
};

/// Outcome of one fan-out, mostly for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<ConnectionId>,
}

/// Fans chat lines out to every registered connection except the sender.
#[derive(Clone)]
pub struct Broadcaster {
    registry: ConnectionRegistry,
    write_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: ConnectionRegistry, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
        }
    }

    /// Delivers `alias`/`text` to all connections but `origin`.
    ///
    /// Targets come from a snapshot taken before any write starts, and writes
    /// run concurrently so one slow peer only costs up to `write_timeout`.
    /// Targets whose write fails are evicted once every write has settled.
    pub async fn broadcast(
        &self,
        origin: ConnectionId,
        alias: &str,
        text: &str,
    ) -> Result<BroadcastReport, WireError> {
        let frame = WireUnit::chat(alias, text).encode()?;
        let targets: Vec<Arc<Connection>> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|conn| conn.id() != origin)
            .collect();

        let results = join_all(
            targets
                .iter()
                .map(|conn| conn.send_frame(&frame, self.write_timeout)),
        )
        .await;

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (conn, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    warn!(connection = conn.id(), peer = %conn.peer(), ?error, "broadcast write failed");
                    failed.push(Arc::clone(conn));
                }
            }
        }

        for conn in failed {
            self.evict(&conn).await;
            report.evicted.push(conn.id());
        }

        debug!(origin, delivered = report.delivered, "chat line fanned out");
        Ok(report)
    }

    async fn evict(&self, conn: &Connection) {
        if self.registry.unregister(conn.id()).await.is_some() {
            info!(connection = conn.id(), peer = %conn.peer(), "evicted unwritable connection");
        }
        conn.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{FailingWriter, test_addr},
        wire::{UnitDecoder, read_unit},
    };
    use tokio::{io::DuplexStream, time::timeout};

    const LIMIT: Duration = Duration::from_secs(1);

    async fn attach(registry: &ConnectionRegistry) -> (Arc<Connection>, DuplexStream) {
        let (writer, reader) = tokio::io::duplex(1024);
        let conn = Arc::new(Connection::new(registry.next_id(), test_addr(), writer));
        registry.register(Arc::clone(&conn)).await;
        (conn, reader)
    }

    async fn next_unit(reader: &mut DuplexStream) -> Option<WireUnit> {
        let mut decoder = UnitDecoder::new();
        let decoded = timeout(Duration::from_millis(100), read_unit(reader, &mut decoder))
            .await
            .ok()?
            .expect("duplex read");
        decoded.map(|unit| unit.expect("well formed unit"))
    }

    #[tokio::test]
    async fn fan_out_reaches_everyone_but_the_sender() {
        let registry = ConnectionRegistry::new();
        let mut peers = Vec::new();
        for _ in 0..4 {
            peers.push(attach(&registry).await);
        }
        let broadcaster = Broadcaster::new(registry.clone(), LIMIT);
        let origin = peers[1].0.id();

        let report = broadcaster.broadcast(origin, "bob", "hi all").await.unwrap();
        assert_eq!(report.delivered, 3);
        assert!(report.evicted.is_empty());

        for (conn, reader) in peers.iter_mut() {
            let received = next_unit(reader).await;
            if conn.id() == origin {
                assert_eq!(received, None);
            } else {
                assert_eq!(received, Some(WireUnit::chat("bob", "hi all")));
            }
        }
    }

    #[tokio::test]
    async fn failed_peer_is_evicted_and_pruned_from_later_broadcasts() {
        let registry = ConnectionRegistry::new();
        let (a, mut a_reader) = attach(&registry).await;
        let (b, mut b_reader) = attach(&registry).await;
        let broadcaster = Broadcaster::new(registry.clone(), LIMIT);

        let report = broadcaster.broadcast(a.id(), "A", "hello").await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(next_unit(&mut b_reader).await, Some(WireUnit::chat("A", "hello")));

        // B's socket goes away; the next write to it fails.
        drop(b_reader);
        let report = broadcaster.broadcast(a.id(), "A", "anyone?").await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.evicted, vec![b.id()]);
        assert_eq!(registry.len().await, 1);

        let report = broadcaster.broadcast(a.id(), "A", "still alone").await.unwrap();
        assert_eq!(report, BroadcastReport::default());
        assert_eq!(next_unit(&mut a_reader).await, None);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_other_receivers() {
        let registry = ConnectionRegistry::new();
        let (origin, _origin_reader) = attach(&registry).await;
        let broken = Arc::new(Connection::new(registry.next_id(), test_addr(), FailingWriter));
        registry.register(Arc::clone(&broken)).await;
        let (_healthy, mut healthy_reader) = attach(&registry).await;

        let report = Broadcaster::new(registry.clone(), LIMIT)
            .broadcast(origin.id(), "A", "1700000000.123456")
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![broken.id()]);
        assert!(!registry.contains(broken.id()).await);
        assert_eq!(
            next_unit(&mut healthy_reader).await,
            Some(WireUnit::chat("A", "1700000000.123456"))
        );
    }
}
