use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::AsyncRead,
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    broadcast::Broadcaster,
    clock::{Clock, system_clock},
    error::ChatError,
    registry::{Connection, ConnectionRegistry},
    responder::respond,
    wire::{UnitDecoder, WireError, WireUnit, read_unit},
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Upper bound on a single blocking read; on expiry the loop checks
    /// whether its connection has been evicted.
    pub idle_timeout: Duration,
    /// Upper bound on a single write before the peer is treated as gone.
    pub write_timeout: Duration,
    /// Malformed units tolerated per connection before it is evicted.
    pub max_malformed_units: u32,
    /// How long shutdown waits for connection tasks before aborting them.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 65432)),
            idle_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_secs(2),
            max_malformed_units: 8,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

pub struct ChatServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

struct ServerState {
    registry: ConnectionRegistry,
    broadcaster: Broadcaster,
    clock: Arc<dyn Clock>,
    config: ServerConfig,
}

impl ChatServer {
    /// Binds `config.listen`. Failing to bind is fatal to startup.
    pub async fn bind(config: ServerConfig) -> Result<Self, ChatError> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| ChatError::Bind {
                addr: config.listen,
                source,
            })?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self::with_clock(listener, config, system_clock())
    }

    pub fn with_clock(listener: TcpListener, config: ServerConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = ConnectionRegistry::new();
        let broadcaster = Broadcaster::new(registry.clone(), config.write_timeout);
        Self {
            listener,
            state: Arc::new(ServerState {
                registry,
                broadcaster,
                clock,
                config,
            }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle onto the live connection set.
    pub fn registry(&self) -> ConnectionRegistry {
        self.state.registry.clone()
    }

    /// Accepts connections until `shutdown` resolves, then stops accepting
    /// and drains the per-connection tasks.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer { listener, state } = self;
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &stop_rx, &mut sessions);
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = ?err, "connection task failed");
                    }
                }
            }
        }

        drop(listener);
        handle_shutdown(&state, stop_tx, sessions).await;
    }

    pub async fn run_until_ctrl_c(self) {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(
    state: &ServerState,
    stop_tx: watch::Sender<bool>,
    mut sessions: JoinSet<()>,
) {
    let active = state.registry.len().await;
    info!(active, "server shutting down");
    let _ = stop_tx.send(true);

    let drained = timeout(state.config.drain_timeout, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = sessions.len(), "aborting connections that did not drain");
        sessions.abort_all();
    }

    for conn in state.registry.drain().await {
        conn.close().await;
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
    stop_rx: &watch::Receiver<bool>,
    sessions: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            let state = Arc::clone(state);
            let stop_rx = stop_rx.clone();
            sessions.spawn(handle_connection(stream, peer, state, stop_rx));
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

/// Why a connection's receive loop stopped.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Evicted,
    Failed(ChatError),
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
    mut stop_rx: watch::Receiver<bool>,
) {
    if let Err(error) = stream.set_nodelay(true) {
        debug!(%peer, ?error, "could not disable nagle");
    }

    let (mut reader, writer) = stream.into_split();
    let conn = Arc::new(Connection::new(state.registry.next_id(), peer, writer));
    state.registry.register(Arc::clone(&conn)).await;
    let active = state.registry.len().await;
    info!(connection = conn.id(), %peer, active, "client connected");

    let end = run_receive_loop(&mut reader, &conn, &state, &mut stop_rx).await;
    release_connection(&state, &conn, end).await;
}

/// The only reader of `conn`: classifies every inbound unit and routes it.
async fn run_receive_loop<R>(
    reader: &mut R,
    conn: &Arc<Connection>,
    state: &ServerState,
    stop_rx: &mut watch::Receiver<bool>,
) -> SessionEnd
where
    R: AsyncRead + Unpin,
{
    let mut decoder = UnitDecoder::new();

    loop {
        let read = select! {
            _ = stop_rx.changed() => return SessionEnd::Shutdown,
            read = timeout(state.config.idle_timeout, read_unit(reader, &mut decoder)) => read,
        };

        let decoded = match read {
            Err(_idle) => {
                if !state.registry.contains(conn.id()).await {
                    return SessionEnd::Evicted;
                }
                continue;
            }
            Ok(Ok(Some(decoded))) => decoded,
            Ok(Ok(None)) => return SessionEnd::Failed(ChatError::PeerDisconnected),
            Ok(Err(error)) => {
                debug!(connection = conn.id(), ?error, "read failed");
                return SessionEnd::Failed(ChatError::PeerDisconnected);
            }
        };

        // A broadcast may have evicted this connection while it was still sending.
        if !state.registry.contains(conn.id()).await {
            return SessionEnd::Evicted;
        }

        if let Err(err) = route_unit(decoded, conn, state).await {
            return SessionEnd::Failed(err);
        }
    }
}

async fn route_unit(
    decoded: Result<WireUnit, WireError>,
    conn: &Connection,
    state: &ServerState,
) -> Result<(), ChatError> {
    match decoded {
        Ok(WireUnit::SyncRequest) => {
            respond(conn, state.clock.as_ref(), state.config.write_timeout).await?;
        }
        Ok(WireUnit::ChatLine { alias, text }) => {
            info!(connection = conn.id(), %alias, %text, "chat line received");
            state.broadcaster.broadcast(conn.id(), &alias, &text).await?;
        }
        Ok(unit @ WireUnit::SyncReply { .. }) => {
            note_malformed(conn, state, WireError::UnexpectedUnit(unit.tag()))?;
        }
        Err(error) => note_malformed(conn, state, error)?,
    }
    Ok(())
}

fn note_malformed(conn: &Connection, state: &ServerState, error: WireError) -> Result<(), ChatError> {
    let count = conn.record_malformed();
    warn!(connection = conn.id(), count, %error, "dropped malformed unit");
    if error.is_fatal() || count > state.config.max_malformed_units {
        return Err(ChatError::MalformedUnit(error));
    }
    Ok(())
}

async fn release_connection(state: &ServerState, conn: &Connection, end: SessionEnd) {
    state.registry.unregister(conn.id()).await;
    conn.close().await;

    let active = state.registry.len().await;
    let peer = conn.peer();
    match end {
        SessionEnd::Shutdown => debug!(connection = conn.id(), %peer, "closed for shutdown"),
        SessionEnd::Evicted => info!(connection = conn.id(), %peer, active, "evicted connection released"),
        SessionEnd::Failed(ChatError::PeerDisconnected) => {
            info!(connection = conn.id(), %peer, active, "client disconnected")
        }
        SessionEnd::Failed(error) => {
            warn!(connection = conn.id(), %peer, active, %error, "closing connection")
        }
    }
}
