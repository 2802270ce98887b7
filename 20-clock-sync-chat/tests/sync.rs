use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use clock_sync_chat::{
    client::{ClientConfig, ClientSession, MessageSink},
    clock::ManualClock,
    server::{ChatServer, ServerConfig},
    sync::{SyncSample, SyncState},
    wire::{UnitDecoder, WireUnit, read_unit, write_unit},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(3);

struct SampleSink(mpsc::UnboundedSender<SyncSample>);

impl MessageSink for SampleSink {
    fn chat_line(&self, _alias: &str, _text: &str, _received_at: f64) {}

    fn clock_updated(&self, sample: &SyncSample) {
        let _ = self.0.send(*sample);
    }

    fn disconnected(&self) {}
}

async fn connect(
    addr: std::net::SocketAddr,
    clock: &ManualClock,
) -> Result<(ClientSession, mpsc::UnboundedReceiver<SyncSample>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = ClientConfig {
        server: addr,
        alias: "A".into(),
        ..ClientConfig::default()
    };
    let session =
        ClientSession::connect_with_clock(&config, Arc::new(SampleSink(tx)), Arc::new(clock.clone()))
            .await?;
    Ok((session, rx))
}

async fn expect_unit(stream: &mut TcpStream, decoder: &mut UnitDecoder) -> Result<WireUnit> {
    let unit = timeout(WAIT, read_unit(stream, decoder))
        .await
        .context("timed out waiting for unit")??
        .ok_or_else(|| anyhow!("client closed the connection"))??;
    Ok(unit)
}

#[tokio::test]
async fn offset_follows_the_server_clock() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_clock = ManualClock::new(2000.0);
    let server = ChatServer::with_clock(listener, ServerConfig::default(), Arc::new(server_clock));
    let addr = server.local_addr()?;
    let (stop, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    let client_clock = ManualClock::new(1000.0);
    let (session, mut samples) = connect(addr, &client_clock).await?;

    assert!(session.request_sync().await?);
    let sample = timeout(WAIT, samples.recv())
        .await?
        .context("sink closed")?;

    assert_eq!(sample.server_time, 2000.0);
    assert_eq!(sample.round_trip, 0.0);
    assert_eq!(sample.offset, 1000.0);
    assert_eq!(session.offset().get(), 1000.0);
    assert_eq!(session.synchronized_time(), 2000.0);

    let _ = stop.send(());
    task.await?;
    Ok(())
}

#[tokio::test]
async fn only_one_exchange_is_outstanding_at_a_time() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let client_clock = ManualClock::new(1000.000);
    let (session, mut samples) = connect(addr, &client_clock).await?;
    let (mut peer, _) = listener.accept().await?;
    let mut decoder = UnitDecoder::new();

    assert!(session.request_sync().await?);
    assert!(!session.request_sync().await?, "second tick must be skipped");
    assert!(matches!(session.sync_state(), SyncState::AwaitingReply(_)));
    assert_eq!(expect_unit(&mut peer, &mut decoder).await?, WireUnit::SyncRequest);

    client_clock.set(1000.100);
    write_unit(&mut peer, &WireUnit::sync_reply(1000.050)).await?;
    let sample = timeout(WAIT, samples.recv())
        .await?
        .context("sink closed")?;
    assert!((sample.round_trip - 0.100).abs() < 1e-9);
    assert!(sample.offset.abs() < 1e-9);
    assert_eq!(session.sync_state(), SyncState::Idle);

    // A duplicate reply has no exchange to complete and leaves the offset alone.
    write_unit(&mut peer, &WireUnit::sync_reply(5000.0)).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(session.offset().get().abs() < 1e-9);
    assert_eq!(session.sync_state(), SyncState::Idle);
    assert!(samples.try_recv().is_err());

    Ok(())
}

#[tokio::test]
async fn a_late_reply_is_discarded() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let client_clock = ManualClock::new(1000.0);
    let (session, mut samples) = connect(addr, &client_clock).await?;
    let (mut peer, _) = listener.accept().await?;
    let mut decoder = UnitDecoder::new();

    assert!(session.request_sync().await?);
    expect_unit(&mut peer, &mut decoder).await?;

    client_clock.set(1010.0);
    write_unit(&mut peer, &WireUnit::sync_reply(1500.0)).await?;

    // The rejected exchange frees the slot for the next request.
    timeout(WAIT, async {
        while session.sync_state() != SyncState::Idle {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert!(samples.try_recv().is_err());
    assert_eq!(session.offset().get(), 0.0);
    Ok(())
}

#[tokio::test]
async fn dropped_connection_abandons_a_pending_exchange() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let client_clock = ManualClock::new(1000.0);
    let (session, mut samples) = connect(addr, &client_clock).await?;
    let (mut peer, _) = listener.accept().await?;
    let mut decoder = UnitDecoder::new();

    assert!(session.request_sync().await?);
    assert_eq!(expect_unit(&mut peer, &mut decoder).await?, WireUnit::SyncRequest);
    assert!(matches!(session.sync_state(), SyncState::AwaitingReply(_)));

    drop(peer);
    timeout(WAIT, session.disconnected()).await?;

    assert!(!session.is_connected());
    assert_eq!(session.sync_state(), SyncState::Idle);
    assert_eq!(session.offset().get(), 0.0);
    assert!(samples.try_recv().is_err());
    Ok(())
}
