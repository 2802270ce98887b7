use std::{
    io::Write,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use chrono::{Local, TimeZone};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, watch},
    task::JoinHandle,
    time::{Interval, MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    clock::{Clock, system_clock},
    error::ChatError,
    sync::{ClockOffset, SyncInitiator, SyncOutcome, SyncSample, SyncState},
    wire::{UnitDecoder, WireUnit, read_unit, write_frame},
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub alias: String,
    pub sync_interval: Duration,
    /// Exchanges whose round trip exceeds this are discarded.
    pub max_round_trip: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from((Ipv4Addr::LOCALHOST, 65432)),
            alias: String::new(),
            sync_interval: Duration::from_secs(15),
            max_round_trip: Duration::from_secs(5),
        }
    }
}

/// Where the client pushes what it receives. Called from the receive task.
pub trait MessageSink: Send + Sync {
    /// A chat line from another peer, stamped with the synchronized time of receipt.
    fn chat_line(&self, alias: &str, text: &str, received_at: f64);
    fn clock_updated(&self, sample: &SyncSample);
    fn disconnected(&self);
}

/// One live connection to the server.
///
/// A single background task owns the read half; everything else (chat sends,
/// sync requests) shares the write half through a lock.
pub struct ClientSession {
    alias: String,
    writer: Mutex<OwnedWriteHalf>,
    sync: Arc<SyncInitiator>,
    receiver: JoinHandle<()>,
    closed: watch::Receiver<bool>,
}

impl ClientSession {
    pub async fn connect(
        config: &ClientConfig,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self, ChatError> {
        Self::connect_with_clock(config, sink, system_clock()).await
    }

    /// Dials the server. An empty alias or a failed dial ends the session
    /// before it starts; neither is retried.
    pub async fn connect_with_clock(
        config: &ClientConfig,
        sink: Arc<dyn MessageSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ChatError> {
        let alias = config.alias.trim();
        if alias.is_empty() {
            return Err(ChatError::EmptyAlias);
        }

        let stream = TcpStream::connect(config.server)
            .await
            .map_err(|source| ChatError::ConnectionRefused {
                addr: config.server,
                source,
            })?;
        if let Err(error) = stream.set_nodelay(true) {
            debug!(?error, "could not disable nagle");
        }
        info!("connected to {}", config.server);

        let (reader, writer) = stream.into_split();
        let sync = Arc::new(SyncInitiator::new(clock, config.max_round_trip));
        let (closed_tx, closed) = watch::channel(false);
        let receiver = tokio::spawn(receive_loop(reader, Arc::clone(&sync), sink, closed_tx));

        Ok(Self {
            alias: alias.to_string(),
            writer: Mutex::new(writer),
            sync,
            receiver,
            closed,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub async fn send_chat(&self, text: &str) -> Result<(), ChatError> {
        let frame = WireUnit::chat(self.alias.as_str(), text).encode()?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame)
            .await
            .map_err(ChatError::write_failure)
    }

    /// Starts a sync exchange unless one is already outstanding. Returns
    /// whether a request was sent.
    pub async fn request_sync(&self) -> Result<bool, ChatError> {
        let mut writer = self.writer.lock().await;
        self.sync.start_exchange(&mut *writer).await
    }

    pub fn local_time(&self) -> f64 {
        self.sync.clock().now()
    }

    /// Local wall clock corrected by the latest accepted offset.
    pub fn synchronized_time(&self) -> f64 {
        self.sync.synchronized_time()
    }

    pub fn offset(&self) -> ClockOffset {
        self.sync.offset()
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Resolves once the receive task has seen the connection end.
    pub async fn disconnected(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub async fn close(self) {
        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.shutdown().await {
            warn!(?error, "failed to shutdown client writer cleanly");
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Timer for periodic sync. The first tick fires immediately; ticks that
/// fall behind are skipped rather than bunched up.
pub fn sync_ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    sync: Arc<SyncInitiator>,
    sink: Arc<dyn MessageSink>,
    closed_tx: watch::Sender<bool>,
) {
    let mut decoder = UnitDecoder::new();
    loop {
        match read_unit(&mut reader, &mut decoder).await {
            Ok(Some(Ok(unit))) => route_inbound(unit, &sync, sink.as_ref()),
            Ok(Some(Err(error))) if error.is_fatal() => {
                warn!(%error, "unrecoverable stream from server");
                break;
            }
            Ok(Some(Err(error))) => warn!(%error, "dropped malformed unit from server"),
            Ok(None) => {
                info!("server closed the connection");
                break;
            }
            Err(error) => {
                warn!(?error, "connection lost");
                break;
            }
        }
    }

    if sync.abandon() {
        debug!("dropped outstanding sync exchange");
    }
    let _ = closed_tx.send(true);
    sink.disconnected();
}

fn route_inbound(unit: WireUnit, sync: &SyncInitiator, sink: &dyn MessageSink) {
    match unit {
        WireUnit::SyncReply { server_time } => {
            if let SyncOutcome::Applied(sample) = sync.handle_reply(server_time) {
                sink.clock_updated(&sample);
            }
        }
        WireUnit::ChatLine { alias, text } => {
            sink.chat_line(&alias, &text, sync.synchronized_time());
        }
        WireUnit::SyncRequest => debug!("ignoring sync request from server"),
    }
}

/// `HH:MM:SS` in the local timezone.
pub fn format_clock(timestamp: f64) -> String {
    let millis = (timestamp * 1000.0).round() as i64;
    match Local.timestamp_millis_opt(millis).single() {
        Some(time) => time.format("%H:%M:%S").to_string(),
        None => "--:--:--".to_string(),
    }
}

/// Line-oriented presentation on stdout.
#[derive(Debug, Default)]
pub struct TerminalSink {
    disconnect_reported: AtomicBool,
}

impl TerminalSink {
    pub fn notice(&self, line: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }

    pub fn own_message(&self, alias: &str, text: &str, sent_at: f64) {
        self.notice(&format!("[{}] <You ({alias})>: {text}", format_clock(sent_at)));
    }

    /// Returns `true` only the first time; both the receive task and a
    /// failed write can observe the same disconnect.
    fn first_disconnect(&self) -> bool {
        !self.disconnect_reported.swap(true, Ordering::SeqCst)
    }
}

impl MessageSink for TerminalSink {
    fn chat_line(&self, alias: &str, text: &str, received_at: f64) {
        self.notice(&format!("[{}] <{alias}> {text}", format_clock(received_at)));
    }

    fn clock_updated(&self, sample: &SyncSample) {
        self.notice(&format!(
            "*** clock synced: server {}, rtt {:.2}ms, offset {:+.6}s",
            format_clock(sample.server_time),
            sample.round_trip * 1000.0,
            sample.offset
        ));
    }

    fn disconnected(&self) {
        if self.first_disconnect() {
            self.notice("*** server closed the connection");
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let config = ClientConfig::from(args);
    let sink = Arc::new(TerminalSink::default());
    let session = ClientSession::connect(&config, sink.clone()).await?;
    sink.notice(&format!("*** connected as {}", session.alias()));

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut ticker = sync_ticker(config.sync_interval);

    run_client_loop(&session, &sink, &mut stdin, &mut input, &mut ticker).await?;
    session.close().await;

    Ok(())
}

async fn run_client_loop(
    session: &ClientSession,
    sink: &TerminalSink,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    ticker: &mut Interval,
) -> Result<()> {
    loop {
        input.clear();
        let step = select! {
            bytes_read = stdin.read_line(input) => {
                handle_stdin_input(bytes_read, input, session, sink).await
            }
            _ = ticker.tick() => session.request_sync().await.map(|_| true).map_err(anyhow::Error::from),
            _ = session.disconnected() => Ok(false),
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                Ok(false)
            }
        };
        if !keep_running(step, sink)? {
            break;
        }
    }
    Ok(())
}

/// A write that finds the server gone ends the session like a closed
/// connection does; anything else is a real error.
fn keep_running(step: Result<bool>, sink: &dyn MessageSink) -> Result<bool> {
    match step {
        Err(error) if is_disconnect(&error) => {
            warn!(%error, "server went away");
            sink.disconnected();
            Ok(false)
        }
        other => other,
    }
}

fn is_disconnect(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ChatError>()
        .is_some_and(ChatError::is_disconnect)
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    session: &ClientSession,
    sink: &TerminalSink,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        sink.notice("*** leaving chat");
        return Ok(false);
    }

    if text.eq_ignore_ascii_case("/time") {
        sink.notice(&format!(
            "*** local {} | synchronized {} (offset {:+.6}s)",
            format_clock(session.local_time()),
            format_clock(session.synchronized_time()),
            session.offset().get()
        ));
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/sync") {
        if !session.request_sync().await? {
            sink.notice("*** sync already in progress");
        }
        return Ok(true);
    }

    session.send_chat(text).await?;
    sink.own_message(session.alias(), text, session.synchronized_time());
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_format_is_hours_minutes_seconds() {
        let formatted = format_clock(1_700_000_000.123456);
        assert_eq!(formatted.len(), 8);
        assert_eq!(formatted.matches(':').count(), 2);
    }

    #[test]
    fn out_of_range_times_render_as_placeholder() {
        assert_eq!(format_clock(f64::MAX), "--:--:--");
    }

    #[tokio::test]
    async fn empty_alias_is_rejected_before_dialing() {
        let config = ClientConfig {
            alias: "   ".into(),
            ..ClientConfig::default()
        };
        let result = ClientSession::connect(&config, Arc::new(TerminalSink::default())).await;
        assert!(matches!(result, Err(ChatError::EmptyAlias)));
    }

    #[derive(Default)]
    struct CountingSink {
        disconnects: std::sync::atomic::AtomicUsize,
    }

    impl MessageSink for CountingSink {
        fn chat_line(&self, _alias: &str, _text: &str, _received_at: f64) {}

        fn clock_updated(&self, _sample: &SyncSample) {}

        fn disconnected(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn write_failure_ends_the_session_cleanly() {
        let sink = CountingSink::default();
        let broken = ChatError::write_failure(std::io::ErrorKind::BrokenPipe.into());

        let step = keep_running(Err(broken.into()), &sink);
        assert!(!step.unwrap());
        assert_eq!(sink.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn other_errors_still_propagate() {
        let sink = CountingSink::default();

        assert!(keep_running(Err(ChatError::EmptyAlias.into()), &sink).is_err());
        assert!(keep_running(Ok(true), &sink).unwrap());
        assert_eq!(sink.disconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn terminal_reports_a_disconnect_once() {
        let sink = TerminalSink::default();
        assert!(sink.first_disconnect());
        assert!(!sink.first_disconnect());
    }
}
