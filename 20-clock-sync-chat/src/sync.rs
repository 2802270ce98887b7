//! Client half of the clock exchange (Cristian's algorithm).
//!
//! The client stamps T1 just before sending a `SyncRequest` and T2 when the
//! matching `SyncReply` arrives. Assuming the reply spent half the round trip
//! in flight, the server clock at T2 reads `server_time + rtt / 2`, and the
//! offset to add to the local clock is that value minus T2.
//!
//! At most one exchange is outstanding. T1 lives inside that exchange, not in
//! a shared cell, so a timer tick that fires before the reply cannot
//! overwrite it; the tick is skipped instead.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use crate::{
    clock::Clock,
    error::ChatError,
    wire::{WireUnit, write_frame},
};

/// `server_time + (t2 - t1) / 2 - t2`.
pub fn compute_offset(server_time: f64, t1: f64, t2: f64) -> f64 {
    server_time + (t2 - t1) / 2.0 - t2
}

/// One completed exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSample {
    pub server_time: f64,
    pub t1: f64,
    pub t2: f64,
    pub round_trip: f64,
    pub offset: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingExchange {
    t1: f64,
}

impl PendingExchange {
    pub fn t1(&self) -> f64 {
        self.t1
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncState {
    Idle,
    AwaitingReply(PendingExchange),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    /// The offset was updated from this sample.
    Applied(SyncSample),
    /// The round trip was negative or too long to trust; offset unchanged.
    Rejected { round_trip: f64 },
    /// No exchange was outstanding.
    Unsolicited,
}

/// Current clock correction, shared between the estimator (sole writer) and
/// any number of readers.
#[derive(Debug, Clone, Default)]
pub struct ClockOffset {
    bits: Arc<AtomicU64>,
}

impl ClockOffset {
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    fn set(&self, offset: f64) {
        self.bits.store(offset.to_bits(), Ordering::Release);
    }

    /// Local wall clock plus the current offset.
    pub fn synchronized_time(&self, clock: &dyn Clock) -> f64 {
        clock.now() + self.get()
    }
}

/// The two-state machine behind the exchange. Pure: callers supply the times.
#[derive(Debug)]
pub struct SyncEstimator {
    state: SyncState,
    offset: ClockOffset,
    max_round_trip: f64,
}

impl SyncEstimator {
    pub fn new(max_round_trip: Duration) -> Self {
        Self {
            state: SyncState::Idle,
            offset: ClockOffset::default(),
            max_round_trip: max_round_trip.as_secs_f64(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn offset(&self) -> ClockOffset {
        self.offset.clone()
    }

    /// Opens an exchange stamped `t1`. Returns `false`, leaving the
    /// outstanding exchange untouched, if one is already in flight.
    pub fn begin(&mut self, t1: f64) -> bool {
        match self.state {
            SyncState::Idle => {
                self.state = SyncState::AwaitingReply(PendingExchange { t1 });
                true
            }
            SyncState::AwaitingReply(_) => false,
        }
    }

    /// Consumes the outstanding exchange with a reply received at `t2`.
    pub fn complete(&mut self, server_time: f64, t2: f64) -> SyncOutcome {
        let pending = match std::mem::replace(&mut self.state, SyncState::Idle) {
            SyncState::AwaitingReply(pending) => pending,
            SyncState::Idle => return SyncOutcome::Unsolicited,
        };

        let round_trip = t2 - pending.t1;
        if !(0.0..=self.max_round_trip).contains(&round_trip) {
            return SyncOutcome::Rejected { round_trip };
        }

        let offset = compute_offset(server_time, pending.t1, t2);
        self.offset.set(offset);
        SyncOutcome::Applied(SyncSample {
            server_time,
            t1: pending.t1,
            t2,
            round_trip,
            offset,
        })
    }

    /// Drops any outstanding exchange. Returns whether one was pending.
    pub fn abandon(&mut self) -> bool {
        matches!(
            std::mem::replace(&mut self.state, SyncState::Idle),
            SyncState::AwaitingReply(_)
        )
    }
}

/// Drives [`SyncEstimator`] against a real clock and connection.
///
/// `start_exchange` runs on the client's control flow (timer ticks) and
/// `handle_reply` on its receive loop; the estimator lock is never held
/// across an await.
pub struct SyncInitiator {
    estimator: Mutex<SyncEstimator>,
    offset: ClockOffset,
    clock: Arc<dyn Clock>,
}

impl SyncInitiator {
    pub fn new(clock: Arc<dyn Clock>, max_round_trip: Duration) -> Self {
        let estimator = SyncEstimator::new(max_round_trip);
        let offset = estimator.offset();
        Self {
            estimator: Mutex::new(estimator),
            offset,
            clock,
        }
    }

    pub fn offset(&self) -> ClockOffset {
        self.offset.clone()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn synchronized_time(&self) -> f64 {
        self.offset.synchronized_time(self.clock.as_ref())
    }

    pub fn state(&self) -> SyncState {
        self.estimator().state()
    }

    /// Sends a `SyncRequest` on `writer` unless an exchange is already
    /// outstanding. Returns whether a request went out.
    ///
    /// Callers should hold exclusive use of `writer` before calling, so T1 is
    /// taken as close to the send as possible.
    pub async fn start_exchange<W>(&self, writer: &mut W) -> Result<bool, ChatError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = WireUnit::SyncRequest.encode()?;
        let t1 = self.clock.now();
        let began = self.estimator().begin(t1);
        if !began {
            debug!("sync exchange still outstanding; skipping tick");
            return Ok(false);
        }

        if let Err(source) = write_frame(writer, &frame).await {
            self.abandon();
            return Err(ChatError::write_failure(source));
        }
        Ok(true)
    }

    /// Feeds a `SyncReply` that just arrived.
    pub fn handle_reply(&self, server_time: f64) -> SyncOutcome {
        let t2 = self.clock.now();
        let outcome = self.estimator().complete(server_time, t2);
        match outcome {
            SyncOutcome::Applied(sample) => {
                debug!(
                    offset = sample.offset,
                    round_trip_ms = sample.round_trip * 1000.0,
                    "clock synchronized"
                );
            }
            SyncOutcome::Rejected { round_trip } => {
                warn!(round_trip_ms = round_trip * 1000.0, "discarded sync sample");
            }
            SyncOutcome::Unsolicited => debug!(server_time, "ignoring unsolicited sync reply"),
        }
        outcome
    }

    pub fn abandon(&self) -> bool {
        self.estimator().abandon()
    }

    fn estimator(&self) -> MutexGuard<'_, SyncEstimator> {
        self.estimator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
