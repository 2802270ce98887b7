//! Server half of the clock exchange.
//!
//! Stateless: every `SyncRequest` is answered on its own connection with the
//! server's wall clock, and nothing is remembered between requests.

use std::time::Duration;

use tracing::debug;

use crate::{
    clock::Clock,
    error::ChatError,
    registry::{Connection, write_with_limit},
    wire::WireUnit,
};

/// Answers a sync request on `conn`, returning the time that was sent.
///
/// The clock is read only after the write half is held, so time spent
/// waiting behind a broadcast does not show up as extra network latency.
pub async fn respond(
    conn: &Connection,
    clock: &dyn Clock,
    limit: Duration,
) -> Result<f64, ChatError> {
    let mut writer = conn.lock_writer().await;
    let server_time = clock.now();
    let frame = WireUnit::sync_reply(server_time).encode()?;
    write_with_limit(&mut *writer, &frame, limit).await?;
    drop(writer);

    debug!(connection = conn.id(), server_time, "answered sync request");
    Ok(server_time)
}
