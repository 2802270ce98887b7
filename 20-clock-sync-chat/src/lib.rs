//! Multi-client chat over TCP with a clock synchronization exchange
//! multiplexed onto the same connection.
//!
//! Every unit on the wire is tagged and length-prefixed, so chat text and
//! clock traffic can never be confused. Each module owns one concern:
//!
//! - [`wire`] frames and classifies `SyncRequest`, `SyncReply`, and
//!   `ChatLine` units, including async read/write helpers.
//! - [`registry`] holds the server's lock-guarded set of live connections.
//! - [`broadcast`] fans a chat line out to every connection but its sender
//!   and evicts peers that stop accepting writes.
//! - [`responder`] answers sync requests with the server's wall clock.
//! - [`sync`] is the client's Cristian-style offset estimator.
//! - [`server`] accepts connections and runs one receive loop per peer.
//! - [`client`] dials the server, runs the receive task, and renders to a
//!   [`client::MessageSink`].
//! - [`cli`] parses the command line for server and client modes.
//! - [`clock`] and [`error`] hold the time source and error taxonomy.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod clock;
pub mod error;
pub mod registry;
pub mod responder;
pub mod server;
pub mod sync;
pub mod wire;

#[cfg(test)]
mod testing;

pub use error::ChatError;
