//! Point-to-point message transport underneath the summation drivers.
//!
//! The kernel treats the transport as an injected capability: anything that
//! can deliver tagged byte messages between ranks with per-(sender, tag)
//! FIFO ordering works. That ordering is the only assumption the protocol
//! makes; everything else — which value travels when — is pinned down by the
//! topology.

mod memory;
mod quic;
mod tls;

pub use memory::MemoryTransport;
pub use quic::QuicTransport;

use crate::error::Result;
use crate::types::{Rank, Tag};
use bytes::Bytes;
use futures::future::BoxFuture;

/// Tagged point-to-point byte messaging between a fixed set of ranks.
///
/// Implementations must deliver messages with the same (sender, tag) in
/// send order. There is no ordering requirement across senders or tags.
pub trait Transport: Send + Sync {
    /// This process's rank (0-indexed).
    fn rank(&self) -> Rank;

    /// Total number of ranks.
    fn world_size(&self) -> u32;

    /// Send one tagged message to a peer. Completion means the message is
    /// handed to the channel, not that the peer consumed it.
    fn send<'a>(&'a self, dest: Rank, tag: Tag, payload: Bytes) -> BoxFuture<'a, Result<()>>;

    /// Receive the next message with the given tag from a peer, in the
    /// order the peer sent them.
    fn recv<'a>(&'a self, src: Rank, tag: Tag) -> BoxFuture<'a, Result<Bytes>>;
}
