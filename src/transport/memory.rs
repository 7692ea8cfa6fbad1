//! In-process transport: a full mesh of unbounded channels.
//!
//! Every rank of the cluster lives in the same process, typically one tokio
//! task per rank. Used by the test harness and the `sum` binary; also the
//! reference semantics for the ordering contract, since a channel trivially
//! preserves send order.

use crate::error::{CanopyError, Result};
use crate::transport::Transport;
use crate::types::{Rank, Tag};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, mpsc};

/// One rank's endpoint of an in-process cluster.
pub struct MemoryTransport {
    rank: Rank,
    world_size: u32,
    /// Send side, indexed by destination rank.
    peers: Vec<mpsc::UnboundedSender<(Tag, Bytes)>>,
    /// Receive side, indexed by source rank.
    inboxes: Vec<Mutex<PeerInbox>>,
}

/// Messages from one peer: the live channel plus messages already drained
/// while looking for a different tag.
struct PeerInbox {
    rx: mpsc::UnboundedReceiver<(Tag, Bytes)>,
    stashed: HashMap<Tag, VecDeque<Bytes>>,
}

impl MemoryTransport {
    /// Wire up a full mesh of `world_size` ranks and return one transport
    /// per rank, sorted by rank.
    pub fn cluster(world_size: u32) -> Vec<MemoryTransport> {
        let n = world_size as usize;

        // channel (src, dst): senders handed to src, receivers to dst.
        let mut txs: Vec<Vec<Option<mpsc::UnboundedSender<(Tag, Bytes)>>>> = Vec::new();
        let mut rxs: Vec<Vec<Option<mpsc::UnboundedReceiver<(Tag, Bytes)>>>> = Vec::new();
        for _ in 0..n {
            let mut tx_row = Vec::new();
            let mut rx_row = Vec::new();
            for _ in 0..n {
                let (tx, rx) = mpsc::unbounded_channel();
                tx_row.push(Some(tx));
                rx_row.push(Some(rx));
            }
            txs.push(tx_row);
            rxs.push(rx_row);
        }

        (0..n)
            .map(|rank| {
                let peers = (0..n)
                    .map(|dst| txs[rank][dst].take().expect("each sender is taken once"))
                    .collect();
                let inboxes = (0..n)
                    .map(|src| {
                        Mutex::new(PeerInbox {
                            rx: rxs[src][rank].take().expect("each receiver is taken once"),
                            stashed: HashMap::new(),
                        })
                    })
                    .collect();
                MemoryTransport {
                    rank: rank as Rank,
                    world_size,
                    peers,
                    inboxes,
                }
            })
            .collect()
    }

    fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank >= self.world_size {
            return Err(CanopyError::InvalidRank {
                rank,
                world_size: self.world_size,
            });
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn send<'a>(&'a self, dest: Rank, tag: Tag, payload: Bytes) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check_rank(dest)?;
            self.peers[dest as usize]
                .send((tag, payload))
                .map_err(|_| CanopyError::PeerDisconnected { rank: dest })
        })
    }

    fn recv<'a>(&'a self, src: Rank, tag: Tag) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            self.check_rank(src)?;
            let mut inbox = self.inboxes[src as usize].lock().await;
            if let Some(queue) = inbox.stashed.get_mut(&tag) {
                if let Some(payload) = queue.pop_front() {
                    return Ok(payload);
                }
            }
            loop {
                let (got_tag, payload) = inbox
                    .rx
                    .recv()
                    .await
                    .ok_or(CanopyError::PeerDisconnected { rank: src })?;
                if got_tag == tag {
                    return Ok(payload);
                }
                inbox.stashed.entry(got_tag).or_default().push_back(payload);
            }
        })
    }
}
