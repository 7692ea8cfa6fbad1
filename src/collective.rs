//! Collectives assembled from tagged point-to-point messages.
//!
//! The transport contract only requires p2p send/recv; the broadcast of the
//! final result and the single-integer allgather used for region discovery
//! are built here on top of it.

use crate::error::{CanopyError, Result};
use crate::transport::Transport;
use crate::types::{Rank, tags};
use bytes::Bytes;
use futures::future::try_join_all;
use std::sync::Arc;

/// Tree broadcast of an opaque payload from `root` to every rank in
/// O(log P) rounds. Ranks are remapped so the root becomes logical rank 0;
/// the parent of logical rank L is (L-1)/2, its children 2L+1 and 2L+2.
///
/// Non-root callers pass any placeholder payload and receive the root's.
pub(crate) async fn broadcast_bytes(
    transport: &Arc<dyn Transport>,
    root: Rank,
    payload: Bytes,
) -> Result<Bytes> {
    let world = transport.world_size();
    if world <= 1 {
        return Ok(payload);
    }
    let rank = transport.rank();
    let logical = |r: Rank| (r + world - root) % world;
    let physical = |l: Rank| (l + root) % world;
    let my_logical = logical(rank);

    let payload = if my_logical == 0 {
        payload
    } else {
        let parent_logical = (my_logical - 1) / 2;
        transport
            .recv(physical(parent_logical), tags::BROADCAST)
            .await?
    };

    let mut sends = Vec::new();
    for child_logical in [2 * my_logical + 1, 2 * my_logical + 2] {
        if child_logical < world {
            sends.push(transport.send(
                physical(child_logical),
                tags::BROADCAST,
                payload.clone(),
            ));
        }
    }
    if !sends.is_empty() {
        try_join_all(sends).await?;
    }
    Ok(payload)
}

/// Broadcast one f64 from `root`; every rank returns the root's value.
pub(crate) async fn broadcast_f64(
    transport: &Arc<dyn Transport>,
    root: Rank,
    value: f64,
) -> Result<f64> {
    let payload = Bytes::copy_from_slice(&value.to_le_bytes());
    let payload = broadcast_bytes(transport, root, payload).await?;
    decode_f64(&payload)
}

/// All-gather of a single u64: rank 0 collects everyone's value, then the
/// packed vector travels back down the broadcast tree. Returns the values
/// indexed by rank.
pub(crate) async fn allgather_u64(transport: &Arc<dyn Transport>, value: u64) -> Result<Vec<u64>> {
    let world = transport.world_size();
    let rank = transport.rank();
    if world <= 1 {
        return Ok(vec![value]);
    }

    let packed = if rank == 0 {
        let mut buf = Vec::with_capacity(world as usize * 8);
        buf.extend_from_slice(&value.to_le_bytes());
        for src in 1..world {
            let payload = transport.recv(src, tags::GATHER).await?;
            if payload.len() != 8 {
                return Err(CanopyError::SizeMismatch {
                    expected: 8,
                    actual: payload.len(),
                });
            }
            buf.extend_from_slice(&payload);
        }
        Bytes::from(buf)
    } else {
        transport
            .send(0, tags::GATHER, Bytes::copy_from_slice(&value.to_le_bytes()))
            .await?;
        Bytes::new()
    };

    let packed = broadcast_bytes(transport, 0, packed).await?;
    if packed.len() != world as usize * 8 {
        return Err(CanopyError::SizeMismatch {
            expected: world as usize * 8,
            actual: packed.len(),
        });
    }
    Ok(packed
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().expect("chunk length fixed")))
        .collect())
}

fn decode_f64(payload: &[u8]) -> Result<f64> {
    if payload.len() != 8 {
        return Err(CanopyError::SizeMismatch {
            expected: 8,
            actual: payload.len(),
        });
    }
    Ok(f64::from_le_bytes(
        payload.try_into().expect("length checked above"),
    ))
}
