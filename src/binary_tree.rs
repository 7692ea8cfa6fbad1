//! Single-tree summation driver with on-demand value exchange.
//!
//! The simpler of the two reducers: every rank walks its rank-intersecting
//! summands — the greedy subtree roots of its region, whose parents always
//! live on earlier ranks — evaluates each one, and ships the value to the
//! owner of the parent through the coalescing [`MessageBuffer`]. A subtree
//! that straddles the local boundary is reconstructed by fetching the
//! missing right siblings, at their natural heights, from the later ranks
//! that own them.
//!
//! This driver leans on a timing assumption the operation-program driver
//! does not need: a rank only requests a value once its producer can no
//! longer be waiting on us, which holds because values flow strictly from
//! later to earlier ranks. [`crate::dual_tree::DualTreeSummation`] is the
//! primary driver; this one is kept as the low-setup alternative.

use crate::accumulate::LocalAccumulator;
use crate::collective;
use crate::config::CanopyConfig;
use crate::error::{CanopyError, Result};
use crate::message_buffer::MessageBuffer;
use crate::partition::{Partitioning, Region};
use crate::transport::Transport;
use crate::tree;
use crate::types::ReduceMode;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Handle for repeated reproducible summations, single-tree flavor.
pub struct BinaryTreeSummation {
    transport: Arc<dyn Transport>,
    config: CanopyConfig,
    partition: Partitioning,
    begin: u64,
    end: u64,
    /// Subtree roots whose parents live on earlier ranks, ascending.
    summands: Vec<u64>,
    buffer: Vec<f64>,
    accumulator: LocalAccumulator,
    message_buffer: MessageBuffer,
}

impl BinaryTreeSummation {
    /// Build the summation for this rank. Unlike the dual-tree driver no
    /// coordinate exchange is needed, so construction is local.
    pub fn new(
        transport: Arc<dyn Transport>,
        regions: &[Region],
        config: CanopyConfig,
    ) -> Result<Self> {
        if transport.world_size() as usize != regions.len() {
            return Err(CanopyError::WorldSizeMismatch {
                transport: transport.world_size(),
                regions: regions.len() as u32,
            });
        }

        let partition = Partitioning::new(regions)?;
        let region = partition.region_of(transport.rank());
        let is_root = partition.global_size() > 0
            && partition.array_position(transport.rank()) == 0;
        let summands = if is_root {
            Vec::new()
        } else {
            rank_intersecting_summands(region)
        };

        let message_buffer =
            MessageBuffer::new(Arc::clone(&transport), config.max_message_length);

        Ok(Self {
            transport,
            config,
            partition,
            begin: region.start,
            end: region.end(),
            summands,
            buffer: vec![0.0; region.size as usize],
            accumulator: LocalAccumulator::new(),
            message_buffer,
        })
    }

    pub fn buffer_mut(&mut self) -> &mut [f64] {
        &mut self.buffer
    }

    pub fn buffer(&self) -> &[f64] {
        &self.buffer
    }

    pub fn store_summand(&mut self, local_index: u64, value: f64) {
        self.buffer[local_index as usize] = value;
    }

    pub fn local_size(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn global_size(&self) -> u64 {
        self.partition.global_size()
    }

    /// Subtree roots this rank ships out, ascending by global index.
    pub fn rank_intersecting(&self) -> &[u64] {
        &self.summands
    }

    /// Run one reduction. Returns the global sum on the root; other ranks
    /// return the broadcast value, or 0.0 under `ReduceMode::ReduceOnly`.
    pub async fn accumulate(&mut self) -> Result<f64> {
        let n = self.partition.global_size();
        if n == 0 {
            return Ok(0.0);
        }

        for i in 0..self.summands.len() {
            let summand = self.summands[i];
            if tree::subtree_size(summand) > self.config.flush_threshold {
                // About to do considerable work: push queued values out so
                // nobody stalls waiting on them.
                self.message_buffer.flush();
            }

            let height = tree::level(summand, n);
            let value = self.node_value(summand, height).await?;

            let dest_pos = self.partition.owner_of(tree::parent(summand));
            let dest = self.partition.physical_rank(dest_pos);
            self.message_buffer.put(dest, summand, value);
        }
        self.message_buffer.flush();
        self.message_buffer.wait().await?;

        let is_root = self.partition.array_position(self.transport.rank()) == 0;
        let result = if is_root {
            self.node_value(0, tree::ceil_log2(n)).await?
        } else {
            0.0
        };

        let (messages, summands) = self.message_buffer.stats();
        tracing::debug!(
            rank = self.transport.rank(),
            messages,
            summands,
            "single-tree reduction complete"
        );

        match self.config.reduce_mode {
            ReduceMode::ReduceBroadcast => {
                let root_rank = self.partition.physical_rank(0);
                collective::broadcast_f64(&self.transport, root_rank, result).await
            }
            ReduceMode::ReduceOnly => Ok(result),
        }
    }

    /// Value of the subtree rooted at `x` with height `height`.
    ///
    /// Fully local spans go through the vectorized accumulator; a span
    /// crossing our right boundary splits along the tree, and a subtree
    /// that starts beyond it is fetched whole from its owner. Splitting
    /// only ever descends on the left, so remote roots are always right
    /// children at their natural height — exactly the summands their owner
    /// ships.
    fn node_value(&mut self, x: u64, height: u32) -> BoxFuture<'_, Result<f64>> {
        Box::pin(async move {
            let n = self.partition.global_size();
            let span_end = tree::span_end(x, height, n);

            if x >= self.end {
                let owner = self.partition.physical_rank(self.partition.owner_of(x));
                return self.message_buffer.get(owner, x).await;
            }
            if span_end <= self.end {
                let lo = (x - self.begin) as usize;
                let hi = (span_end - self.begin) as usize;
                return Ok(self.accumulator.reduce(&self.buffer[lo..hi]));
            }

            let mid = x + (1u64 << (height - 1));
            if mid >= span_end {
                return self.node_value(x, height - 1).await;
            }
            let left = self.node_value(x, height - 1).await?;
            let right = self.node_value(mid, height - 1).await?;
            Ok(left + right)
        })
    }
}

/// Greedy walk over the region at natural subtree sizes. Every root's
/// parent clears a bit below `begin`, so each value leaves this rank.
fn rank_intersecting_summands(region: Region) -> Vec<u64> {
    let mut summands = Vec::new();
    let mut x = region.start;
    while x < region.end() {
        debug_assert!(tree::parent(x) < region.start);
        summands.push(x);
        x += tree::subtree_size(x);
    }
    summands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::tree::reference_sum;

    #[test]
    fn test_rank_intersecting_summands() {
        assert_eq!(
            rank_intersecting_summands(Region::new(5, 4)),
            vec![5, 6, 8]
        );
        assert_eq!(rank_intersecting_summands(Region::new(4, 4)), vec![4]);
        assert_eq!(rank_intersecting_summands(Region::new(4, 0)), Vec::<u64>::new());
    }

    #[tokio::test]
    async fn test_single_rank_matches_reference() {
        let values: Vec<f64> = (0..13).map(|i| 1.0 / (i + 1) as f64).collect();
        let mut cluster = MemoryTransport::cluster(1);
        let transport = Arc::new(cluster.pop().unwrap()) as Arc<dyn Transport>;

        let mut summation = BinaryTreeSummation::new(
            transport,
            &[Region::new(0, values.len() as u64)],
            CanopyConfig::default(),
        )
        .unwrap();
        summation.buffer_mut().copy_from_slice(&values);

        let sum = summation.accumulate().await.unwrap();
        assert_eq!(sum.to_bits(), reference_sum(&values).to_bits());
    }

    #[tokio::test]
    async fn test_two_ranks_straddling_boundary() {
        // Region split at 3 cuts through the (2,1) and (0,2) subtrees.
        let values: Vec<f64> = vec![1e3, f64::EPSILON, f64::EPSILON / 2.0, f64::EPSILON / 2.0, 7.0];
        let expected = reference_sum(&values);

        let transports: Vec<Arc<dyn Transport>> = MemoryTransport::cluster(2)
            .into_iter()
            .map(|t| Arc::new(t) as Arc<dyn Transport>)
            .collect();
        let regions = [Region::new(0, 3), Region::new(3, 2)];

        let mut handles = Vec::new();
        for transport in transports {
            let rank = transport.rank() as usize;
            let regions = regions.to_vec();
            let local: Vec<f64> = values
                [regions[rank].start as usize..regions[rank].end() as usize]
                .to_vec();
            handles.push(tokio::spawn(async move {
                let mut summation =
                    BinaryTreeSummation::new(transport, &regions, CanopyConfig::default())
                        .unwrap();
                summation.buffer_mut().copy_from_slice(&local);
                summation.accumulate().await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().to_bits(), expected.to_bits());
        }
    }
}
