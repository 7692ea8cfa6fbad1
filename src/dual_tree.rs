//! Operation-program summation driver.
//!
//! `DualTreeSummation` computes the globally reproducible sum with one
//! message per comm edge and per reduction: every process evaluates its
//! fully-owned subtrees, folds in the partial sums its comm-children ship
//! up, and forwards the surviving values to its comm-parent in a single
//! TRANSFER message. Which additions happen where is frozen at construction
//! into a postfix operation program, so the pairing — and therefore every
//! bit of the result — depends only on the array length and values.
//!
//! Per reduction the driver:
//! 1. posts one receive per comm-child, sized by the child's announced
//!    coordinate count,
//! 2. reduces each local subtree root into the inbox,
//! 3. runs the operation program on a LIFO stack, waiting on the next
//!    outstanding receive only when a PUSH outruns the confirmed values,
//! 4. sends the stack to the comm-parent (ascending by global index),
//! 5. on the root, reads the result off the stack and distributes it
//!    according to the configured reduce mode.

use crate::accumulate::LocalAccumulator;
use crate::collective;
use crate::config::CanopyConfig;
use crate::error::{CanopyError, Result};
use crate::partition::{Partitioning, Region};
use crate::topology::{DualTreeTopology, Operation, OperationProgram};
use crate::transport::Transport;
use crate::types::{Rank, ReduceMode, TreeCoordinate, tags};
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Handle for repeated reproducible summations over a fixed partitioning.
///
/// Construction is collective: every rank of the transport must construct
/// its summation concurrently, since the comm-children announce their
/// outgoing coordinates during setup. The topology, operation program and
/// inbox capacity are immutable afterwards; `accumulate` only mutates the
/// inbox and the evaluation stack.
pub struct DualTreeSummation {
    transport: Arc<dyn Transport>,
    config: CanopyConfig,
    partition: Partitioning,
    topology: DualTreeTopology,
    program: OperationProgram,
    /// f64 values expected from each comm-child, in child order.
    incoming_counts: Vec<usize>,
    /// Physical rank of the comm-parent, if any.
    comm_parent_rank: Option<Rank>,
    buffer: Vec<f64>,
    accumulator: LocalAccumulator,
    inbox: Vec<f64>,
    stack: Vec<f64>,
    reduction_counter: u64,
}

impl DualTreeSummation {
    /// Build the summation for this rank. `regions[r]` is the (start, size)
    /// assigned to physical rank `r`; together they must tile the global
    /// array exactly.
    pub async fn new(
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
        let array_rank = partition.array_position(transport.rank());
        let topology = DualTreeTopology::new(
            array_rank,
            partition.permuted_regions(),
            partition.global_size(),
        )?;

        let (incoming_coords, incoming_counts) =
            exchange_coordinates(&transport, &partition, &topology).await?;

        // The inbox is drained front to back, locals first, then each
        // child's block. That only works if the concatenation is already
        // ascending by global index; the comm-children ordering guarantees
        // it, so a violation means a peer is off-schedule.
        let consumption_order: Vec<u64> = topology
            .local_coords()
            .iter()
            .chain(incoming_coords.iter())
            .map(|c| c.index)
            .collect();
        if !consumption_order.windows(2).all(|w| w[0] < w[1]) {
            return Err(CanopyError::DecodeFailed(
                "announced coordinates are not ascending in inbox order".into(),
            ));
        }

        let program = topology.compute_operations(&incoming_coords)?;

        let comm_parent_rank = topology
            .comm_parent()
            .map(|pos| partition.physical_rank(pos));
        let local_size = partition.region_of(transport.rank()).size as usize;
        let inbox_len = program.local_coords.len() + incoming_coords.len();
        let stack = Vec::with_capacity(program.max_stack_size());

        tracing::debug!(
            rank = transport.rank(),
            array_rank,
            region = ?topology.local_region(),
            outgoing = ?topology.outgoing(),
            children = ?topology.comm_children(),
            inbox = inbox_len,
            stack = stack.capacity(),
            "dual-tree topology ready"
        );

        Ok(Self {
            transport,
            config,
            partition,
            topology,
            program,
            incoming_counts,
            comm_parent_rank,
            buffer: vec![0.0; local_size],
            accumulator: LocalAccumulator::new(),
            inbox: vec![0.0; inbox_len],
            stack,
            reduction_counter: 0,
        })
    }

    /// Build regions by all-gathering each rank's local element count; the
    /// global array is laid out in rank order.
    pub async fn from_local_size(
        transport: Arc<dyn Transport>,
        local_size: u64,
        config: CanopyConfig,
    ) -> Result<Self> {
        let counts = collective::allgather_u64(&transport, local_size).await?;
        let mut regions = Vec::with_capacity(counts.len());
        let mut start = 0u64;
        for &count in &counts {
            regions.push(Region::new(start, count));
            start += count;
        }
        Self::new(transport, &regions, config).await
    }

    /// The local accumulation buffer; the caller writes its summands at
    /// offsets `0..local_size`.
    pub fn buffer_mut(&mut self) -> &mut [f64] {
        &mut self.buffer
    }

    pub fn buffer(&self) -> &[f64] {
        &self.buffer
    }

    /// Store one summand at a local offset.
    pub fn store_summand(&mut self, local_index: u64, value: f64) {
        self.buffer[local_index as usize] = value;
    }

    pub fn local_size(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn global_size(&self) -> u64 {
        self.partition.global_size()
    }

    /// Whether this rank produces the final result.
    pub fn is_root(&self) -> bool {
        self.topology.is_root()
    }

    /// The derived communication topology (immutable after construction).
    pub fn topology(&self) -> &DualTreeTopology {
        &self.topology
    }

    /// Number of reductions performed on this handle.
    pub fn reduction_count(&self) -> u64 {
        self.reduction_counter
    }

    /// Run one reduction. Returns the global sum on the root; other ranks
    /// return the broadcast value, or 0.0 under `ReduceMode::ReduceOnly`.
    pub async fn accumulate(&mut self) -> Result<f64> {
        if self.partition.global_size() == 0 {
            return Ok(0.0);
        }
        self.reduction_counter += 1;

        // 1. Post the receives before any local work, so child transfers
        // overlap with our own subtree evaluation.
        let mut requests: Vec<JoinHandle<Result<Bytes>>> =
            Vec::with_capacity(self.topology.comm_children().len());
        for &child in self.topology.comm_children() {
            let child_rank = self.partition.physical_rank(child);
            let transport = Arc::clone(&self.transport);
            requests.push(tokio::spawn(async move {
                transport.recv(child_rank, tags::TRANSFER).await
            }));
        }

        // 2. Fully local subtrees, in the order the program consumes them.
        let begin = self.topology.local_region().start;
        let n = self.partition.global_size();
        for i in 0..self.program.local_coords.len() {
            let coord = self.program.local_coords[i];
            let lo = (coord.index - begin) as usize;
            let hi = (coord.span_end(n) - begin) as usize;
            self.inbox[i] = self.accumulator.reduce(&self.buffer[lo..hi]);
        }

        // 3. Assemble everything per the operation program.
        self.execute_operations(requests).await?;

        // 4. One blocking send carries the whole stack upward.
        if let Some(parent_rank) = self.comm_parent_rank {
            let mut payload = Vec::with_capacity(self.stack.len() * 8);
            for value in &self.stack {
                payload.extend_from_slice(&value.to_le_bytes());
            }
            self.transport
                .send(parent_rank, tags::TRANSFER, Bytes::from(payload))
                .await?;
        }

        // 5. The root holds the result; distribute per config.
        let result = if self.topology.is_root() {
            self.stack[0]
        } else {
            0.0
        };
        match self.config.reduce_mode {
            ReduceMode::ReduceBroadcast => {
                let root_rank = self.partition.physical_rank(0);
                collective::broadcast_f64(&self.transport, root_rank, result).await
            }
            ReduceMode::ReduceOnly => Ok(result),
        }
    }

    /// Run the postfix program: PUSH consumes the inbox front to back,
    /// REDUCE folds the two topmost stack entries. A PUSH beyond the
    /// confirmed range first waits on the next outstanding child receive.
    async fn execute_operations(&mut self, requests: Vec<JoinHandle<Result<Bytes>>>) -> Result<()> {
        self.stack.clear();

        let posted = requests.len();
        let mut request_iter = requests.into_iter();
        let mut inbox_index = 0usize;
        let mut next_pending = self.program.local_coords.len();
        let mut request_index = 0usize;

        for (position, op) in self.program.ops.iter().enumerate() {
            match op {
                Operation::Push => {
                    if inbox_index >= next_pending {
                        let handle =
                            request_iter
                                .next()
                                .ok_or(CanopyError::ReceiveCountMismatch {
                                    consumed: request_index + 1,
                                    posted,
                                })?;
                        let payload = handle.await.map_err(|e| {
                            CanopyError::transport_with_source("receive task panicked", e)
                        })??;

                        let count = self.incoming_counts[request_index];
                        if payload.len() != count * 8 {
                            return Err(CanopyError::SizeMismatch {
                                expected: count * 8,
                                actual: payload.len(),
                            });
                        }
                        for (offset, chunk) in payload.chunks_exact(8).enumerate() {
                            self.inbox[next_pending + offset] = f64::from_le_bytes(
                                chunk.try_into().expect("chunk length fixed"),
                            );
                        }
                        next_pending += count;
                        request_index += 1;
                    }
                    self.stack.push(self.inbox[inbox_index]);
                    inbox_index += 1;
                }
                Operation::Reduce => {
                    let b = self
                        .stack
                        .pop()
                        .ok_or(CanopyError::StackUnderflow { position })?;
                    let a = self
                        .stack
                        .pop()
                        .ok_or(CanopyError::StackUnderflow { position })?;
                    self.stack.push(a + b);
                }
            }
        }

        if request_index != posted {
            return Err(CanopyError::ReceiveCountMismatch {
                consumed: request_index,
                posted,
            });
        }
        if self.stack.len() != self.topology.outgoing().len() {
            return Err(CanopyError::OutgoingMismatch {
                expected: self.topology.outgoing().len(),
                actual: self.stack.len(),
            });
        }
        Ok(())
    }
}

/// Coordinate exchange: collect each comm-child's announcement
/// (count, then packed coordinates), then announce our own outgoing set to
/// the comm-parent. Children sit later in array order, so receiving before
/// sending cascades without deadlock.
async fn exchange_coordinates(
    transport: &Arc<dyn Transport>,
    partition: &Partitioning,
    topology: &DualTreeTopology,
) -> Result<(Vec<TreeCoordinate>, Vec<usize>)> {
    let mut incoming_coords = Vec::new();
    let mut incoming_counts = Vec::with_capacity(topology.comm_children().len());

    for &child in topology.comm_children() {
        let child_rank = partition.physical_rank(child);

        let count_msg = transport.recv(child_rank, tags::OUTGOING_SIZE).await?;
        if count_msg.len() != 8 {
            return Err(CanopyError::SizeMismatch {
                expected: 8,
                actual: count_msg.len(),
            });
        }
        let count =
            u64::from_le_bytes(count_msg[..].try_into().expect("length checked above")) as usize;

        let coords_msg = transport.recv(child_rank, tags::OUTGOING).await?;
        if coords_msg.len() != count * TreeCoordinate::WIRE_BYTES {
            return Err(CanopyError::SizeMismatch {
                expected: count * TreeCoordinate::WIRE_BYTES,
                actual: coords_msg.len(),
            });
        }
        for chunk in coords_msg.chunks_exact(TreeCoordinate::WIRE_BYTES) {
            incoming_coords.push(TreeCoordinate::decode(chunk)?);
        }
        incoming_counts.push(count);
    }

    if let Some(parent) = topology.comm_parent() {
        let parent_rank = partition.physical_rank(parent);
        let outgoing = topology.outgoing();

        transport
            .send(
                parent_rank,
                tags::OUTGOING_SIZE,
                Bytes::copy_from_slice(&(outgoing.len() as u64).to_le_bytes()),
            )
            .await?;

        let mut packed = Vec::with_capacity(outgoing.len() * TreeCoordinate::WIRE_BYTES);
        for coord in outgoing {
            coord.encode_into(&mut packed);
        }
        transport
            .send(parent_rank, tags::OUTGOING, Bytes::from(packed))
            .await?;
    }

    Ok((incoming_coords, incoming_counts))
}
