//! Coalescing asynchronous sender for fine-grained (index, value) traffic.
//!
//! The single-tree reducer ships many small partial sums to many peers. The
//! message buffer batches consecutive entries for the same target into one
//! message, dispatches sends without blocking the computation, and serves
//! point-to-point `get(index)` lookups out of an inbox keyed by global
//! index.
//!
//! The protocol invariant behind `get`: when `get(source, index)` runs,
//! either the value already sits in the inbox, or the source has strictly
//! finished computing it and delivers it within the next message. The
//! reduction schedule establishes this — a value is only requested once the
//! producing rank can no longer be waiting on us.

use crate::error::{CanopyError, Result};
use crate::transport::Transport;
use crate::types::{Rank, tags};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Bytes per wire entry: u64 global index + f64 value, little-endian.
pub const ENTRY_BYTES: usize = 16;

/// Coalescing sender/receiver for (global index, value) pairs.
pub struct MessageBuffer {
    transport: Arc<dyn Transport>,
    target: Option<Rank>,
    outbox: Vec<(u64, f64)>,
    pending: Vec<JoinHandle<Result<()>>>,
    inbox: HashMap<u64, f64>,
    max_message_length: usize,
    sent_messages: u64,
    sent_summands: u64,
}

impl MessageBuffer {
    pub fn new(transport: Arc<dyn Transport>, max_message_length: usize) -> Self {
        debug_assert!(max_message_length > 0);
        Self {
            transport,
            target: None,
            outbox: Vec::with_capacity(max_message_length),
            pending: Vec::new(),
            inbox: HashMap::new(),
            max_message_length,
            sent_messages: 0,
            sent_summands: 0,
        }
    }

    /// Queue one value for `target`. Switching targets or filling the
    /// outbox dispatches the batch.
    pub fn put(&mut self, target: Rank, index: u64, value: f64) {
        if self.outbox.len() >= self.max_message_length || self.target != Some(target) {
            self.flush();
        }
        if self.target.is_none() {
            self.target = Some(target);
        }
        self.outbox.push((index, value));
        self.sent_summands += 1;
        if self.outbox.len() == self.max_message_length {
            self.flush();
        }
    }

    /// Dispatch the outbox as one non-blocking send and clear it.
    pub fn flush(&mut self) {
        let Some(target) = self.target else { return };
        if self.outbox.is_empty() {
            return;
        }

        let entries = std::mem::replace(
            &mut self.outbox,
            Vec::with_capacity(self.max_message_length),
        );
        self.target = None;
        self.sent_messages += 1;

        let mut payload = Vec::with_capacity(entries.len() * ENTRY_BYTES);
        for (index, value) in &entries {
            payload.extend_from_slice(&index.to_le_bytes());
            payload.extend_from_slice(&value.to_le_bytes());
        }

        let transport = Arc::clone(&self.transport);
        self.pending.push(tokio::spawn(async move {
            transport
                .send(target, tags::MESSAGE_BUFFER, Bytes::from(payload))
                .await
        }));
    }

    /// Wait for every dispatched send to complete.
    pub async fn wait(&mut self) -> Result<()> {
        for handle in self.pending.drain(..) {
            handle
                .await
                .map_err(|e| CanopyError::transport_with_source("send task panicked", e))??;
        }
        Ok(())
    }

    /// Receive one message from `source` and file its entries in the inbox.
    pub async fn receive(&mut self, source: Rank) -> Result<()> {
        let payload = self.transport.recv(source, tags::MESSAGE_BUFFER).await?;
        if payload.len() % ENTRY_BYTES != 0 {
            return Err(CanopyError::DecodeFailed(format!(
                "message buffer payload of {} bytes is not a whole number of entries",
                payload.len()
            )));
        }
        for chunk in payload.chunks_exact(ENTRY_BYTES) {
            let index = u64::from_le_bytes(chunk[0..8].try_into().expect("chunk length fixed"));
            let value = f64::from_le_bytes(chunk[8..16].try_into().expect("chunk length fixed"));
            self.inbox.insert(index, value);
        }
        Ok(())
    }

    /// Fetch the value of global index `index` from `source`, consuming it.
    ///
    /// Flushes and drains our own sends before blocking, so nobody deadlocks
    /// waiting on results we still hold.
    pub async fn get(&mut self, source: Rank, index: u64) -> Result<f64> {
        if let Some(value) = self.inbox.remove(&index) {
            return Ok(value);
        }

        self.flush();
        self.wait().await?;
        self.receive(source).await?;

        self.inbox
            .remove(&index)
            .ok_or(CanopyError::MissingSummand {
                source_rank: source,
                index,
            })
    }

    /// (messages sent, summands sent) so far.
    pub fn stats(&self) -> (u64, u64) {
        (self.sent_messages, self.sent_summands)
    }
}
