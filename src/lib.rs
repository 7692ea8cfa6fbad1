//! canopy — distributed, bit-reproducible floating-point summation.
//!
//! Given a global f64 array partitioned across ranks in arbitrary
//! contiguous regions, canopy computes a sum that depends only on the array
//! length and values: not on the rank count, not on the partitioning, not
//! on message timing. Every pairwise addition is pinned to a node of a
//! fixed binary reduction tree over global indices, so re-running at a
//! different parallelism level reproduces the result bit for bit.
//!
//! # Quick start
//!
//! ```no_run
//! use canopy::{CanopyConfig, DualTreeSummation, MemoryTransport, Region};
//! use std::sync::Arc;
//!
//! # async fn example() -> canopy::Result<()> {
//! // Two in-process ranks splitting a four-element array.
//! let mut cluster = MemoryTransport::cluster(2);
//! let transport = Arc::new(cluster.remove(0));
//! let regions = [Region::new(0, 2), Region::new(2, 2)];
//!
//! let mut summation =
//!     DualTreeSummation::new(transport, &regions, CanopyConfig::default()).await?;
//! summation.buffer_mut().copy_from_slice(&[1.0, 2.0]);
//! let sum = summation.accumulate().await?;
//! # let _ = sum;
//! # Ok(())
//! # }
//! ```

pub mod accumulate;
mod accumulate_simd;
pub mod binary_tree;
mod collective;
pub mod config;
pub mod dual_tree;
pub mod error;
pub mod io;
pub mod message_buffer;
pub mod partition;
pub mod topology;
pub mod transport;
pub mod tree;
pub mod types;

pub use binary_tree::BinaryTreeSummation;
pub use config::CanopyConfig;
pub use dual_tree::DualTreeSummation;
pub use error::{CanopyError, Result};
pub use message_buffer::MessageBuffer;
pub use partition::{Partitioning, Region};
pub use transport::{MemoryTransport, QuicTransport, Transport};
pub use types::{Rank, ReduceMode, TreeCoordinate};
