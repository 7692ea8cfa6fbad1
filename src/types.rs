/// Rank of a participant in the communicator group (0-indexed, physical).
pub type Rank = u32;

/// Message tag carried on every point-to-point transfer.
pub type Tag = u64;

/// Reserved message tags.
///
/// The three protocol tags match the wire protocol of the summation kernel;
/// the remaining values are internal to the transport helpers. All of them
/// live in one range so they cannot collide with each other.
pub mod tags {
    use super::Tag;

    /// One u64: number of tree coordinates the sender is about to ship.
    pub const OUTGOING_SIZE: Tag = 20232;
    /// Packed array of (u64 index, u32 height) pairs, little-endian.
    pub const OUTGOING: Tag = 20233;
    /// Packed array of f64 partial sums in ascending global-index order.
    pub const TRANSFER: Tag = 20234;
    /// Coalesced (index, value) entries of the message buffer.
    pub const MESSAGE_BUFFER: Tag = 20235;
    /// Tree broadcast of the final result.
    pub const BROADCAST: Tag = 20236;
    /// Gather leg of the single-integer allgather.
    pub const GATHER: Tag = 20237;
}

/// Identifies the subtree of the global reduction tree rooted at `index`
/// with height `height`: it covers global indices
/// `[index, min(index + 2^height, n))`.
///
/// `index` must be divisible by `2^height`. Interior nodes of the tree carry
/// the sum of their subtree; a coordinate names that partial sum on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreeCoordinate {
    pub index: u64,
    pub height: u32,
}

impl TreeCoordinate {
    /// Encoded size on the wire: u64 index + u32 height, little-endian.
    pub const WIRE_BYTES: usize = 12;

    pub const fn new(index: u64, height: u32) -> Self {
        Self { index, height }
    }

    /// One past the last global index this subtree covers, clipped to `n`.
    pub fn span_end(&self, n: u64) -> u64 {
        crate::tree::span_end(self.index, self.height, n)
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
    }

    /// Decode one coordinate from a 12-byte little-endian record.
    pub fn decode(bytes: &[u8]) -> crate::error::Result<Self> {
        if bytes.len() < Self::WIRE_BYTES {
            return Err(crate::error::CanopyError::DecodeFailed(format!(
                "tree coordinate needs {} bytes, got {}",
                Self::WIRE_BYTES,
                bytes.len()
            )));
        }
        let index = u64::from_le_bytes(bytes[0..8].try_into().expect("slice length checked"));
        let height = u32::from_le_bytes(bytes[8..12].try_into().expect("slice length checked"));
        if height >= 64 {
            return Err(crate::error::CanopyError::HeightOverflow { index, height });
        }
        Ok(Self { index, height })
    }
}

impl std::fmt::Display for TreeCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.index, self.height)
    }
}

/// How the final sum is distributed after the reduction.
///
/// A plain all-reduce mode is not offered: it cannot keep the result
/// bit-identical across different process counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReduceMode {
    /// Reduce to the root, then broadcast the result to every rank.
    #[default]
    ReduceBroadcast,
    /// Reduce to the root only; other ranks return 0.0.
    ReduceOnly,
}

impl std::fmt::Display for ReduceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceMode::ReduceBroadcast => f.write_str("reduce+bcast"),
            ReduceMode::ReduceOnly => f.write_str("reduce"),
        }
    }
}
