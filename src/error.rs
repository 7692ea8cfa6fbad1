use crate::types::Rank;

pub type Result<T> = std::result::Result<T, CanopyError>;

#[derive(Debug, thiserror::Error)]
pub enum CanopyError {
    #[error("regions leave a gap before global index {at} (rank {rank})")]
    RegionGap { rank: Rank, at: u64 },

    #[error("region of rank {rank} overlaps earlier regions at global index {at}")]
    RegionOverlap { rank: Rank, at: u64 },

    #[error("no rank owns global index 0; every region is empty")]
    NoLeadingRegion,

    #[error("tree height {height} at index {index} overflows the coordinate format")]
    HeightOverflow { index: u64, height: u32 },

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("world size {transport} of the transport does not match {regions} regions")]
    WorldSizeMismatch { transport: u32, regions: u32 },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("peer {rank} disconnected unexpectedly")]
    PeerDisconnected { rank: Rank },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("message size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error(
        "summand {index} not delivered by rank {source_rank}; the sender has not \
         finished the computations this schedule depends on"
    )]
    MissingSummand { source_rank: Rank, index: u64 },

    #[error("operation program popped an empty stack at token {position}")]
    StackUnderflow { position: usize },

    #[error(
        "operation program consumed {consumed} of {posted} posted receives; \
         the topology and the incoming schedule disagree"
    )]
    ReceiveCountMismatch { consumed: usize, posted: usize },

    #[error(
        "operation program left {actual} values on the stack, expected {expected} \
         outgoing values"
    )]
    OutgoingMismatch { expected: usize, actual: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path}:{line}: cannot parse summand: {reason}")]
    Parse {
        path: String,
        line: usize,
        reason: String,
    },
}

impl CanopyError {
    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }
}
