//! Error types.
//!
//! Creation-time problems are fatal: the node never exists and everything
//! allocated so far has been released by the time the error is returned.
//! Runtime problems (a bad parameter update, a denied move) leave the node in
//! its previous good state.

/// Why a block-size combination was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BlockSizeError {
    /// One of the sizes (or overlap plus the minimum block) does not fit in a device block.
    #[error("block size {frames} frames exceeds the device maximum of {max} frames")]
    ExceedsMaximum { frames: usize, max: usize },

    /// A nonzero fixed size is below the minimum block floor.
    #[error("block size {frames} frames is below the minimum of {min} frames")]
    TooSmall { frames: usize, min: usize },

    /// Fixed output block plus overlap history does not fit in a device block.
    #[error("output block {output} + overlap {overlap} frames exceeds the device maximum of {max} frames")]
    SumExceedsMaximum { output: usize, overlap: usize, max: usize },

    /// The fixed output block is larger than the fixed input block.
    #[error("output block {output} frames is larger than input block {input} frames")]
    OutputExceedsInput { output: usize, input: usize },

    /// The filter variant cannot carry this combination (e.g. overlap on a plain copy).
    #[error("block sizes not supported by the {filter} filter")]
    UnsupportedByFilter { filter: &'static str },
}

/// Why a move to a new master was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MoveDeniedReason {
    #[error("source was autoloaded")]
    Autoloaded,

    #[error("destination is the source itself")]
    SelfTarget,

    #[error("destination resolves to the monitor of our own uplink sink")]
    UplinkLoop,
}

/// Errors surfaced by node creation and control operations.
#[derive(Debug, thiserror::Error)]
pub enum VsourceError {
    /// Rate mismatch, contradictory flags, malformed channel maps.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid block sizes: {0}")]
    InvalidBlockSize(#[from] BlockSizeError),

    /// An endpoint, attachment or queue could not be allocated.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("move denied: {0}")]
    MoveDenied(#[from] MoveDeniedReason),

    /// The master went away underneath the node.
    #[error("upstream attachment lost")]
    AttachmentLost,
}

impl VsourceError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }
}

/// Errors from the accumulation queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue overflow: {queued} + {pushed} bytes exceeds maximum length {max}")]
    Overflow { queued: usize, pushed: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_error_converts() {
        let err: VsourceError = BlockSizeError::TooSmall { frames: 8, min: 16 }.into();
        assert!(matches!(err, VsourceError::InvalidBlockSize(BlockSizeError::TooSmall { .. })));
        assert_eq!(
            err.to_string(),
            "invalid block sizes: block size 8 frames is below the minimum of 16 frames"
        );
    }

    #[test]
    fn move_denied_display() {
        let err: VsourceError = MoveDeniedReason::Autoloaded.into();
        assert_eq!(err.to_string(), "move denied: source was autoloaded");
    }
}
