//! Recoverable walker errors.
//!
//! Corruption of the stack or of code metadata is not reported here: those
//! conditions panic, because continuing would hand garbage to the collector.

use crate::address::{CodeAddr, StackAddr};
use thiserror::Error;

/// Errors raised by the code registry and by frame streams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalkError {
    /// A blob was installed over addresses already owned by another blob.
    #[error("code range [{start}, {end}) overlaps installed blob `{existing}`")]
    OverlappingCode {
        /// Start of the rejected range.
        start: CodeAddr,
        /// End of the rejected range.
        end: CodeAddr,
        /// Name of the blob already covering part of the range.
        existing: String,
    },

    /// A blob with no code was offered for installation.
    #[error("code blob `{0}` has an empty code range")]
    EmptyCodeRange(String),

    /// `commit` was called for a blob that is not pending.
    #[error("no pending code blob starts at {0}")]
    NotPending(CodeAddr),

    /// The thread has no last managed frame to start a walk from.
    #[error("thread {0} has no last managed frame")]
    NoLastFrame(u64),

    /// A frame stream exceeded its configured depth bound.
    #[error("stack walk exceeded {limit} frames")]
    DepthLimitExceeded {
        /// Configured bound.
        limit: usize,
    },

    /// A sender was not strictly older than its callee.
    #[error("sender unextended sp {sender} is not above callee unextended sp {callee}")]
    NonMonotonicStack {
        /// Callee frame identity.
        callee: StackAddr,
        /// Sender frame identity.
        sender: StackAddr,
    },
}
