//! Block status.

use std::fmt;

/// The lifecycle status of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The block's bytes are not known locally.
    Unknown,
    /// The block is known locally but consensus has not decided it.
    Processing,
    /// Consensus accepted the block.
    Accepted,
    /// Consensus rejected the block.
    Rejected,
}

impl Status {
    /// Whether the block's bytes are known locally.
    pub fn is_fetched(&self) -> bool {
        matches!(
            self,
            Status::Processing | Status::Accepted | Status::Rejected
        )
    }

    /// Whether consensus has decided the block.
    pub fn is_decided(&self) -> bool {
        matches!(self, Status::Accepted | Status::Rejected)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Unknown => "unknown",
            Status::Processing => "processing",
            Status::Accepted => "accepted",
            Status::Rejected => "rejected",
        };
        f.write_str(s)
    }
}
