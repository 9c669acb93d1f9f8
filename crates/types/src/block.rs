//! The block contract between the engine and the VM.

use crate::{BlockId, Status};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by block operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// The block's bytes were never fetched; no operation is possible.
    #[error("missing block")]
    Missing,

    /// The block failed verification against its parent's state.
    #[error("block verification failed: {0}")]
    Verification(String),

    /// The VM could not apply the status transition.
    #[error("block state transition failed: {0}")]
    Transition(String),
}

/// A block in the chain, as produced or parsed by the VM.
///
/// Blocks are shared between the engine and the consensus core as
/// `Arc<dyn Block>`; status transitions therefore go through `&self` and
/// implementations use interior mutability.
///
/// `options` is the oracle capability: a block that bifurcates the chain
/// returns its two child options, which are delivered to consensus together
/// with the oracle itself. Ordinary blocks return `None` (the default).
pub trait Block: Send + Sync {
    /// This block's ID.
    fn id(&self) -> BlockId;

    /// The ID of this block's parent.
    fn parent(&self) -> BlockId;

    /// This block's height. The genesis block has height 0.
    fn height(&self) -> u64;

    /// The serialized form of this block.
    fn bytes(&self) -> &[u8];

    /// The current status of this block.
    fn status(&self) -> Status;

    /// Check that this block is valid to be added on top of its parent.
    fn verify(&self) -> Result<(), BlockError>;

    /// Mark this block as accepted. Called by the consensus core.
    fn accept(&self) -> Result<(), BlockError>;

    /// Mark this block as rejected. Called by the consensus core.
    fn reject(&self) -> Result<(), BlockError>;

    /// The two child options of an oracle block, if this block is one.
    fn options(&self) -> Option<[Arc<dyn Block>; 2]> {
        None
    }
}

/// A placeholder for a block whose bytes could not be found.
///
/// The ancestry walk uses this sentinel to terminate with a typed value:
/// its status is [`Status::Unknown`] and every mutating operation fails.
/// It is never handed to consensus.
#[derive(Debug, Clone)]
pub struct MissingBlock {
    id: BlockId,
}

impl MissingBlock {
    /// Create a sentinel for the given ID.
    pub fn new(id: BlockId) -> Self {
        MissingBlock { id }
    }
}

impl Block for MissingBlock {
    fn id(&self) -> BlockId {
        self.id
    }

    fn parent(&self) -> BlockId {
        BlockId::ZERO
    }

    fn height(&self) -> u64 {
        0
    }

    fn bytes(&self) -> &[u8] {
        &[]
    }

    fn status(&self) -> Status {
        Status::Unknown
    }

    fn verify(&self) -> Result<(), BlockError> {
        Err(BlockError::Missing)
    }

    fn accept(&self) -> Result<(), BlockError> {
        Err(BlockError::Missing)
    }

    fn reject(&self) -> Result<(), BlockError> {
        Err(BlockError::Missing)
    }
}
