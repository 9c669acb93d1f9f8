//! Collaborator contracts.
//!
//! The engine composes three externally-owned collaborators: the VM (block
//! production, verification, and storage), the consensus core (the metastable
//! voting state), and the validator sampler. All calls are synchronous and
//! must not suspend; re-entrancy on the same thread is allowed.

use snowline_types::{Bag, Block, BlockId, Status, ValidatorId};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the VM.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// The requested block is not in the VM's storage.
    ///
    /// This is an engine-level signal ("fetch from a peer"), never a fault.
    #[error("block not found")]
    NotFound,

    /// The bytes did not parse as a block.
    #[error("failed to parse block: {0}")]
    InvalidBlock(String),

    /// The VM failed internally. Fatal to the engine.
    #[error("vm failure: {0}")]
    Internal(String),
}

/// Errors surfaced by the consensus core. Always fatal to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// A block was added before its parent was issued.
    #[error("block {0} added before its parent")]
    ParentNotIssued(BlockId),

    /// The core failed internally.
    #[error("consensus failure: {0}")]
    Internal(String),
}

/// Errors surfaced by validator sampling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SampleError {
    /// Not enough stake is connected to fill a sample.
    #[error("insufficient validators: wanted {wanted}, have {available}")]
    InsufficientValidators { wanted: usize, available: usize },
}

/// A block decided by a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// The decided block.
    pub block_id: BlockId,
    /// [`Status::Accepted`] or [`Status::Rejected`].
    pub status: Status,
}

/// The block producer/verifier the engine drives.
pub trait Vm: Send + Sync {
    /// Parse a block from its serialized form.
    fn parse_block(&self, bytes: &[u8]) -> Result<Arc<dyn Block>, VmError>;

    /// Load a block from the VM's storage.
    fn get_block(&self, id: BlockId) -> Result<Arc<dyn Block>, VmError>;

    /// Build a new block on top of the preferred block.
    fn build_block(&self) -> Result<Arc<dyn Block>, VmError>;

    /// The ID of the last accepted block.
    fn last_accepted(&self) -> BlockId;

    /// Tell the VM which block the engine currently prefers, so it builds
    /// on top of it.
    fn set_preference(&self, id: BlockId);

    /// Release the VM's resources.
    fn shutdown(&self) -> Result<(), VmError>;
}

/// The metastable voting core the engine feeds.
///
/// The engine guarantees that [`Consensus::add`] is called on a block only
/// after its parent is issued or decided, and never twice for the same block.
pub trait Consensus: Send {
    /// Reset the core onto the last accepted block.
    fn initialize(&mut self, last_accepted: BlockId);

    /// Whether the block is in the core or already decided.
    fn is_issued(&self, block: &dyn Block) -> bool;

    /// Add a block to the core.
    ///
    /// Returns `true` if the core rejected the block immediately (its parent
    /// was already rejected, or a conflicting block is already accepted).
    fn add(&mut self, block: Arc<dyn Block>) -> Result<bool, ConsensusError>;

    /// The block the core currently prefers at the tip.
    fn preference(&self) -> BlockId;

    /// Apply a concluded poll's votes.
    ///
    /// Returns the blocks the poll decided, in decision order. The core has
    /// already called `accept`/`reject` on them; the caller is responsible
    /// for releasing its own references.
    fn record_poll(&mut self, votes: Bag<BlockId>) -> Result<Vec<Decision>, ConsensusError>;

    /// Whether every block ever added has been decided.
    fn finalized(&self) -> bool;
}

/// The validator set the engine samples query targets from.
pub trait Validators: Send + Sync {
    /// Sample `k` validators, weighted by stake.
    ///
    /// The sample is drawn with replacement: the same validator may appear
    /// more than once, and each appearance counts as one expected response.
    fn sample(&self, k: usize) -> Result<Vec<ValidatorId>, SampleError>;
}
