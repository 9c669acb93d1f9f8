//! Deterministic in-memory collaborators for engine tests.

use crate::{Consensus, ConsensusError, Decision, SampleError, Validators, Vm, VmError};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use snowline_types::{Bag, Block, BlockId, Status, ValidatorId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// An in-memory VM backed by a block table.
///
/// Blocks registered with [`MockVm::insert_block`] are returned by both
/// `get_block` (by ID) and `parse_block` (by bytes). `build_block` pops from
/// a queue of pre-built blocks.
#[derive(Default)]
pub struct MockVm {
    inner: Mutex<MockVmInner>,
}

#[derive(Default)]
struct MockVmInner {
    blocks: HashMap<BlockId, Arc<dyn Block>>,
    parseable: HashMap<Vec<u8>, Arc<dyn Block>>,
    build_queue: VecDeque<Arc<dyn Block>>,
    last_accepted: BlockId,
    preference: Option<BlockId>,
    shutdown: bool,
}

impl MockVm {
    /// Create an empty VM.
    pub fn new() -> Self {
        MockVm::default()
    }

    /// Register a block so it can be fetched by ID and parsed from its bytes.
    pub fn insert_block(&self, block: Arc<dyn Block>) {
        let mut inner = self.inner.lock().unwrap();
        inner.parseable.insert(block.bytes().to_vec(), Arc::clone(&block));
        inner.blocks.insert(block.id(), block);
    }

    /// Register a block for parsing only; `get_block` will not find it.
    ///
    /// This models a block a peer holds but we never persisted.
    pub fn insert_parseable(&self, block: Arc<dyn Block>) {
        let mut inner = self.inner.lock().unwrap();
        inner.parseable.insert(block.bytes().to_vec(), block);
    }

    /// Drop a block from storage (it stays parseable).
    pub fn remove_block(&self, id: &BlockId) {
        self.inner.lock().unwrap().blocks.remove(id);
    }

    /// Queue a block for the next `build_block` call.
    pub fn queue_build(&self, block: Arc<dyn Block>) {
        self.inner.lock().unwrap().build_queue.push_back(block);
    }

    /// Set the last accepted block ID.
    pub fn set_last_accepted(&self, id: BlockId) {
        self.inner.lock().unwrap().last_accepted = id;
    }

    /// The preference most recently set by the engine.
    pub fn preference(&self) -> Option<BlockId> {
        self.inner.lock().unwrap().preference
    }

    /// Whether `shutdown` was called.
    pub fn shutdown_called(&self) -> bool {
        self.inner.lock().unwrap().shutdown
    }
}

impl Vm for MockVm {
    fn parse_block(&self, bytes: &[u8]) -> Result<Arc<dyn Block>, VmError> {
        self.inner
            .lock()
            .unwrap()
            .parseable
            .get(bytes)
            .cloned()
            .ok_or_else(|| VmError::InvalidBlock("unrecognized bytes".to_string()))
    }

    fn get_block(&self, id: BlockId) -> Result<Arc<dyn Block>, VmError> {
        self.inner
            .lock()
            .unwrap()
            .blocks
            .get(&id)
            .cloned()
            .ok_or(VmError::NotFound)
    }

    fn build_block(&self) -> Result<Arc<dyn Block>, VmError> {
        self.inner
            .lock()
            .unwrap()
            .build_queue
            .pop_front()
            .ok_or_else(|| VmError::Internal("nothing to build".to_string()))
    }

    fn last_accepted(&self) -> BlockId {
        self.inner.lock().unwrap().last_accepted
    }

    fn set_preference(&self, id: BlockId) {
        self.inner.lock().unwrap().preference = Some(id);
    }

    fn shutdown(&self) -> Result<(), VmError> {
        self.inner.lock().unwrap().shutdown = true;
        Ok(())
    }
}

/// A consensus core that decides a block as soon as one poll reaches an
/// α-majority for it.
///
/// Accepting a block accepts its undecided ancestors first and rejects every
/// undecided block that conflicts with the accepted chain. This is decisive
/// enough to drive the engine through full accept/reject transitions without
/// modelling confidence counters.
pub struct MockConsensus {
    alpha: usize,
    preference: BlockId,
    issued: HashSet<BlockId>,
    blocks: HashMap<BlockId, Arc<dyn Block>>,
    reject_on_add: HashSet<BlockId>,
    fail_next_add: Option<String>,
}

impl MockConsensus {
    /// Create a core with the given quorum threshold.
    pub fn new(alpha: usize) -> Self {
        MockConsensus {
            alpha,
            preference: BlockId::ZERO,
            issued: HashSet::new(),
            blocks: HashMap::new(),
            reject_on_add: HashSet::new(),
            fail_next_add: None,
        }
    }

    /// Script `add` to immediately reject the given block.
    pub fn reject_on_add(&mut self, id: BlockId) {
        self.reject_on_add.insert(id);
    }

    /// Script the next `add` to fail with an internal error.
    pub fn fail_next_add(&mut self, message: &str) {
        self.fail_next_add = Some(message.to_string());
    }

    /// Number of undecided blocks in the core.
    pub fn num_undecided(&self) -> usize {
        self.blocks.len()
    }

    fn accept_chain(&mut self, winner: BlockId) -> Vec<Decision> {
        // Collect the undecided path ending at the winner, parent first.
        let mut path = Vec::new();
        let mut cursor = winner;
        while let Some(block) = self.blocks.get(&cursor) {
            path.push(cursor);
            cursor = block.parent();
        }
        path.reverse();

        let mut decisions = Vec::new();
        let mut tip_height = 0;
        for id in &path {
            if let Some(block) = self.blocks.remove(id) {
                block
                    .accept()
                    .expect("mock consensus accepted an undecidable block");
                tip_height = block.height();
                decisions.push(Decision {
                    block_id: *id,
                    status: Status::Accepted,
                });
            }
        }

        // Everything left at or below the accepted tip conflicts with the
        // accepted chain; reject it, then cascade to orphaned descendants.
        loop {
            let doomed: Vec<BlockId> = self
                .blocks
                .values()
                .filter(|b| {
                    b.height() <= tip_height
                        || decisions.iter().any(|d| {
                            d.block_id == b.parent() && d.status == Status::Rejected
                        })
                })
                .map(|b| b.id())
                .collect();
            if doomed.is_empty() {
                break;
            }
            for id in doomed {
                if let Some(block) = self.blocks.remove(&id) {
                    block
                        .reject()
                        .expect("mock consensus rejected an undecidable block");
                    decisions.push(Decision {
                        block_id: id,
                        status: Status::Rejected,
                    });
                }
            }
        }

        self.preference = winner;
        decisions
    }
}

impl Consensus for MockConsensus {
    fn initialize(&mut self, last_accepted: BlockId) {
        self.preference = last_accepted;
        self.issued.insert(last_accepted);
        self.blocks.clear();
    }

    fn is_issued(&self, block: &dyn Block) -> bool {
        block.status().is_decided() || self.issued.contains(&block.id())
    }

    fn add(&mut self, block: Arc<dyn Block>) -> Result<bool, ConsensusError> {
        if let Some(message) = self.fail_next_add.take() {
            return Err(ConsensusError::Internal(message));
        }

        let id = block.id();
        let parent = block.parent();
        if !self.issued.contains(&parent) {
            return Err(ConsensusError::ParentNotIssued(id));
        }
        if self.issued.contains(&id) {
            return Err(ConsensusError::Internal(format!("block {id} added twice")));
        }

        self.issued.insert(id);
        if self.reject_on_add.contains(&id) {
            block
                .reject()
                .expect("mock consensus rejected an undecidable block");
            return Ok(true);
        }

        if parent == self.preference {
            self.preference = id;
        }
        self.blocks.insert(id, block);
        Ok(false)
    }

    fn preference(&self) -> BlockId {
        self.preference
    }

    fn record_poll(&mut self, votes: Bag<BlockId>) -> Result<Vec<Decision>, ConsensusError> {
        let Some((winner, freq)) = votes.mode() else {
            return Ok(Vec::new());
        };
        if freq < self.alpha || !self.blocks.contains_key(&winner) {
            return Ok(Vec::new());
        }
        Ok(self.accept_chain(winner))
    }

    fn finalized(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// A validator set with fixed membership.
///
/// [`FixedValidators::new`] samples the first `k` members in order, which
/// keeps assertions trivial. [`FixedValidators::seeded`] samples with
/// replacement from a seeded RNG, exercising repeated validators in the
/// polled bag the way a weighted sampler does.
pub struct FixedValidators {
    validators: Vec<ValidatorId>,
    rng: Option<Mutex<ChaCha8Rng>>,
}

impl FixedValidators {
    /// A set sampled deterministically in membership order.
    pub fn new(validators: Vec<ValidatorId>) -> Self {
        FixedValidators {
            validators,
            rng: None,
        }
    }

    /// A set sampled with replacement from a seeded RNG.
    pub fn seeded(validators: Vec<ValidatorId>, seed: u64) -> Self {
        FixedValidators {
            validators,
            rng: Some(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }
}

impl Validators for FixedValidators {
    fn sample(&self, k: usize) -> Result<Vec<ValidatorId>, SampleError> {
        if self.validators.len() < k {
            return Err(SampleError::InsufficientValidators {
                wanted: k,
                available: self.validators.len(),
            });
        }
        match &self.rng {
            None => Ok(self.validators[..k].to_vec()),
            Some(rng) => {
                let mut rng = rng.lock().unwrap();
                Ok((0..k)
                    .map(|_| self.validators[rng.gen_range(0..self.validators.len())])
                    .collect())
            }
        }
    }
}
