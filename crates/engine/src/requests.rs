//! Outstanding block request tracking.

use snowline_types::{BlockId, RequestId, ValidatorId};
use std::collections::HashMap;

/// Bidirectional map between `(validator, request_id)` pairs and the block
/// each outstanding `Get` is for.
///
/// The engine never issues two requests for the same block, so the mapping
/// is one-to-one in both directions; adding a request for a block that
/// already has one replaces the stale entry.
#[derive(Debug, Default)]
pub struct RequestTable {
    requests: HashMap<(ValidatorId, RequestId), BlockId>,
    by_block: HashMap<BlockId, (ValidatorId, RequestId)>,
}

impl RequestTable {
    /// Create an empty table.
    pub fn new() -> Self {
        RequestTable::default()
    }

    /// Record an outstanding request.
    pub fn add(&mut self, validator: ValidatorId, request_id: RequestId, block_id: BlockId) {
        if let Some(stale) = self.by_block.insert(block_id, (validator, request_id)) {
            self.requests.remove(&stale);
        }
        self.requests.insert((validator, request_id), block_id);
    }

    /// Resolve a response or failure, returning the block the request was
    /// for. Returns `None` for requests we never sent.
    pub fn remove(&mut self, validator: ValidatorId, request_id: RequestId) -> Option<BlockId> {
        let block_id = self.requests.remove(&(validator, request_id))?;
        self.by_block.remove(&block_id);
        Some(block_id)
    }

    /// Drop any outstanding request for `block_id`. Returns whether one
    /// existed.
    pub fn remove_any(&mut self, block_id: &BlockId) -> bool {
        match self.by_block.remove(block_id) {
            Some(key) => {
                self.requests.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Whether a request for `block_id` is outstanding.
    pub fn contains_block(&self, block_id: &BlockId) -> bool {
        self.by_block.contains_key(block_id)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
