//! Dependency scheduling for deferred operations.

use snowline_types::{Block, BlockId, RequestId, ValidatorId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A deferred operation waiting for one or more blocks to be issued.
///
/// Continuations are passive data; the engine executes them when the blocker
/// hands them back. Each variant has a success path (run on fulfillment) and
/// a cancellation path (run on abandonment):
///
/// - `Issue` delivers its block to consensus; cancelled, it removes the block
///   from the pending set and abandons the block's own waiters.
/// - `Respond` replies to a query with chits; cancelled, it stays silent.
/// - `RecordVote` applies a peer's vote to the matching poll; cancelled, the
///   vote is applied as a non-response so the poll can still conclude.
#[derive(Clone)]
pub enum Continuation {
    /// Deliver a block to consensus once its parent is issued.
    Issue { block: Arc<dyn Block> },

    /// Reply to a pull or push query once the queried block is issued.
    Respond {
        validator: ValidatorId,
        request_id: RequestId,
    },

    /// Record a peer's chit once the voted-for block is issued.
    ///
    /// `vote` is `None` for failed queries: the validator is marked as a
    /// non-response in the poll.
    RecordVote {
        validator: ValidatorId,
        request_id: RequestId,
        vote: Option<BlockId>,
    },
}

impl Continuation {
    /// Get the continuation type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Continuation::Issue { .. } => "Issue",
            Continuation::Respond { .. } => "Respond",
            Continuation::RecordVote { .. } => "RecordVote",
        }
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Continuation::Issue { block } => {
                f.debug_struct("Issue").field("block", &block.id()).finish()
            }
            Continuation::Respond {
                validator,
                request_id,
            } => f
                .debug_struct("Respond")
                .field("validator", validator)
                .field("request_id", request_id)
                .finish(),
            Continuation::RecordVote {
                validator,
                request_id,
                vote,
            } => f
                .debug_struct("RecordVote")
                .field("validator", validator)
                .field("request_id", request_id)
                .field("vote", vote)
                .finish(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    continuation: Continuation,
    deps: HashSet<BlockId>,
}

/// A dependency graph of continuations waiting on block issuance.
///
/// Fulfilling or abandoning a block ID hands the affected continuations back
/// to the caller instead of executing them in place: the engine drains them
/// through a queue, so a continuation that re-enters the blocker never runs
/// inside another continuation's mutation.
#[derive(Debug, Default)]
pub struct Blocker {
    entries: HashMap<u64, Entry>,
    /// block ID → tokens of continuations waiting on it.
    waiting: HashMap<BlockId, Vec<u64>>,
    /// Tokens are allocated monotonically, so sorting by token is
    /// registration order.
    next_token: u64,
}

impl Blocker {
    /// Create an empty blocker.
    pub fn new() -> Self {
        Blocker::default()
    }

    /// Number of waiting continuations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attach a continuation under each of its dependencies.
    ///
    /// A continuation with no dependencies is not stored; it is handed back
    /// for the caller to run immediately.
    pub fn register(
        &mut self,
        continuation: Continuation,
        deps: HashSet<BlockId>,
    ) -> Option<Continuation> {
        if deps.is_empty() {
            return Some(continuation);
        }
        let token = self.next_token;
        self.next_token += 1;
        for dep in &deps {
            self.waiting.entry(*dep).or_default().push(token);
        }
        self.entries.insert(
            token,
            Entry {
                continuation,
                deps,
            },
        );
        None
    }

    /// Mark `id` as issued.
    ///
    /// Returns the continuations whose dependency sets emptied, in
    /// registration order.
    pub fn fulfill(&mut self, id: BlockId) -> Vec<Continuation> {
        let tokens = match self.waiting.remove(&id) {
            Some(tokens) => tokens,
            None => return Vec::new(),
        };
        let mut ready = Vec::new();
        for token in tokens {
            let done = match self.entries.get_mut(&token) {
                Some(entry) => {
                    entry.deps.remove(&id);
                    entry.deps.is_empty()
                }
                None => false,
            };
            if done {
                if let Some(entry) = self.entries.remove(&token) {
                    ready.push(entry.continuation);
                }
            }
        }
        ready
    }

    /// Mark `id` as never arriving.
    ///
    /// Detaches and returns every continuation waiting on `id`, in
    /// registration order, without regard to their other dependencies.
    pub fn abandon(&mut self, id: BlockId) -> Vec<Continuation> {
        let tokens = match self.waiting.remove(&id) {
            Some(tokens) => tokens,
            None => return Vec::new(),
        };
        let mut detached = Vec::new();
        for token in tokens {
            let entry = match self.entries.remove(&token) {
                Some(entry) => entry,
                None => continue,
            };
            // Unlink from the dependency lists it was also waiting under.
            for dep in &entry.deps {
                if *dep == id {
                    continue;
                }
                if let Some(waiters) = self.waiting.get_mut(dep) {
                    waiters.retain(|t| *t != token);
                    if waiters.is_empty() {
                        self.waiting.remove(dep);
                    }
                }
            }
            detached.push(entry.continuation);
        }
        detached
    }
}
