//! Action types for the engine state machine.

use snowline_types::{BlockId, RequestId, ValidatorId};

/// Actions the engine wants to perform.
///
/// Actions are **commands** - they describe something to do. The runner
/// executes actions against the network; all of them are fire-and-forget.
/// Replies (or their absence) come back to the engine as [`Event`]s carrying
/// the same request ID.
///
/// [`Event`]: crate::Event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Block exchange
    // ═══════════════════════════════════════════════════════════════════════
    /// Ask a peer for a block we are missing.
    SendGet {
        to: ValidatorId,
        request_id: RequestId,
        block_id: BlockId,
    },

    /// Answer a peer's `Get` with the block's bytes.
    SendPut {
        to: ValidatorId,
        request_id: RequestId,
        block_id: BlockId,
        bytes: Vec<u8>,
    },

    /// Answer a peer's `GetAncestors` with a batch of serialized blocks,
    /// child first, each ancestor following its descendant.
    SendMultiPut {
        to: ValidatorId,
        request_id: RequestId,
        containers: Vec<Vec<u8>>,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════
    /// Ask the sampled validators for their preference, naming a block by ID.
    SendPullQuery {
        to: Vec<ValidatorId>,
        request_id: RequestId,
        block_id: BlockId,
    },

    /// Ask the sampled validators for their preference, including the named
    /// block's bytes so they can issue it without a fetch round-trip.
    SendPushQuery {
        to: Vec<ValidatorId>,
        request_id: RequestId,
        block_id: BlockId,
        bytes: Vec<u8>,
    },

    /// Answer a peer's query with our preference votes.
    SendChits {
        to: ValidatorId,
        request_id: RequestId,
        votes: Vec<BlockId>,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Gossip
    // ═══════════════════════════════════════════════════════════════════════
    /// Gossip an accepted block to the network.
    GossipBlock { block_id: BlockId, bytes: Vec<u8> },
}

impl Action {
    /// Whether this action opens a request the engine expects a reply to.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Action::SendGet { .. }
                | Action::SendPullQuery { .. }
                | Action::SendPushQuery { .. }
        )
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::SendGet { .. } => "SendGet",
            Action::SendPut { .. } => "SendPut",
            Action::SendMultiPut { .. } => "SendMultiPut",
            Action::SendPullQuery { .. } => "SendPullQuery",
            Action::SendPushQuery { .. } => "SendPushQuery",
            Action::SendChits { .. } => "SendChits",
            Action::GossipBlock { .. } => "GossipBlock",
        }
    }
}
