//! Event types for the engine state machine.

use snowline_types::{BlockId, RequestId, ValidatorId};

/// Priority levels for event ordering.
///
/// Lower values = higher priority. The runner may use this to process
/// consequences of prior work before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: notifications from the local VM.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other nodes.
    Network = 2,
}

/// All possible events the engine can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The engine processes events and returns actions.
///
/// Sender identity (`validator`) is established by the network layer before
/// an event reaches the engine; the engine trusts it for request correlation
/// only, never for content.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages - block exchange (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A peer asked for one of our blocks.
    Get {
        validator: ValidatorId,
        request_id: RequestId,
        block_id: BlockId,
    },

    /// A peer asked for a block and as many of its ancestors as fit in one
    /// response.
    GetAncestors {
        validator: ValidatorId,
        request_id: RequestId,
        block_id: BlockId,
    },

    /// A peer sent us a block, usually in response to a `Get` we issued.
    ///
    /// Unsolicited puts are tolerated; the sender may have inferred we want
    /// the block. A `request_id` of [`GOSSIP_REQUEST_ID`] marks chain-tip
    /// gossip.
    ///
    /// [`GOSSIP_REQUEST_ID`]: snowline_types::GOSSIP_REQUEST_ID
    Put {
        validator: ValidatorId,
        request_id: RequestId,
        block_id: BlockId,
        bytes: Vec<u8>,
    },

    /// The network layer gave up on a `Get` we issued.
    GetFailed {
        validator: ValidatorId,
        request_id: RequestId,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages - queries and votes (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A peer asked for our preference, naming a block by ID only.
    PullQuery {
        validator: ValidatorId,
        request_id: RequestId,
        block_id: BlockId,
    },

    /// A peer asked for our preference and included the named block's bytes.
    PushQuery {
        validator: ValidatorId,
        request_id: RequestId,
        block_id: BlockId,
        bytes: Vec<u8>,
    },

    /// A peer answered one of our queries with its preference votes.
    ///
    /// On a linear chain exactly one vote is expected; anything else is a
    /// protocol violation handled like a failed query.
    Chits {
        validator: ValidatorId,
        request_id: RequestId,
        votes: Vec<BlockId>,
    },

    /// The network layer gave up on a query we issued.
    QueryFailed {
        validator: ValidatorId,
        request_id: RequestId,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Local notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// The VM has pending transactions and wants a block built (priority:
    /// Internal).
    PendingTransactions,

    /// Time to gossip the accepted frontier (priority: Timer).
    GossipTick,
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::Get { .. }
            | Event::GetAncestors { .. }
            | Event::Put { .. }
            | Event::GetFailed { .. }
            | Event::PullQuery { .. }
            | Event::PushQuery { .. }
            | Event::Chits { .. }
            | Event::QueryFailed { .. } => EventPriority::Network,

            Event::PendingTransactions => EventPriority::Internal,

            Event::GossipTick => EventPriority::Timer,
        }
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Get { .. } => "Get",
            Event::GetAncestors { .. } => "GetAncestors",
            Event::Put { .. } => "Put",
            Event::GetFailed { .. } => "GetFailed",
            Event::PullQuery { .. } => "PullQuery",
            Event::PushQuery { .. } => "PushQuery",
            Event::Chits { .. } => "Chits",
            Event::QueryFailed { .. } => "QueryFailed",
            Event::PendingTransactions => "PendingTransactions",
            Event::GossipTick => "GossipTick",
        }
    }
}
