//! Transitive Snowman consensus engine.
//!
//! This crate drives repeated metastable voting (Snowball sampling) over a
//! linear chain of blocks produced by a pluggable VM. The engine is named for
//! what it does with dependencies: to issue a block it transitively fetches
//! and issues every missing ancestor first.
//!
//! # Architecture
//!
//! The engine is a synchronous, event-driven state machine
//! ([`EngineState`]): inbound network messages arrive as events, outbound
//! messages leave as actions, and nothing inside ever blocks or suspends.
//! Work that must wait for a block to be issued is parked on a dependency
//! scheduler ([`Blocker`]) as a continuation and resumed when the block
//! lands in consensus (or cancelled when it never will).
//!
//! - `PullQuery`/`PushQuery` → issue the named block, defer the chits reply
//!   until it is in consensus
//! - `Put` → parse, pin, issue the block and any fetched ancestry; request
//!   the first missing ancestor
//! - `Chits` → defer the vote until the voted-for block is issued; conclude
//!   the poll once enough validators answered
//! - `GetFailed`/`QueryFailed` → cancel the waiters / count a non-response
//!
//! # Ordering
//!
//! Consensus sees ancestors strictly before descendants: each queued block
//! depends on its parent, and delivery fulfils waiters only after the block
//! is in the core. Continuations run from a breadth-first queue, so state is
//! always consistent before the next continuation observes it.

mod blocker;
mod config;
mod metrics;
mod polls;
mod requests;
mod state;

pub use blocker::{Blocker, Continuation};
pub use config::{
    Config, DEFAULT_MAX_MESSAGE_SIZE, INT_LEN, MAX_CONTAINERS_LEN, MAX_CONTAINERS_PER_MULTIPUT,
    MAX_TIME_FETCHING_ANCESTORS,
};
pub use metrics::EngineMetrics;
pub use polls::PollSet;
pub use requests::RequestTable;
pub use state::{EngineError, EngineState, InitError};
