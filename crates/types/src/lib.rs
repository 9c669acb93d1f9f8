//! Core types for the Snowline consensus engine.
//!
//! This crate provides the foundational types used throughout the engine:
//!
//! - **Identifiers**: [`BlockId`], [`ValidatorId`], [`RequestId`]
//! - **Block lifecycle**: [`Status`], the [`Block`] contract, [`MissingBlock`]
//! - **Collections**: [`Bag`], the multiset used for poll bookkeeping
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod bag;
mod block;
mod id;
mod status;

pub use bag::Bag;
pub use block::{Block, BlockError, MissingBlock};
pub use id::{BlockId, RequestId, ValidatorId, GOSSIP_REQUEST_ID};
pub use status::Status;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
