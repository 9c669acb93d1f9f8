//! The transitive engine state machine.

use crate::blocker::{Blocker, Continuation};
use crate::config::{Config, INT_LEN, MAX_CONTAINERS_LEN};
use crate::metrics::EngineMetrics;
use crate::polls::PollSet;
use crate::requests::RequestTable;
use lru::LruCache;
use prometheus::Registry;
use snowline_core::{
    Action, Consensus, ConsensusError, Decision, Event, Validators, Vm, VmError,
};
use snowline_types::{
    Bag, Block, BlockId, MissingBlock, RequestId, Status, ValidatorId, GOSSIP_REQUEST_ID,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};

/// Max size of the cache of accepted/rejected block IDs.
const DECIDED_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(5000) {
    Some(n) => n,
    None => unreachable!(),
};

/// Max size of the cache of dropped blocks.
const DROPPED_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(n) => n,
    None => unreachable!(),
};

/// Internal failures that halt the engine.
///
/// Protocol-level irregularities never surface here; they are absorbed into
/// state updates and logs. Once a handler returns an error the engine latches
/// it and every subsequent call returns the same error; the caller is
/// expected to restart the chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The consensus core failed.
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// The VM failed on a call the engine cannot absorb.
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Failures surfaced while constructing an engine.
#[derive(Debug, Error)]
pub enum InitError {
    /// The configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Metrics registration collided with an existing engine.
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),
}

/// Work produced while resolving the dependency graph.
///
/// Continuations run off this queue, breadth-first, never from inside
/// another continuation: state is always updated before the next
/// continuation observes it.
enum Signal {
    /// Run a continuation whose dependencies are satisfied.
    Run(Continuation),
    /// Run a continuation's cancellation path.
    RunAbandoned(Continuation),
    /// Mark a block as issued and ready its waiters.
    Fulfill(BlockId),
    /// Mark a block as never arriving and cancel its waiters.
    Abandon(BlockId),
}

/// Per-handler working set: the actions to return and the resolution queue.
#[derive(Default)]
struct Cx {
    actions: Vec<Action>,
    signals: VecDeque<Signal>,
}

/// The transitive consensus engine.
///
/// Drives repeated metastable voting over a linear chain on top of a
/// pluggable VM. The engine fetches missing ancestors from peers, defers
/// operations until their block dependencies are issued, feeds blocks to the
/// consensus core in causal order, and keeps `concurrent_repolls` preference
/// queries in flight.
///
/// # State Machine Flow
///
/// 1. **Query received** → issue the named block (fetching ancestors as
///    needed), defer the chits reply until it is issued
/// 2. **Block issued** → verify, add to consensus, push-query a sample of
///    validators
/// 3. **Chits received** → defer the vote until the voted-for block is
///    issued, conclude the poll when enough validators answered
/// 4. **Poll concluded** → record votes with consensus, finalize decisions,
///    repoll
pub struct EngineState {
    config: Config,

    // ═══════════════════════════════════════════════════════════════════════════
    // Collaborators
    // ═══════════════════════════════════════════════════════════════════════════
    vm: Arc<dyn Vm>,
    validators: Arc<dyn Validators>,
    consensus: Box<dyn Consensus>,

    // ═══════════════════════════════════════════════════════════════════════════
    // Working Set
    // ═══════════════════════════════════════════════════════════════════════════
    /// Blocks pinned in memory while consensus works on them.
    ///
    /// Invariant: every block in this map has status Processing. Removing a
    /// block from this map is the only way it is released; a dropped block
    /// may be re-added later if it is fetched again.
    processing: HashMap<BlockId, Arc<dyn Block>>,

    /// Blocks queued to be added to consensus once their ancestors are.
    pending: HashSet<BlockId>,

    /// Outstanding block fetch requests.
    blk_reqs: RequestTable,

    /// Operations blocked on a block being issued: issuing another block,
    /// responding to a query, or applying votes to consensus.
    blocked: Blocker,

    /// Queries in flight.
    polls: PollSet,

    /// Recently accepted or rejected block IDs.
    decided: LruCache<BlockId, ()>,

    /// Recently invalidated blocks, kept so a peer querying for one does not
    /// force a re-fetch.
    dropped: LruCache<BlockId, Arc<dyn Block>>,

    // ═══════════════════════════════════════════════════════════════════════════
    // Bookkeeping
    // ═══════════════════════════════════════════════════════════════════════════
    /// Monotone request ID allocator, shared by fetches and polls.
    next_request_id: u32,

    bootstrapped: bool,

    /// First internal error observed in a resolution cascade.
    error: Option<EngineError>,

    metrics: EngineMetrics,
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("bootstrapped", &self.bootstrapped)
            .field("processing", &self.processing.len())
            .field("pending", &self.pending.len())
            .field("blk_reqs", &self.blk_reqs.len())
            .field("blocked", &self.blocked.len())
            .field("polls", &self.polls.len())
            .finish()
    }
}

impl EngineState {
    /// Create an engine. Message handlers stay inert until
    /// [`EngineState::finish_bootstrapping`] is called.
    pub fn new(
        config: Config,
        vm: Arc<dyn Vm>,
        validators: Arc<dyn Validators>,
        consensus: Box<dyn Consensus>,
        registry: &Registry,
    ) -> Result<Self, InitError> {
        config.validate().map_err(InitError::Config)?;
        info!(namespace = %config.namespace, "initializing consensus engine");
        let metrics = EngineMetrics::new(&config.namespace, registry)?;
        let polls = PollSet::new(config.alpha);
        Ok(EngineState {
            config,
            vm,
            validators,
            consensus,
            processing: HashMap::new(),
            pending: HashSet::new(),
            blk_reqs: RequestTable::new(),
            blocked: Blocker::new(),
            polls,
            decided: LruCache::new(DECIDED_CACHE_SIZE),
            dropped: LruCache::new(DROPPED_CACHE_SIZE),
            next_request_id: 0,
            bootstrapped: false,
            error: None,
            metrics,
        })
    }

    /// Route an event to its handler.
    pub fn handle(&mut self, event: Event) -> Result<Vec<Action>, EngineError> {
        match event {
            Event::Get {
                validator,
                request_id,
                block_id,
            } => self.on_get(validator, request_id, block_id),
            Event::GetAncestors {
                validator,
                request_id,
                block_id,
            } => self.on_get_ancestors(validator, request_id, block_id),
            Event::Put {
                validator,
                request_id,
                block_id,
                bytes,
            } => self.on_put(validator, request_id, block_id, &bytes),
            Event::GetFailed {
                validator,
                request_id,
            } => self.on_get_failed(validator, request_id),
            Event::PullQuery {
                validator,
                request_id,
                block_id,
            } => self.on_pull_query(validator, request_id, block_id),
            Event::PushQuery {
                validator,
                request_id,
                block_id,
                bytes,
            } => self.on_push_query(validator, request_id, block_id, &bytes),
            Event::Chits {
                validator,
                request_id,
                votes,
            } => self.on_chits(validator, request_id, &votes),
            Event::QueryFailed {
                validator,
                request_id,
            } => self.on_query_failed(validator, request_id),
            Event::PendingTransactions => self.on_pending_transactions(),
            Event::GossipTick => self.on_gossip(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// One-shot handoff from the bootstrap subsystem.
    ///
    /// Points consensus at the VM's last accepted block and activates the
    /// message handlers. A last accepted oracle block has its options
    /// delivered immediately so the preference lands on one of them.
    pub fn finish_bootstrapping(&mut self) -> Result<Vec<Action>, EngineError> {
        self.guard()?;
        let last_accepted_id = self.vm.last_accepted();
        self.consensus.initialize(last_accepted_id);

        let last_accepted = match self.vm.get_block(last_accepted_id) {
            Ok(block) => block,
            Err(err) => {
                error!(%last_accepted_id, %err, "failed to get last accepted block");
                return Err(err.into());
            }
        };

        let mut cx = Cx::default();
        match last_accepted.options() {
            // Bootstrapping into an oracle block: deliver the options so the
            // preference is set to one of them.
            Some(options) => {
                for option in options {
                    self.deliver(option, &mut cx);
                }
                self.drain(&mut cx);
            }
            None => self.vm.set_preference(last_accepted_id),
        }

        self.bootstrapped = true;
        info!(%last_accepted_id, "bootstrapping finished");
        self.surface(cx)
    }

    /// Whether the engine is accepting consensus messages.
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Release the engine's resources.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        info!("shutting down consensus engine");
        self.vm.shutdown().map_err(EngineError::from)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Wire Handlers
    // ═══════════════════════════════════════════════════════════════════════════

    /// A peer asked for a block; answer if we have it.
    ///
    /// Served even before bootstrapping finishes: peers bootstrap from us.
    #[instrument(skip(self), fields(%validator, %request_id, %block_id))]
    pub fn on_get(
        &mut self,
        validator: ValidatorId,
        request_id: RequestId,
        block_id: BlockId,
    ) -> Result<Vec<Action>, EngineError> {
        self.guard()?;
        let block = match self.get_block(block_id) {
            Ok(block) => block,
            Err(err) => {
                // Either an unexpected failure, a validator not following the
                // protocol, or a pruned block.
                debug!(%err, "dropping Get for unavailable block");
                return Ok(Vec::new());
            }
        };
        Ok(vec![Action::SendPut {
            to: validator,
            request_id,
            block_id,
            bytes: block.bytes().to_vec(),
        }])
    }

    /// A peer asked for a block and its ancestry; answer with as many
    /// ancestors as fit the response budgets.
    #[instrument(skip(self), fields(%validator, %request_id, %block_id))]
    pub fn on_get_ancestors(
        &mut self,
        validator: ValidatorId,
        request_id: RequestId,
        block_id: BlockId,
    ) -> Result<Vec<Action>, EngineError> {
        self.guard()?;
        let start = Instant::now();
        let mut block = match self.get_block(block_id) {
            Ok(block) => block,
            Err(err) => {
                trace!(%err, "dropping GetAncestors for unavailable block");
                return Ok(Vec::new());
            }
        };

        // First element is the requested block, then its parent, then the
        // grandparent, and so on.
        let mut containers = vec![block.bytes().to_vec()];
        let mut containers_len = block.bytes().len() + INT_LEN;

        while containers.len() < self.config.max_containers_per_multiput
            && start.elapsed() < self.config.max_time_fetching_ancestors
        {
            block = match self.get_block(block.parent()) {
                Ok(parent) => parent,
                Err(_) => break,
            };
            let bytes = block.bytes().to_vec();
            // Each container repeats its length on the wire.
            let new_len = INT_LEN + containers_len + bytes.len();
            if new_len >= MAX_CONTAINERS_LEN {
                break;
            }
            containers.push(bytes);
            containers_len = new_len;
        }

        Ok(vec![Action::SendMultiPut {
            to: validator,
            request_id,
            containers,
        }])
    }

    /// A peer sent us a block. Parse it, pin it, and issue it along with any
    /// fetched ancestry.
    #[instrument(skip(self, bytes), fields(%validator, %request_id, %block_id))]
    pub fn on_put(
        &mut self,
        validator: ValidatorId,
        request_id: RequestId,
        block_id: BlockId,
        bytes: &[u8],
    ) -> Result<Vec<Action>, EngineError> {
        self.guard()?;
        // Bootstrapping isn't done, so we never sent a Get.
        if !self.bootstrapped {
            if request_id == GOSSIP_REQUEST_ID {
                trace!("dropping gossiped block during bootstrap");
            } else {
                debug!("dropping Put during bootstrap");
            }
            return Ok(Vec::new());
        }

        let block = match self.vm.parse_block(bytes) {
            Ok(block) => block,
            Err(err) => {
                debug!(%err, "failed to parse block");
                // GetFailed doesn't assume we actually sent a Get, so it can
                // absorb the failed delivery and abandon the request.
                return self.on_get_failed(validator, request_id);
            }
        };
        if block.status() == Status::Processing {
            self.pin(Arc::clone(&block), block_id);
        }

        // Issue the block into consensus. A no-op if it is already issued;
        // if ancestors are missing, the sender receives requests to fill the
        // ancestry.
        let mut cx = Cx::default();
        self.issue_from(validator, block, &mut cx);
        self.drain(&mut cx);
        self.surface(cx)
    }

    /// The network gave up on a `Get` we issued; the block is never coming.
    #[instrument(skip(self), fields(%validator, %request_id))]
    pub fn on_get_failed(
        &mut self,
        validator: ValidatorId,
        request_id: RequestId,
    ) -> Result<Vec<Action>, EngineError> {
        self.guard()?;
        if !self.bootstrapped {
            debug!("dropping GetFailed during bootstrap");
            return Ok(Vec::new());
        }

        // This may arrive without a matching Get (e.g. a Put that failed to
        // parse); reconcile only what we actually tracked.
        let Some(block_id) = self.blk_reqs.remove(validator, request_id) else {
            debug!("GetFailed without a matching Get");
            return Ok(Vec::new());
        };

        let mut cx = Cx::default();
        cx.signals.push_back(Signal::Abandon(block_id));
        self.drain(&mut cx);
        self.surface(cx)
    }

    /// A peer wants our preference; reply once the named block is issued.
    #[instrument(skip(self), fields(%validator, %request_id, %block_id))]
    pub fn on_pull_query(
        &mut self,
        validator: ValidatorId,
        request_id: RequestId,
        block_id: BlockId,
    ) -> Result<Vec<Action>, EngineError> {
        self.guard()?;
        if !self.bootstrapped {
            debug!("dropping PullQuery during bootstrap");
            return Ok(Vec::new());
        }

        let mut cx = Cx::default();
        self.register_query_response(validator, request_id, block_id, &mut cx);
        self.drain(&mut cx);
        self.surface(cx)
    }

    /// Like a pull query, but the peer included the block's bytes.
    #[instrument(skip(self, bytes), fields(%validator, %request_id, %block_id))]
    pub fn on_push_query(
        &mut self,
        validator: ValidatorId,
        request_id: RequestId,
        block_id: BlockId,
        bytes: &[u8],
    ) -> Result<Vec<Action>, EngineError> {
        self.guard()?;
        if !self.bootstrapped {
            debug!("dropping PushQuery during bootstrap");
            return Ok(Vec::new());
        }

        // We didn't ask for these bytes; a parse failure just drops the query.
        let block = match self.vm.parse_block(bytes) {
            Ok(block) => block,
            Err(err) => {
                debug!(%err, "failed to parse block");
                return Ok(Vec::new());
            }
        };
        if block.id() != block_id {
            debug!(parsed = %block.id(), "query named one block but carried another");
            return Ok(Vec::new());
        }
        if block.status() == Status::Processing {
            self.pin(Arc::clone(&block), block_id);
        }

        let mut cx = Cx::default();
        self.issue_from(validator, block, &mut cx);
        self.register_query_response(validator, request_id, block_id, &mut cx);
        self.drain(&mut cx);
        self.surface(cx)
    }

    /// Park a chits reply for `(validator, request_id)` behind the queried
    /// block's issuance, replying immediately if it is already issued.
    fn register_query_response(
        &mut self,
        validator: ValidatorId,
        request_id: RequestId,
        block_id: BlockId,
        cx: &mut Cx,
    ) {
        // Try to issue the queried block; if we don't have it, the sender
        // receives a fetch request for it.
        let added = self.issue_from_by_id(validator, block_id, cx);
        let mut deps = HashSet::new();
        if !added {
            deps.insert(block_id);
        }
        let responder = Continuation::Respond {
            validator,
            request_id,
        };
        if let Some(ready) = self.blocked.register(responder, deps) {
            cx.signals.push_back(Signal::Run(ready));
        }
    }

    /// A peer answered a query; record its vote once the voted-for block is
    /// issued.
    #[instrument(skip(self, votes), fields(%validator, %request_id))]
    pub fn on_chits(
        &mut self,
        validator: ValidatorId,
        request_id: RequestId,
        votes: &[BlockId],
    ) -> Result<Vec<Action>, EngineError> {
        self.guard()?;
        if !self.bootstrapped {
            debug!("dropping Chits during bootstrap");
            return Ok(Vec::new());
        }

        // This is a linear chain: exactly one vote is expected.
        if votes.len() != 1 {
            debug!(votes = votes.len(), "expected exactly one chit vote");
            // QueryFailed doesn't assume we actually sent a query, so it can
            // absorb the malformed response.
            return self.on_query_failed(validator, request_id);
        }
        let vote = votes[0];
        trace!(%vote, "chit vote received");

        let mut cx = Cx::default();
        let added = self.issue_from_by_id(validator, vote, &mut cx);
        let mut deps = HashSet::new();
        if !added {
            deps.insert(vote);
        }
        let voter = Continuation::RecordVote {
            validator,
            request_id,
            vote: Some(vote),
        };
        if let Some(ready) = self.blocked.register(voter, deps) {
            cx.signals.push_back(Signal::Run(ready));
        }
        self.drain(&mut cx);
        self.surface(cx)
    }

    /// The network gave up on a query we issued; count the validator as a
    /// non-response.
    #[instrument(skip(self), fields(%validator, %request_id))]
    pub fn on_query_failed(
        &mut self,
        validator: ValidatorId,
        request_id: RequestId,
    ) -> Result<Vec<Action>, EngineError> {
        self.guard()?;
        if !self.bootstrapped {
            warn!("dropping QueryFailed during bootstrap");
            return Ok(Vec::new());
        }

        let mut cx = Cx::default();
        let voter = Continuation::RecordVote {
            validator,
            request_id,
            vote: None,
        };
        if let Some(ready) = self.blocked.register(voter, HashSet::new()) {
            cx.signals.push_back(Signal::Run(ready));
        }
        self.drain(&mut cx);
        self.surface(cx)
    }

    /// The VM has pending transactions; build a block and issue it.
    #[instrument(skip(self))]
    pub fn on_pending_transactions(&mut self) -> Result<Vec<Action>, EngineError> {
        self.guard()?;
        if !self.bootstrapped {
            debug!("dropping build notification during bootstrap");
            return Ok(Vec::new());
        }

        let block = match self.vm.build_block() {
            Ok(block) => block,
            Err(err) => {
                debug!(%err, "block build failed");
                return Ok(Vec::new());
            }
        };
        let block_id = block.id();

        // A newly built block is expected to be processing; anything else
        // points at a VM fault.
        let status = block.status();
        if status != Status::Processing {
            warn!(%block_id, %status, "VM built a block that is not processing");
            return Ok(Vec::new());
        }
        if self.pending.contains(&block_id) || self.consensus.is_issued(block.as_ref()) {
            warn!(%block_id, "VM built an already issued block");
            return Ok(Vec::new());
        }

        // Building anywhere but the preferred tip wastes the block's chance
        // of being accepted.
        let parent_id = block.parent();
        let preference = self.consensus.preference();
        if parent_id != preference {
            warn!(%block_id, %parent_id, %preference, "built block is not on the preferred tip");
        }

        self.pin(Arc::clone(&block), block_id);
        let mut cx = Cx::default();
        let added = self.issue_with_ancestors(block, &mut cx);
        if added {
            trace!(%block_id, "issued new block from the VM");
        } else {
            warn!(%block_id, "VM built a block with unissued ancestors");
        }
        self.drain(&mut cx);
        self.surface(cx)
    }

    /// Gossip the last accepted block to the network.
    #[instrument(skip(self))]
    pub fn on_gossip(&mut self) -> Result<Vec<Action>, EngineError> {
        self.guard()?;
        let block_id = self.vm.last_accepted();
        let block = match self.get_block(block_id) {
            Ok(block) => block,
            Err(err) => {
                warn!(%block_id, %err, "dropping gossip; last accepted block unavailable");
                return Ok(Vec::new());
            }
        };
        trace!(%block_id, "gossiping last accepted block");
        Ok(vec![Action::GossipBlock {
            block_id,
            bytes: block.bytes().to_vec(),
        }])
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Issuance Resolver
    // ═══════════════════════════════════════════════════════════════════════════

    /// Issue the branch ending in `block_id`, fetching the block from
    /// `validator` if we don't have it.
    ///
    /// Returns true if the block was issued, now or previously.
    fn issue_from_by_id(
        &mut self,
        validator: ValidatorId,
        block_id: BlockId,
        cx: &mut Cx,
    ) -> bool {
        // Recently decided blocks were necessarily issued.
        if self.decided.get(&block_id).is_some() {
            return true;
        }
        let block = match self.get_block(block_id) {
            Ok(block) => block,
            Err(_) => {
                self.send_request(validator, block_id, cx);
                return false;
            }
        };
        if block.status().is_decided() {
            self.decided.put(block_id, ());
            return true;
        }
        self.issue_from(validator, block, cx)
    }

    /// Issue the branch ending in `block`, walking rootward and requesting
    /// the first missing ancestor from `validator`.
    ///
    /// The walk queues each unissued block behind its parent, so consensus
    /// sees ancestors strictly before descendants. Returns true if the block
    /// was issued, now or previously.
    fn issue_from(&mut self, validator: ValidatorId, block: Arc<dyn Block>, cx: &mut Cx) -> bool {
        let mut block = block;
        let mut block_id = block.id();
        while !self.consensus.is_issued(block.as_ref()) && !self.pending.contains(&block_id) {
            self.issue(Arc::clone(&block), cx);

            block_id = block.parent();
            if self.decided.get(&block_id).is_some() {
                // The ancestry bottoms out in a decided block; nothing more
                // to issue.
                break;
            }
            block = match self.get_block(block_id) {
                Ok(parent) if parent.status().is_fetched() => parent,
                _ => {
                    self.send_request(validator, block_id, cx);
                    return false;
                }
            };
        }
        self.consensus.is_issued(block.as_ref())
    }

    /// Issue the branch ending in `block` without a peer to fetch from
    /// (the block came from the local VM).
    ///
    /// Returns true if the block was issued, now or previously. If an
    /// ancestor is missing and nothing is fetching it, the issuance is
    /// abandoned so the waiters don't leak.
    fn issue_with_ancestors(&mut self, block: Arc<dyn Block>, cx: &mut Cx) -> bool {
        let mut block = block;
        let mut block_id = block.id();
        while block.status().is_fetched()
            && !self.consensus.is_issued(block.as_ref())
            && !self.pending.contains(&block_id)
        {
            self.issue(Arc::clone(&block), cx);
            block_id = block.parent();
            block = match self.get_block(block_id) {
                Ok(parent) => parent,
                Err(_) => Arc::new(MissingBlock::new(block_id)),
            };
        }

        // The branch bottoms out in an issued block. This is the happy path.
        if self.consensus.is_issued(block.as_ref()) {
            return true;
        }

        // There's an outstanding request for the missing ancestor; wait for
        // it to succeed or fail.
        if self.blk_reqs.contains_block(&block_id) {
            return false;
        }

        // No reason to expect the ancestor will ever arrive. Abandon the
        // branch to avoid a memory leak.
        cx.signals.push_back(Signal::Abandon(block_id));
        false
    }

    /// Queue `block` to be added to consensus once its parent is issued.
    fn issue(&mut self, block: Arc<dyn Block>, cx: &mut Cx) {
        let block_id = block.id();
        self.pending.insert(block_id);
        // The block is here; any fetch for it is moot.
        self.blk_reqs.remove_any(&block_id);

        let parent_id = block.parent();
        let mut parent_issued = self.decided.get(&parent_id).is_some();
        if !parent_issued {
            if let Ok(parent) = self.get_block(parent_id) {
                parent_issued = self.consensus.is_issued(parent.as_ref());
            }
        }

        let mut deps = HashSet::new();
        if !parent_issued {
            trace!(%block_id, %parent_id, "block waiting for parent to be issued");
            deps.insert(parent_id);
        }
        if let Some(ready) = self.blocked.register(Continuation::Issue { block }, deps) {
            cx.signals.push_back(Signal::Run(ready));
        }

        self.metrics.num_requests.set(self.blk_reqs.len() as i64);
        self.metrics.num_blocked.set(self.pending.len() as i64);
    }

    /// Ask `validator` for `block_id`, unless a fetch is already in flight.
    fn send_request(&mut self, validator: ValidatorId, block_id: BlockId, cx: &mut Cx) {
        if self.blk_reqs.contains_block(&block_id) {
            return;
        }

        self.next_request_id += 1;
        let request_id = RequestId(self.next_request_id);
        self.blk_reqs.add(validator, request_id, block_id);
        trace!(%validator, %request_id, %block_id, "requesting missing block");
        cx.actions.push(Action::SendGet {
            to: validator,
            request_id,
            block_id,
        });

        self.metrics.num_requests.set(self.blk_reqs.len() as i64);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Delivery
    // ═══════════════════════════════════════════════════════════════════════════

    /// Add `block` to consensus. Its parent is already issued.
    fn deliver(&mut self, block: Arc<dyn Block>, cx: &mut Cx) {
        if self.consensus.is_issued(block.as_ref()) {
            return;
        }

        // The block is going into consensus; it is no longer pending.
        let block_id = block.id();
        self.pending.remove(&block_id);

        if let Err(err) = block.verify() {
            debug!(%block_id, %err, "dropping block that failed verification");
            self.processing.remove(&block_id); // Unpin from memory.
            self.dropped.put(block_id, block);
            self.metrics.blocks_dropped.inc();
            // If verification fails, all descendants are invalid too.
            cx.signals.push_back(Signal::Abandon(block_id));
            self.metrics.num_blocked.set(self.pending.len() as i64);
            self.metrics
                .num_processing
                .set(self.processing.len() as i64);
            return;
        }

        trace!(%block_id, "adding block to consensus");
        match self.consensus.add(Arc::clone(&block)) {
            Err(err) => {
                self.error = Some(err.into());
                return;
            }
            Ok(true) => {
                // Rejected on arrival. Unpin and remember the decision.
                self.decided.put(block_id, ());
                self.dropped.pop(&block_id);
                self.processing.remove(&block_id);
                self.metrics.blocks_rejected.inc();
                self.metrics
                    .num_processing
                    .set(self.processing.len() as i64);
            }
            Ok(false) => {}
        }

        // Verify and add every oracle option before signalling any
        // fulfillment, so waiters never observe a half-delivered oracle.
        let mut added: Vec<Arc<dyn Block>> = Vec::new();
        let mut dropped: Vec<Arc<dyn Block>> = Vec::new();
        if let Some(options) = block.options() {
            for option in options {
                let option_id = option.id();
                if let Err(err) = option.verify() {
                    debug!(block = %option_id, %err, "dropping oracle option that failed verification");
                    dropped.push(option);
                    continue;
                }
                match self.consensus.add(Arc::clone(&option)) {
                    Err(err) => {
                        self.error = Some(err.into());
                        return;
                    }
                    Ok(true) => {
                        self.decided.put(option_id, ());
                        self.dropped.pop(&block_id);
                        self.processing.remove(&option_id);
                        self.metrics.blocks_rejected.inc();
                        self.metrics
                            .num_processing
                            .set(self.processing.len() as i64);
                    }
                    Ok(false) => {}
                }
                added.push(option);
            }
        }

        self.vm.set_preference(self.consensus.preference());

        // Ask the network what it prefers now that this block exists.
        self.push_sample(block.as_ref(), cx);

        cx.signals.push_back(Signal::Fulfill(block_id));
        for option in &added {
            self.push_sample(option.as_ref(), cx);
            let option_id = option.id();
            self.pending.remove(&option_id);
            cx.signals.push_back(Signal::Fulfill(option_id));
        }
        for option in &dropped {
            let option_id = option.id();
            self.pending.remove(&option_id);
            self.metrics.blocks_dropped.inc();
            cx.signals.push_back(Signal::Abandon(option_id));
        }

        // Top the concurrent poll budget back up.
        self.repoll(cx);

        self.metrics.num_requests.set(self.blk_reqs.len() as i64);
        self.metrics.num_blocked.set(self.pending.len() as i64);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Polling
    // ═══════════════════════════════════════════════════════════════════════════

    /// Keep `concurrent_repolls` preference polls in flight.
    ///
    /// A repoll both solicits chits and, because pull queries carry the
    /// preferred ID, gossips our tip.
    fn repoll(&mut self, cx: &mut Cx) {
        let preference = self.consensus.preference();
        for _ in self.polls.len()..self.config.concurrent_repolls {
            self.pull_sample(preference, cx);
        }
    }

    /// Pull-query a sample of validators about `block_id`.
    fn pull_sample(&mut self, block_id: BlockId, cx: &mut Cx) {
        let Some(bag) = self.sample_validators(block_id) else {
            return;
        };
        self.next_request_id += 1;
        let request_id = RequestId(self.next_request_id);
        if self.polls.add(request_id, bag.clone()) {
            cx.actions.push(Action::SendPullQuery {
                to: bag.uniques(),
                request_id,
                block_id,
            });
            self.metrics.num_polls.set(self.polls.len() as i64);
        }
    }

    /// Push-query a sample of validators with `block`'s bytes.
    fn push_sample(&mut self, block: &dyn Block, cx: &mut Cx) {
        let block_id = block.id();
        let Some(bag) = self.sample_validators(block_id) else {
            return;
        };
        self.next_request_id += 1;
        let request_id = RequestId(self.next_request_id);
        if self.polls.add(request_id, bag.clone()) {
            cx.actions.push(Action::SendPushQuery {
                to: bag.uniques(),
                request_id,
                block_id,
                bytes: block.bytes().to_vec(),
            });
            self.metrics.num_polls.set(self.polls.len() as i64);
        }
    }

    fn sample_validators(&mut self, block_id: BlockId) -> Option<Bag<ValidatorId>> {
        match self.validators.sample(self.config.k) {
            Ok(validators) => Some(validators.into_iter().collect()),
            Err(err) => {
                error!(%block_id, %err, "query dropped: insufficient validators");
                None
            }
        }
    }

    /// Apply a validator's (vote | non-response) to its poll; if the poll
    /// concludes, record the result with consensus and finalize decisions.
    fn apply_vote(
        &mut self,
        validator: ValidatorId,
        request_id: RequestId,
        vote: Option<BlockId>,
        cx: &mut Cx,
    ) {
        let concluded = match vote {
            Some(block_id) => self.polls.vote(request_id, validator, block_id),
            None => self.polls.drop_vote(request_id, validator),
        };
        self.metrics.num_polls.set(self.polls.len() as i64);
        let Some(votes) = concluded else {
            return;
        };

        match self.consensus.record_poll(votes) {
            Err(err) => {
                self.error = Some(err.into());
            }
            Ok(decisions) => {
                for decision in &decisions {
                    self.finalize_decision(decision);
                }
                self.vm.set_preference(self.consensus.preference());
                if self.consensus.finalized() {
                    debug!("consensus finalized; engine can quiesce");
                    return;
                }
                self.repoll(cx);
            }
        }
    }

    /// Batch-update the caches and the pin set for one decided block.
    fn finalize_decision(&mut self, decision: &Decision) {
        let block_id = decision.block_id;
        self.decided.put(block_id, ());
        self.dropped.pop(&block_id);
        self.processing.remove(&block_id);
        self.blk_reqs.remove_any(&block_id);
        match decision.status {
            Status::Accepted => {
                info!(%block_id, "block accepted");
                self.metrics.blocks_accepted.inc();
            }
            Status::Rejected => {
                debug!(%block_id, "block rejected");
                self.metrics.blocks_rejected.inc();
            }
            _ => {}
        }
        self.metrics
            .num_processing
            .set(self.processing.len() as i64);
        self.metrics.num_requests.set(self.blk_reqs.len() as i64);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Resolution Queue
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run the resolution queue to exhaustion.
    fn drain(&mut self, cx: &mut Cx) {
        while let Some(signal) = cx.signals.pop_front() {
            if self.error.is_some() {
                cx.signals.clear();
                return;
            }
            match signal {
                Signal::Run(continuation) => self.run_ready(continuation, cx),
                Signal::RunAbandoned(continuation) => self.run_abandoned(continuation, cx),
                Signal::Fulfill(block_id) => {
                    for continuation in self.blocked.fulfill(block_id) {
                        cx.signals.push_back(Signal::Run(continuation));
                    }
                }
                Signal::Abandon(block_id) => {
                    for continuation in self.blocked.abandon(block_id) {
                        cx.signals.push_back(Signal::RunAbandoned(continuation));
                    }
                }
            }
        }
    }

    /// A continuation's dependencies are satisfied; run its success path.
    fn run_ready(&mut self, continuation: Continuation, cx: &mut Cx) {
        match continuation {
            Continuation::Issue { block } => self.deliver(block, cx),
            Continuation::Respond {
                validator,
                request_id,
            } => {
                // Chits carry the current preference: the queried block is
                // issued now, so the preference accounts for it.
                cx.actions.push(Action::SendChits {
                    to: validator,
                    request_id,
                    votes: vec![self.consensus.preference()],
                });
            }
            Continuation::RecordVote {
                validator,
                request_id,
                vote,
            } => self.apply_vote(validator, request_id, vote, cx),
        }
    }

    /// A continuation's dependency will never be issued; run its
    /// cancellation path.
    fn run_abandoned(&mut self, continuation: Continuation, cx: &mut Cx) {
        match continuation {
            Continuation::Issue { block } => {
                let block_id = block.id();
                trace!(%block_id, "abandoning issuance");
                self.pending.remove(&block_id);
                self.metrics.num_blocked.set(self.pending.len() as i64);
                // Cancellation spreads over the whole issuance subtree.
                cx.signals.push_back(Signal::Abandon(block_id));
            }
            Continuation::Respond {
                validator,
                request_id,
            } => {
                trace!(%validator, %request_id, "dropping chits reply; queried block was never issued");
            }
            Continuation::RecordVote {
                validator,
                request_id,
                ..
            } => {
                // The vote is cancelled, but the poll still needs to hear
                // from this validator or it would never conclude.
                self.apply_vote(validator, request_id, None, cx);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Shared Helpers
    // ═══════════════════════════════════════════════════════════════════════════

    /// Look a block up: the pin set first, then recently dropped blocks,
    /// then the VM's storage.
    pub fn get_block(&mut self, block_id: BlockId) -> Result<Arc<dyn Block>, VmError> {
        if let Some(block) = self.processing.get(&block_id) {
            return Ok(Arc::clone(block));
        }
        if let Some(block) = self.dropped.get(&block_id) {
            return Ok(Arc::clone(block));
        }
        self.vm.get_block(block_id)
    }

    /// Pin a block in memory until it is decided or dropped.
    fn pin(&mut self, block: Arc<dyn Block>, declared_id: BlockId) {
        self.processing.insert(block.id(), block);
        self.dropped.pop(&declared_id);
        self.metrics
            .num_processing
            .set(self.processing.len() as i64);
    }

    fn guard(&self) -> Result<(), EngineError> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn surface(&mut self, cx: Cx) -> Result<Vec<Action>, EngineError> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(cx.actions),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    /// The block consensus currently prefers.
    pub fn preference(&self) -> BlockId {
        self.consensus.preference()
    }

    /// Number of blocks pinned in memory.
    pub fn num_processing(&self) -> usize {
        self.processing.len()
    }

    /// Number of blocks queued behind unissued ancestors.
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of continuations waiting on the blocker.
    pub fn num_blocked(&self) -> usize {
        self.blocked.len()
    }

    /// Number of outstanding block fetches.
    pub fn num_outstanding_requests(&self) -> usize {
        self.blk_reqs.len()
    }

    /// Number of queries in flight.
    pub fn num_polls(&self) -> usize {
        self.polls.len()
    }

    /// Whether a block is pinned in memory.
    pub fn is_processing(&self, block_id: &BlockId) -> bool {
        self.processing.contains_key(block_id)
    }

    /// Whether a block is queued for issuance.
    pub fn is_pending(&self, block_id: &BlockId) -> bool {
        self.pending.contains(block_id)
    }

    /// Whether a fetch for this block is outstanding.
    pub fn has_outstanding_request_for(&self, block_id: &BlockId) -> bool {
        self.blk_reqs.contains_block(block_id)
    }

    /// Whether the decided cache remembers this block.
    pub fn is_decided_cached(&self, block_id: &BlockId) -> bool {
        self.decided.peek(block_id).is_some()
    }

    /// Whether the dropped cache holds this block.
    pub fn is_dropped_cached(&self, block_id: &BlockId) -> bool {
        self.dropped.peek(block_id).is_some()
    }

    #[cfg(test)]
    fn seed_dropped(&mut self, block: Arc<dyn Block>) {
        self.dropped.put(block.id(), block);
    }
}
