//! End-to-end scenarios for the transitive engine.
//!
//! These tests drive a full engine against in-memory collaborators and
//! assert on the actions it emits. Everything runs synchronously: a "round
//! trip" is the test feeding a response event built from the engine's own
//! previous actions.

use prometheus::Registry;
use snowline_core::test_utils::{FixedValidators, MockConsensus, MockVm};
use snowline_core::Action;
use snowline_engine::{Config, EngineState};
use snowline_types::test_utils::{test_id, TestBlock};
use snowline_types::{Block, BlockId, RequestId, Status, ValidatorId};
use std::sync::Arc;
use tracing_test::traced_test;

struct Harness {
    engine: EngineState,
    vm: Arc<MockVm>,
    genesis: Arc<TestBlock>,
}

/// A network of `k` validators with quorum `alpha` and one repoll slot,
/// bootstrapped onto an accepted genesis block.
fn network(k: usize, alpha: usize) -> Harness {
    let vm = Arc::new(MockVm::new());
    let genesis = TestBlock::new(0, BlockId::ZERO, 0)
        .with_status(Status::Accepted)
        .build();
    vm.insert_block(genesis.clone());
    vm.set_last_accepted(genesis.id());

    let members: Vec<ValidatorId> = (0..k as u64).map(ValidatorId).collect();
    let config = Config::default()
        .with_k(k)
        .with_alpha(alpha)
        .with_concurrent_repolls(1);
    let mut engine = EngineState::new(
        config,
        vm.clone(),
        Arc::new(FixedValidators::new(members)),
        Box::new(MockConsensus::new(alpha)),
        &Registry::new(),
    )
    .expect("fresh registry never collides");
    engine
        .finish_bootstrapping()
        .expect("bootstrap handoff should succeed");

    Harness {
        engine,
        vm,
        genesis,
    }
}

fn sent_gets(actions: &[Action]) -> Vec<(ValidatorId, RequestId, BlockId)> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::SendGet {
                to,
                request_id,
                block_id,
            } => Some((*to, *request_id, *block_id)),
            _ => None,
        })
        .collect()
}

fn sent_chits(actions: &[Action]) -> Vec<(ValidatorId, RequestId, Vec<BlockId>)> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::SendChits {
                to,
                request_id,
                votes,
            } => Some((*to, *request_id, votes.clone())),
            _ => None,
        })
        .collect()
}

fn push_queries(actions: &[Action]) -> Vec<(Vec<ValidatorId>, RequestId, BlockId)> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::SendPushQuery {
                to,
                request_id,
                block_id,
                ..
            } => Some((to.clone(), *request_id, *block_id)),
            _ => None,
        })
        .collect()
}

fn pull_queries(actions: &[Action]) -> Vec<(Vec<ValidatorId>, RequestId, BlockId)> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::SendPullQuery {
                to,
                request_id,
                block_id,
            } => Some((to.clone(), *request_id, *block_id)),
            _ => None,
        })
        .collect()
}

/// The working-set invariants that must hold at rest, checked over a known
/// universe of block IDs.
fn assert_invariants(engine: &EngineState, universe: &[BlockId]) {
    for id in universe {
        assert!(
            !(engine.is_pending(id) && engine.is_decided_cached(id)),
            "{id:?} is both pending and decided"
        );
        if engine.has_outstanding_request_for(id) {
            assert!(
                !engine.is_processing(id),
                "{id:?} is requested while already held"
            );
            assert!(
                !engine.is_decided_cached(id),
                "{id:?} is requested while already decided"
            );
        }
    }
}

/// A peer push-queries a block on the accepted tip; quorum chits accept it.
///
/// ```text
/// PushQuery(A) → issue A → push-sample → Chits{A} × alpha → A accepted
/// ```
#[traced_test]
#[test]
fn simple_accept() {
    let mut h = network(3, 2);
    let a = TestBlock::new(1, h.genesis.id(), 1).build();
    h.vm.insert_parseable(a.clone());

    let actions = h
        .engine
        .on_push_query(ValidatorId(9), RequestId(1), a.id(), a.bytes())
        .unwrap();

    // The block went into consensus and out to the network.
    let pushes = push_queries(&actions);
    assert_eq!(pushes.len(), 1);
    let (queried, poll_rid, _) = pushes[0].clone();
    assert_eq!(queried.len(), 3);
    assert_eq!(
        sent_chits(&actions),
        vec![(ValidatorId(9), RequestId(1), vec![a.id()])]
    );
    assert!(h.engine.is_processing(&a.id()));

    // First chit: no quorum yet, nothing decided.
    let actions = h.engine.on_chits(queried[0], poll_rid, &[a.id()]).unwrap();
    assert!(actions.is_empty());
    assert_eq!(a.status(), Status::Processing);

    // Second chit reaches alpha: the poll concludes and A is accepted.
    let actions = h.engine.on_chits(queried[1], poll_rid, &[a.id()]).unwrap();
    assert_eq!(a.status(), Status::Accepted);
    assert!(h.engine.is_decided_cached(&a.id()));
    assert!(!h.engine.is_processing(&a.id()));
    assert_eq!(h.engine.num_processing(), 0);
    assert_eq!(h.engine.preference(), a.id());
    assert_eq!(h.vm.preference(), Some(a.id()));

    // Consensus finalized, so no repoll is issued.
    assert!(pull_queries(&actions).is_empty());
    assert_invariants(&h.engine, &[h.genesis.id(), a.id()]);
}

/// A pull query names a block three ancestors deep; the engine fetches the
/// chain block by block and answers once the whole branch is issued.
///
/// ```text
/// PullQuery(C) → Get(C) → Put(C) → Get(B) → Put(B) → Get(A) → Put(A)
///   → deliver A, B, C → Chits{C}
/// ```
#[traced_test]
#[test]
fn dependency_chain_resolves_rootward() {
    let mut h = network(1, 1);
    let peer = ValidatorId(0);
    let a = TestBlock::new(1, h.genesis.id(), 1).build();
    let b = TestBlock::new(2, a.id(), 2).build();
    let c = TestBlock::new(3, b.id(), 3).build();
    for blk in [&a, &b, &c] {
        h.vm.insert_parseable(blk.clone());
    }

    // Only the query names C; we have nothing, so we ask for it.
    let actions = h.engine.on_pull_query(peer, RequestId(7), c.id()).unwrap();
    let (_, rid_c, asked) = sent_gets(&actions)[0];
    assert_eq!(asked, c.id());

    // C arrives but B is missing: C queues behind B.
    let actions = h.engine.on_put(peer, rid_c, c.id(), c.bytes()).unwrap();
    let (_, rid_b, asked) = sent_gets(&actions)[0];
    assert_eq!(asked, b.id());
    assert!(h.engine.is_pending(&c.id()));

    // B arrives but A is missing: B queues behind A.
    let actions = h.engine.on_put(peer, rid_b, b.id(), b.bytes()).unwrap();
    let (_, rid_a, asked) = sent_gets(&actions)[0];
    assert_eq!(asked, a.id());
    assert_invariants(&h.engine, &[a.id(), b.id(), c.id()]);

    // A arrives on the accepted tip: the cascade delivers A, then B, then C,
    // and the original query is finally answered.
    let actions = h.engine.on_put(peer, rid_a, a.id(), a.bytes()).unwrap();
    let pushed: Vec<BlockId> = push_queries(&actions).iter().map(|q| q.2).collect();
    assert_eq!(pushed, vec![a.id(), b.id(), c.id()]);
    assert_eq!(
        sent_chits(&actions),
        vec![(peer, RequestId(7), vec![c.id()])]
    );

    assert_eq!(h.engine.num_pending(), 0);
    assert_eq!(h.engine.num_blocked(), 0);
    assert_eq!(h.engine.num_outstanding_requests(), 0);
    assert_eq!(h.engine.preference(), c.id());
    for blk in [&a, &b, &c] {
        assert!(h.engine.is_processing(&blk.id()));
    }
    assert_invariants(&h.engine, &[a.id(), b.id(), c.id()]);
}

/// A block whose ancestor fails verification never reaches consensus, and
/// neither does anything queued behind it.
///
/// ```text
/// PushQuery(B) → Get(A) → Put(A: invalid) → drop A → abandon B → no chits
/// ```
#[traced_test]
#[test]
fn verify_failure_propagates_to_descendants() {
    let mut h = network(1, 1);
    let peer = ValidatorId(0);
    let a = TestBlock::new(1, h.genesis.id(), 1)
        .with_verify_error("bad state root")
        .build();
    let b = TestBlock::new(2, a.id(), 2).build();
    h.vm.insert_parseable(a.clone());
    h.vm.insert_parseable(b.clone());

    let actions = h
        .engine
        .on_push_query(peer, RequestId(5), b.id(), b.bytes())
        .unwrap();
    let (_, rid_a, _) = sent_gets(&actions)[0];
    assert!(h.engine.is_pending(&b.id()));

    let actions = h.engine.on_put(peer, rid_a, a.id(), a.bytes()).unwrap();

    // A was invalidated, B's issuance was cancelled, the query stays silent.
    assert!(sent_chits(&actions).is_empty());
    assert!(push_queries(&actions).is_empty());
    assert!(h.engine.is_dropped_cached(&a.id()));
    assert!(!h.engine.is_processing(&a.id()));
    assert!(!h.engine.is_pending(&b.id()));
    assert_eq!(h.engine.num_blocked(), 0);
    assert_eq!(a.status(), Status::Processing);
    assert_eq!(h.engine.preference(), h.genesis.id());
    assert_invariants(&h.engine, &[a.id(), b.id()]);
}

/// Bootstrapping into an oracle block delivers both options so the engine
/// comes up preferring one of them.
#[traced_test]
#[test]
fn oracle_bootstrap_delivers_options() {
    let vm = Arc::new(MockVm::new());
    let oracle_id = test_id(3);
    let o1 = TestBlock::new(4, oracle_id, 1).build();
    let o2 = TestBlock::new(5, oracle_id, 1).build();
    let oracle = TestBlock::new(3, BlockId::ZERO, 0)
        .with_status(Status::Accepted)
        .with_options([o1.clone(), o2.clone()])
        .build();
    vm.insert_block(oracle.clone());
    vm.set_last_accepted(oracle.id());

    let members: Vec<ValidatorId> = (0..2).map(ValidatorId).collect();
    let config = Config::default()
        .with_k(2)
        .with_alpha(2)
        .with_concurrent_repolls(1);
    let mut engine = EngineState::new(
        config,
        vm.clone(),
        Arc::new(FixedValidators::new(members)),
        Box::new(MockConsensus::new(2)),
        &Registry::new(),
    )
    .unwrap();

    let actions = engine.finish_bootstrapping().unwrap();

    // Both options were verified, added, and pushed to the network.
    let pushed: Vec<BlockId> = push_queries(&actions).iter().map(|q| q.2).collect();
    assert_eq!(pushed, vec![o1.id(), o2.id()]);
    assert_eq!(engine.preference(), o1.id());
    assert_eq!(vm.preference(), Some(o1.id()));
    assert!(engine.is_bootstrapped());
    assert_eq!(engine.num_pending(), 0);
}

/// A query for a long-decided block is answered straight from the decided
/// cache, without touching the VM.
#[traced_test]
#[test]
fn decided_cache_answers_old_queries() {
    let mut h = network(3, 2);
    let a = TestBlock::new(1, h.genesis.id(), 1).build();
    h.vm.insert_parseable(a.clone());

    // Accept A through a full poll round.
    let actions = h
        .engine
        .on_push_query(ValidatorId(9), RequestId(1), a.id(), a.bytes())
        .unwrap();
    let (queried, poll_rid, _) = push_queries(&actions)[0].clone();
    h.engine.on_chits(queried[0], poll_rid, &[a.id()]).unwrap();
    h.engine.on_chits(queried[1], poll_rid, &[a.id()]).unwrap();
    assert_eq!(a.status(), Status::Accepted);

    // The VM has since pruned the block; the decided cache still answers.
    h.vm.remove_block(&a.id());
    let actions = h
        .engine
        .on_pull_query(ValidatorId(7), RequestId(9), a.id())
        .unwrap();
    assert_eq!(sent_chits(&actions).len(), 1);
    assert!(sent_gets(&actions).is_empty());
    assert_eq!(h.engine.num_blocked(), 0);
}

/// A failed fetch cancels the entire issuance subtree waiting on it: queued
/// descendants, and the vote deferred behind them.
///
/// ```text
/// pending: B ← C,  voter waits on C
/// GetFailed(A) → abandon A → abandon B → abandon C → voter resolves empty
/// ```
#[traced_test]
#[test]
fn get_failed_abandons_transitively() {
    let mut h = network(1, 1);
    let peer = ValidatorId(0);
    let a = TestBlock::new(1, h.genesis.id(), 1).build();
    let b = TestBlock::new(2, a.id(), 2).build();
    let c = TestBlock::new(3, b.id(), 3).build();
    h.vm.insert_parseable(b.clone());
    h.vm.insert_parseable(c.clone());

    // C arrives unsolicited, queues behind B; B arrives, queues behind A.
    let actions = h
        .engine
        .on_put(peer, RequestId(40), c.id(), c.bytes())
        .unwrap();
    let (_, rid_b, _) = sent_gets(&actions)[0];
    let actions = h.engine.on_put(peer, rid_b, b.id(), b.bytes()).unwrap();
    let (_, rid_a, _) = sent_gets(&actions)[0];

    // A vote for C parks behind C's issuance.
    h.engine
        .on_chits(ValidatorId(0), RequestId(99), &[c.id()])
        .unwrap();
    assert_eq!(h.engine.num_pending(), 2);
    assert_eq!(h.engine.num_blocked(), 3);

    // A never arrives: everything queued behind it unwinds.
    let actions = h.engine.on_get_failed(peer, rid_a).unwrap();
    assert!(actions.is_empty());
    assert_eq!(h.engine.num_pending(), 0);
    assert_eq!(h.engine.num_blocked(), 0);
    assert_eq!(h.engine.num_outstanding_requests(), 0);
    assert_invariants(&h.engine, &[a.id(), b.id(), c.id()]);
}

/// A poll whose validators all fail concludes without a quorum; the engine
/// keeps the block and repolls.
#[traced_test]
#[test]
fn failed_poll_repolls() {
    let mut h = network(2, 2);
    let a = TestBlock::new(1, h.genesis.id(), 1).build();
    h.vm.insert_parseable(a.clone());

    let actions = h
        .engine
        .on_push_query(ValidatorId(9), RequestId(1), a.id(), a.bytes())
        .unwrap();
    let (queried, poll_rid, _) = push_queries(&actions)[0].clone();

    let actions = h.engine.on_query_failed(queried[0], poll_rid).unwrap();
    // One failure makes alpha unreachable (k = alpha = 2): the poll
    // concludes undecided and a repoll goes out for the still-preferred A.
    let repolls = pull_queries(&actions);
    assert_eq!(repolls.len(), 1);
    assert_eq!(repolls[0].2, a.id());
    assert_eq!(a.status(), Status::Processing);
    assert!(h.engine.is_processing(&a.id()));
    assert_eq!(h.engine.num_polls(), 1);
}

/// Competing children of the same parent: the quorum winner is accepted and
/// the loser is rejected in the same batch.
#[traced_test]
#[test]
fn conflicting_branch_is_rejected() {
    let mut h = network(3, 2);
    let a = TestBlock::new(1, h.genesis.id(), 1).build();
    let rival = TestBlock::new(2, h.genesis.id(), 1).build();
    h.vm.insert_parseable(a.clone());
    h.vm.insert_parseable(rival.clone());

    h.engine
        .on_push_query(ValidatorId(9), RequestId(1), a.id(), a.bytes())
        .unwrap();
    let actions = h
        .engine
        .on_push_query(ValidatorId(9), RequestId(2), rival.id(), rival.bytes())
        .unwrap();
    let (queried, poll_rid, _) = push_queries(&actions)[0].clone();

    // Quorum for A on the rival's poll: A is accepted, the rival rejected.
    h.engine.on_chits(queried[0], poll_rid, &[a.id()]).unwrap();
    h.engine.on_chits(queried[1], poll_rid, &[a.id()]).unwrap();

    assert_eq!(a.status(), Status::Accepted);
    assert_eq!(rival.status(), Status::Rejected);
    assert!(h.engine.is_decided_cached(&a.id()));
    assert!(h.engine.is_decided_cached(&rival.id()));
    assert_eq!(h.engine.num_processing(), 0);
    assert_eq!(h.engine.preference(), a.id());
    assert_invariants(&h.engine, &[h.genesis.id(), a.id(), rival.id()]);
}

/// The VM builds a block; the engine issues it and queries the network.
#[traced_test]
#[test]
fn locally_built_block_is_issued() {
    let mut h = network(1, 1);
    let b = TestBlock::new(2, h.genesis.id(), 1).build();
    h.vm.insert_block(b.clone());
    h.vm.queue_build(b.clone());

    let actions = h.engine.handle(snowline_core::Event::PendingTransactions).unwrap();

    let pushed: Vec<BlockId> = push_queries(&actions).iter().map(|q| q.2).collect();
    assert_eq!(pushed, vec![b.id()]);
    assert!(h.engine.is_processing(&b.id()));
    assert_eq!(h.engine.preference(), b.id());
    assert_invariants(&h.engine, &[h.genesis.id(), b.id()]);
}
