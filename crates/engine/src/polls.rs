//! In-flight query tracking.

use snowline_types::{Bag, BlockId, RequestId, ValidatorId};
use std::collections::HashMap;
use tracing::debug;

/// One outstanding pull or push query.
#[derive(Debug)]
struct Poll {
    /// Validators we are still waiting on. A weighted sample may contain a
    /// validator more than once; each instance is one expected response.
    polled: Bag<ValidatorId>,
    /// Votes received so far.
    votes: Bag<BlockId>,
}

impl Poll {
    /// A poll finishes when every polled validator answered, when some block
    /// already has an α-majority, or when the responses still outstanding can
    /// no longer produce one.
    fn finished(&self, alpha: usize) -> bool {
        let remaining = self.polled.len();
        let received = self.votes.len();
        let freq = self.votes.mode().map(|(_, freq)| freq).unwrap_or(0);
        remaining == 0 || freq >= alpha || received + remaining < alpha
    }
}

/// The set of queries whose responses the engine is still collecting.
#[derive(Debug)]
pub struct PollSet {
    alpha: usize,
    polls: HashMap<RequestId, Poll>,
}

impl PollSet {
    /// Create an empty set with the given quorum threshold.
    pub fn new(alpha: usize) -> Self {
        PollSet {
            alpha,
            polls: HashMap::new(),
        }
    }

    /// Number of polls in flight.
    pub fn len(&self) -> usize {
        self.polls.len()
    }

    /// Whether no polls are in flight.
    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }

    /// Start tracking a poll. Returns false if the request ID is already in
    /// use, in which case nothing is tracked.
    pub fn add(&mut self, request_id: RequestId, validators: Bag<ValidatorId>) -> bool {
        if self.polls.contains_key(&request_id) {
            debug!(%request_id, "dropping poll with duplicate request id");
            return false;
        }
        self.polls.insert(
            request_id,
            Poll {
                polled: validators,
                votes: Bag::new(),
            },
        );
        true
    }

    /// Apply a validator's vote.
    ///
    /// Returns the accumulated vote bag if this response concluded the poll.
    pub fn vote(
        &mut self,
        request_id: RequestId,
        validator: ValidatorId,
        vote: BlockId,
    ) -> Option<Bag<BlockId>> {
        let poll = match self.polls.get_mut(&request_id) {
            Some(poll) => poll,
            None => {
                debug!(%validator, %request_id, "vote for unknown poll");
                return None;
            }
        };
        if !poll.polled.remove_one(&validator) {
            debug!(%validator, %request_id, "vote from unpolled validator");
            return None;
        }
        poll.votes.add(vote);
        self.conclude(request_id)
    }

    /// Record that a validator failed to respond.
    ///
    /// Returns the accumulated vote bag if this failure concluded the poll.
    pub fn drop_vote(
        &mut self,
        request_id: RequestId,
        validator: ValidatorId,
    ) -> Option<Bag<BlockId>> {
        let poll = match self.polls.get_mut(&request_id) {
            Some(poll) => poll,
            None => {
                debug!(%validator, %request_id, "dropped vote for unknown poll");
                return None;
            }
        };
        if !poll.polled.remove_one(&validator) {
            debug!(%validator, %request_id, "dropped vote from unpolled validator");
            return None;
        }
        self.conclude(request_id)
    }

    fn conclude(&mut self, request_id: RequestId) -> Option<Bag<BlockId>> {
        let finished = self
            .polls
            .get(&request_id)
            .map(|poll| poll.finished(self.alpha))
            .unwrap_or(false);
        if !finished {
            return None;
        }
        self.polls.remove(&request_id).map(|poll| poll.votes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_id(seed: u8) -> BlockId {
        BlockId::new([seed; 32])
    }

    fn bag_of(validators: &[u64]) -> Bag<ValidatorId> {
        validators.iter().map(|v| ValidatorId(*v)).collect()
    }

    #[test]
    fn test_poll_concludes_when_all_answer() {
        let mut polls = PollSet::new(2);
        assert!(polls.add(RequestId(1), bag_of(&[1, 2])));
        assert_eq!(polls.len(), 1);

        assert!(polls.vote(RequestId(1), ValidatorId(1), block_id(1)).is_none());
        let votes = polls
            .vote(RequestId(1), ValidatorId(2), block_id(1))
            .expect("second response should conclude the poll");
        assert_eq!(votes.count(&block_id(1)), 2);
        assert!(polls.is_empty());
    }

    #[test]
    fn test_poll_terminates_early_on_quorum() {
        let mut polls = PollSet::new(2);
        polls.add(RequestId(1), bag_of(&[1, 2, 3]));

        assert!(polls.vote(RequestId(1), ValidatorId(1), block_id(1)).is_none());
        // Second matching vote reaches alpha with one validator still pending.
        let votes = polls
            .vote(RequestId(1), ValidatorId(2), block_id(1))
            .expect("alpha majority should conclude the poll");
        assert_eq!(votes.len(), 2);
    }

    #[test]
    fn test_poll_terminates_early_when_quorum_unreachable() {
        let mut polls = PollSet::new(2);
        polls.add(RequestId(1), bag_of(&[1, 2, 3]));

        // Two validators left can still produce alpha = 2 votes.
        assert!(polls.drop_vote(RequestId(1), ValidatorId(1)).is_none());
        // One validator left cannot.
        let votes = polls
            .drop_vote(RequestId(1), ValidatorId(2))
            .expect("unreachable quorum should conclude the poll");
        assert!(votes.is_empty());
    }

    #[test]
    fn test_repeated_validator_consumes_one_instance_per_vote() {
        let mut polls = PollSet::new(3);
        polls.add(RequestId(1), bag_of(&[1, 1, 2]));

        assert!(polls.vote(RequestId(1), ValidatorId(1), block_id(1)).is_none());
        assert!(polls.vote(RequestId(1), ValidatorId(1), block_id(1)).is_none());
        let votes = polls
            .vote(RequestId(1), ValidatorId(2), block_id(1))
            .expect("all instances answered");
        assert_eq!(votes.count(&block_id(1)), 3);
    }

    #[test]
    fn test_vote_from_unpolled_validator_is_ignored() {
        let mut polls = PollSet::new(1);
        polls.add(RequestId(1), bag_of(&[1]));

        assert!(polls.vote(RequestId(1), ValidatorId(9), block_id(1)).is_none());
        assert_eq!(polls.len(), 1);
    }

    #[test]
    fn test_vote_for_unknown_poll_is_ignored() {
        let mut polls = PollSet::new(1);
        assert!(polls.vote(RequestId(42), ValidatorId(1), block_id(1)).is_none());
    }

    #[test]
    fn test_duplicate_request_id_rejected() {
        let mut polls = PollSet::new(1);
        assert!(polls.add(RequestId(1), bag_of(&[1])));
        assert!(!polls.add(RequestId(1), bag_of(&[2])));
        assert_eq!(polls.len(), 1);
    }
}
