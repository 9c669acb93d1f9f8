//! Test utilities.

use crate::{Block, BlockError, BlockId, Status};
use std::sync::{Arc, Mutex};

/// Create a deterministic block ID from a seed byte.
pub fn test_id(seed: u8) -> BlockId {
    BlockId::new([seed; 32])
}

/// A scriptable block for tests.
///
/// Status lives behind a mutex so `accept`/`reject` can work through the
/// `&self` receivers that `Arc<dyn Block>` sharing requires.
pub struct TestBlock {
    id: BlockId,
    parent: BlockId,
    height: u64,
    bytes: Vec<u8>,
    status: Mutex<Status>,
    verify_error: Option<String>,
    options: Mutex<Option<[Arc<dyn Block>; 2]>>,
}

impl TestBlock {
    /// Create a processing block with deterministic bytes derived from `seed`.
    pub fn new(seed: u8, parent: BlockId, height: u64) -> Self {
        TestBlock {
            id: test_id(seed),
            parent,
            height,
            bytes: vec![seed; 8],
            status: Mutex::new(Status::Processing),
            verify_error: None,
            options: Mutex::new(None),
        }
    }

    /// Replace the block's serialized form.
    pub fn with_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.bytes = bytes;
        self
    }

    /// Set the initial status.
    pub fn with_status(self, status: Status) -> Self {
        *self.status.lock().unwrap() = status;
        self
    }

    /// Make `verify` fail with the given message.
    pub fn with_verify_error(mut self, message: &str) -> Self {
        self.verify_error = Some(message.to_string());
        self
    }

    /// Turn this block into an oracle with the given child options.
    pub fn with_options(self, options: [Arc<dyn Block>; 2]) -> Self {
        *self.options.lock().unwrap() = Some(options);
        self
    }

    /// Finish construction, wrapping in an `Arc`.
    pub fn build(self) -> Arc<TestBlock> {
        Arc::new(self)
    }
}

impl Block for TestBlock {
    fn id(&self) -> BlockId {
        self.id
    }

    fn parent(&self) -> BlockId {
        self.parent
    }

    fn height(&self) -> u64 {
        self.height
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    fn verify(&self) -> Result<(), BlockError> {
        match &self.verify_error {
            Some(message) => Err(BlockError::Verification(message.clone())),
            None => Ok(()),
        }
    }

    fn accept(&self) -> Result<(), BlockError> {
        let mut status = self.status.lock().unwrap();
        if status.is_decided() {
            return Err(BlockError::Transition(format!(
                "accept on already {status} block"
            )));
        }
        *status = Status::Accepted;
        Ok(())
    }

    fn reject(&self) -> Result<(), BlockError> {
        let mut status = self.status.lock().unwrap();
        if status.is_decided() {
            return Err(BlockError::Transition(format!(
                "reject on already {status} block"
            )));
        }
        *status = Status::Rejected;
        Ok(())
    }

    fn options(&self) -> Option<[Arc<dyn Block>; 2]> {
        self.options.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_lifecycle() {
        let genesis = test_id(0);
        let blk = TestBlock::new(1, genesis, 1).build();

        assert_eq!(blk.status(), Status::Processing);
        assert!(blk.verify().is_ok());
        blk.accept().unwrap();
        assert_eq!(blk.status(), Status::Accepted);
        assert!(blk.accept().is_err());
    }

    #[test]
    fn test_scripted_verify_failure() {
        let blk = TestBlock::new(2, test_id(0), 1).with_verify_error("bad state root");
        assert!(matches!(blk.verify(), Err(BlockError::Verification(_))));
    }

    #[test]
    fn test_oracle_options() {
        let oracle_id = test_id(3);
        let left = TestBlock::new(4, oracle_id, 2).build();
        let right = TestBlock::new(5, oracle_id, 2).build();
        let oracle = TestBlock::new(3, test_id(0), 1).with_options([left, right]);

        let options = oracle.options().expect("oracle should expose options");
        assert_eq!(options[0].parent(), oracle_id);
        assert_eq!(options[1].parent(), oracle_id);
    }
}
