//! Loop-back communicator for single-rank runs.

use super::{CommError, Communicator, Result};

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// A size-1 communicator. Messages sent to rank 0 are queued locally so
/// self-addressed traffic from generic collective code still works.
#[derive(Debug, Default)]
pub struct SoloCommunicator {
    loopback: Mutex<HashMap<u64, VecDeque<Vec<u8>>>>,
}

impl SoloCommunicator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Communicator for SoloCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, to: usize, tag: u64, payload: Vec<u8>) -> Result<()> {
        if to != 0 {
            return Err(CommError::RankOutOfRange { rank: to, size: 1 });
        }
        self.loopback
            .lock()
            .expect("loopback queue poisoned")
            .entry(tag)
            .or_default()
            .push_back(payload);
        Ok(())
    }

    fn recv(&self, from: usize, tag: u64) -> Result<Vec<u8>> {
        if from != 0 {
            return Err(CommError::RankOutOfRange { rank: from, size: 1 });
        }
        self.loopback
            .lock()
            .expect("loopback queue poisoned")
            .get_mut(&tag)
            .and_then(VecDeque::pop_front)
            .ok_or(CommError::Disconnected {
                rank: 0,
                operation: "recv",
            })
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}
