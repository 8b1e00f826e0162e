//! A communicator that wires ranks together over channels.
//!
//! `ThreadedCommunicator::create(n)` returns one handle per rank; each
//! handle is moved onto its own thread, which then runs the same SPMD code a
//! separate process would. Sends go through unbounded channels and never
//! block, so the deterministic collective patterns used by reslice and halo
//! exchange cannot deadlock.

use super::{CommError, Communicator, Result};

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Mutex};

type Envelope = (usize, u64, Vec<u8>);

pub struct ThreadedCommunicator {
    rank: usize,
    size: usize,
    /// Senders into every rank's inbox, indexed by destination.
    peers: Vec<Sender<Envelope>>,
    inbox: Mutex<Inbox>,
    barrier: Arc<Barrier>,
}

struct Inbox {
    receiver: Receiver<Envelope>,
    /// Messages taken off the channel while waiting for a different
    /// (source, tag) pair.
    stash: HashMap<(usize, u64), VecDeque<Vec<u8>>>,
}

impl ThreadedCommunicator {
    /// Builds a fully connected set of `size` rank handles.
    pub fn create(size: usize) -> Vec<ThreadedCommunicator> {
        assert!(size > 0, "communicator needs at least one rank");
        let mut senders = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        let barrier = Arc::new(Barrier::new(size));
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| ThreadedCommunicator {
                rank,
                size,
                peers: senders.clone(),
                inbox: Mutex::new(Inbox {
                    receiver,
                    stash: HashMap::new(),
                }),
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }
}

impl std::fmt::Debug for ThreadedCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ThreadedCommunicator {{ rank: {}, size: {} }}",
            self.rank, self.size
        )
    }
}

impl Communicator for ThreadedCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, to: usize, tag: u64, payload: Vec<u8>) -> Result<()> {
        let sender = self.peers.get(to).ok_or(CommError::RankOutOfRange {
            rank: to,
            size: self.size,
        })?;
        sender
            .send((self.rank, tag, payload))
            .map_err(|_| CommError::Disconnected {
                rank: to,
                operation: "send",
            })
    }

    fn recv(&self, from: usize, tag: u64) -> Result<Vec<u8>> {
        if from >= self.size {
            return Err(CommError::RankOutOfRange {
                rank: from,
                size: self.size,
            });
        }
        let mut inbox = self.inbox.lock().expect("inbox poisoned");
        if let Some(queue) = inbox.stash.get_mut(&(from, tag)) {
            if let Some(payload) = queue.pop_front() {
                return Ok(payload);
            }
        }
        loop {
            let (src, msg_tag, payload) =
                inbox.receiver.recv().map_err(|_| CommError::Disconnected {
                    rank: from,
                    operation: "recv",
                })?;
            if src == from && msg_tag == tag {
                return Ok(payload);
            }
            inbox
                .stash
                .entry((src, msg_tag))
                .or_default()
                .push_back(payload);
        }
    }

    fn barrier(&self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }
}
