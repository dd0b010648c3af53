//! Communication between the processes of a partitioned mesh.
//!
//! The assembler only needs a handful of collective operations: global reductions of scalars
//! and the exchange of small per-entity payloads with the processes that share border
//! degrees of freedom. [`SerialCommunicator`] covers the single-process case and
//! [`ThreadCommunicator`] connects several partitions living in the same process, one thread
//! per partition.
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::error::Error;
use std::fmt;
use std::ops::Add;

/// Associative and commutative combinator used by collective reductions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
}

impl ReduceOp {
    pub fn combine<V>(self, a: V, b: V) -> V
    where
        V: Copy + PartialOrd + Add<Output = V>,
    {
        match self {
            ReduceOp::Min => {
                if b < a {
                    b
                } else {
                    a
                }
            }
            ReduceOp::Max => {
                if b > a {
                    b
                } else {
                    a
                }
            }
            ReduceOp::Sum => a + b,
        }
    }
}

/// The degrees of freedom this process shares with a single neighboring process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BorderNeighbor {
    pub rank: usize,
    /// Local indices of the shared degrees of freedom.
    ///
    /// Both processes must list the shared degrees of freedom in the same order.
    pub dofs: Vec<usize>,
}

/// The interior/border communication interface of a process.
///
/// Only degrees of freedom on the border between partitions are listed; pure ghost
/// entities do not take part in the exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BorderInterface {
    neighbors: Vec<BorderNeighbor>,
}

impl BorderInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_neighbor(mut self, rank: usize, dofs: Vec<usize>) -> Self {
        self.neighbors.push(BorderNeighbor { rank, dofs });
        self
    }

    pub fn neighbors(&self) -> &[BorderNeighbor] {
        &self.neighbors
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    /// The peer went away before the collective operation completed.
    Disconnected { peer: usize },
    /// A communication interface refers to a rank outside of the communicator.
    UnknownRank { rank: usize, size: usize },
    /// The peer sent a message of a different kind than the current collective operation expects.
    UnexpectedMessage { peer: usize },
    /// The peer sent a payload whose length does not match the shared interface.
    PayloadSizeMismatch { peer: usize, expected: usize, actual: usize },
    /// The peer sent a payload that could not be decoded.
    InvalidPayload { peer: usize },
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommError::Disconnected { peer } => write!(f, "rank {} disconnected during a collective operation", peer),
            CommError::UnknownRank { rank, size } => {
                write!(f, "rank {} is not part of a communicator of size {}", rank, size)
            }
            CommError::UnexpectedMessage { peer } => write!(f, "unexpected message kind from rank {}", peer),
            CommError::PayloadSizeMismatch { peer, expected, actual } => write!(
                f,
                "rank {} sent {} entries, but the border interface has {}",
                peer, actual, expected
            ),
            CommError::InvalidPayload { peer } => write!(f, "rank {} sent an invalid payload", peer),
        }
    }
}

impl Error for CommError {}

/// Collective communication between the processes of a partitioned mesh.
///
/// Every method is collective: all processes must call the same methods in the same order.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn all_reduce_f64(&self, value: f64, op: ReduceOp) -> Result<f64, CommError>;

    fn all_reduce_usize(&self, value: usize, op: ReduceOp) -> Result<usize, CommError>;

    /// Sends `outgoing[k]` to the `k`-th neighbor of the interface and returns the payloads
    /// received from the neighbors, in the same order.
    fn exchange_border(&self, interface: &BorderInterface, outgoing: Vec<Vec<u8>>)
        -> Result<Vec<Vec<u8>>, CommError>;
}

/// Communicator for a mesh that is not partitioned.
#[derive(Debug, Copy, Clone, Default)]
pub struct SerialCommunicator;

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_f64(&self, value: f64, _op: ReduceOp) -> Result<f64, CommError> {
        Ok(value)
    }

    fn all_reduce_usize(&self, value: usize, _op: ReduceOp) -> Result<usize, CommError> {
        Ok(value)
    }

    fn exchange_border(
        &self,
        interface: &BorderInterface,
        _outgoing: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, CommError> {
        match interface.neighbors().first() {
            Some(neighbor) => Err(CommError::UnknownRank {
                rank: neighbor.rank,
                size: 1,
            }),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug)]
enum Message {
    Scalar(f64),
    Count(usize),
    Payload(Vec<u8>),
}

/// Communicator connecting partitions that run on separate threads of the same process.
///
/// Every ordered pair of ranks has its own channel, so messages between two ranks are
/// received in the order they were sent.
#[derive(Debug)]
pub struct ThreadCommunicator {
    rank: usize,
    // Indexed by destination rank
    senders: Vec<Sender<Message>>,
    // Indexed by source rank
    receivers: Vec<Receiver<Message>>,
}

impl ThreadCommunicator {
    /// Creates `size` connected communicators. The communicator at index `i` has rank `i`.
    pub fn create_group(size: usize) -> Vec<Self> {
        let mut senders: Vec<Vec<_>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut receivers: Vec<Vec<_>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        for source in 0..size {
            for destination in 0..size {
                let (sender, receiver) = unbounded();
                senders[source].push(sender);
                receivers[destination].push(receiver);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| Self {
                rank,
                senders,
                receivers,
            })
            .collect()
    }

    fn check_peer(&self, peer: usize) -> Result<(), CommError> {
        if peer >= self.size() || peer == self.rank {
            Err(CommError::UnknownRank {
                rank: peer,
                size: self.size(),
            })
        } else {
            Ok(())
        }
    }

    fn send(&self, destination: usize, message: Message) -> Result<(), CommError> {
        self.senders[destination]
            .send(message)
            .map_err(|_| CommError::Disconnected { peer: destination })
    }

    fn receive(&self, source: usize) -> Result<Message, CommError> {
        self.receivers[source]
            .recv()
            .map_err(|_| CommError::Disconnected { peer: source })
    }

    /// Sends the value to every other rank and combines all values in rank order,
    /// so that every rank obtains the same result.
    fn all_reduce<V>(
        &self,
        value: V,
        op: ReduceOp,
        wrap: impl Fn(V) -> Message,
        unwrap: impl Fn(Message) -> Option<V>,
    ) -> Result<V, CommError>
    where
        V: Copy + PartialOrd + Add<Output = V>,
    {
        for peer in (0..self.size()).filter(|&peer| peer != self.rank) {
            self.send(peer, wrap(value))?;
        }

        let mut result = None;
        for source in 0..self.size() {
            let contribution = if source == self.rank {
                value
            } else {
                unwrap(self.receive(source)?).ok_or(CommError::UnexpectedMessage { peer: source })?
            };
            result = Some(match result {
                Some(acc) => op.combine(acc, contribution),
                None => contribution,
            });
        }
        Ok(result.unwrap_or(value))
    }
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn all_reduce_f64(&self, value: f64, op: ReduceOp) -> Result<f64, CommError> {
        self.all_reduce(value, op, Message::Scalar, |message| match message {
            Message::Scalar(x) => Some(x),
            _ => None,
        })
    }

    fn all_reduce_usize(&self, value: usize, op: ReduceOp) -> Result<usize, CommError> {
        self.all_reduce(value, op, Message::Count, |message| match message {
            Message::Count(x) => Some(x),
            _ => None,
        })
    }

    fn exchange_border(
        &self,
        interface: &BorderInterface,
        outgoing: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, CommError> {
        assert_eq!(
            outgoing.len(),
            interface.neighbors().len(),
            "Need exactly one outgoing payload per neighbor."
        );
        for neighbor in interface.neighbors() {
            self.check_peer(neighbor.rank)?;
        }

        // Channels are unbounded, so sending everything before receiving cannot deadlock
        for (neighbor, payload) in interface.neighbors().iter().zip(outgoing) {
            self.send(neighbor.rank, Message::Payload(payload))?;
        }

        interface
            .neighbors()
            .iter()
            .map(|neighbor| match self.receive(neighbor.rank)? {
                Message::Payload(payload) => Ok(payload),
                _ => Err(CommError::UnexpectedMessage { peer: neighbor.rank }),
            })
            .collect()
    }
}
