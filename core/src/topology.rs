//! # Tree Topologies
//!
//! Both collectives route data along trees that every rank derives on its own
//! from `(rank, num_ranks, branching_factor)`. There is no coordinator and no
//! handshake: two ranks agree on an edge, and on which buffer and notification
//! slot it uses, only because they evaluate the same pure functions.
//!
//! ## Reduce tree
//!
//! Rank `r > 0` sends to `r mod p`, where `p` is the largest power of the
//! branching factor not exceeding `r`, i.e. `r` with its leading base-`b`
//! digit removed. With `b = 2` and 8 ranks:
//!
//! ```text
//!   1 -> 0   2 -> 0   4 -> 0
//!   3 -> 1   5 -> 1   6 -> 2   7 -> 3
//! ```
//!
//! Rank 0 is the sink. The shape mirrors a bit-interleaved reduction: leaves
//! are the ranks with the most significant digits.
//!
//! ## Broadcast tree
//!
//! A complete `b`-ary tree rooted at rank 0: rank `r` forwards to
//! `b*r + 1 ..= b*r + b`. The fan-out is chosen once per cluster size to
//! minimize `b * levels(b)`, an estimate of the worst-case hop latency.
//!
//! ## Buffer indices
//!
//! A rank numbers its write edges first, then its read edges, each in rank
//! order. [`EdgeLayout`] computes these local indices together with the index
//! the peer assigns to the same edge.

use crate::error::{CommError, Result};
use crate::transport::Rank;

/// Default fan-out of the reduce tree.
pub const REDUCE_BRANCHING_FACTOR: usize = 2;
/// Upper bound of the broadcast fan-out scan.
pub const MAX_BROADCAST_BRANCHING_FACTOR: usize = 100;

/// A deterministic tree over `num_ranks` ranks.
pub trait TreeTopology {
    fn num_ranks(&self) -> usize;

    fn branching_factor(&self) -> usize;

    /// Ranks that `rank` sends to.
    fn write_ranks(&self, rank: Rank) -> Vec<Rank>;

    /// Ranks that `rank` receives from.
    fn read_ranks(&self, rank: Rank) -> Vec<Rank>;
}

fn check_branching_factor(branching_factor: usize) -> Result<()> {
    if branching_factor < 2 {
        return Err(CommError::InvalidBranchingFactor(branching_factor));
    }
    Ok(())
}

/// The tree gradients are summed along; rank 0 is the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceTree {
    num_ranks: usize,
    branching_factor: usize,
}

impl ReduceTree {
    pub fn new(num_ranks: usize, branching_factor: usize) -> Result<Self> {
        check_branching_factor(branching_factor)?;
        Ok(Self {
            num_ranks,
            branching_factor,
        })
    }
}

impl TreeTopology for ReduceTree {
    fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    fn branching_factor(&self) -> usize {
        self.branching_factor
    }

    fn write_ranks(&self, rank: Rank) -> Vec<Rank> {
        if rank == 0 {
            return Vec::new();
        }
        let mut power = 1;
        while power * self.branching_factor <= rank {
            power *= self.branching_factor;
        }
        vec![rank % power]
    }

    fn read_ranks(&self, rank: Rank) -> Vec<Rank> {
        let mut ranks = Vec::new();
        let mut power = 1;
        while power < self.num_ranks {
            if power > rank {
                ranks.extend(
                    (1..self.branching_factor)
                        .map(|i| i * power + rank)
                        .filter(|&n| n < self.num_ranks),
                );
            }
            power *= self.branching_factor;
        }
        ranks
    }
}

/// The tree the model is replicated along; rank 0 is the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastTree {
    num_ranks: usize,
    branching_factor: usize,
}

impl BroadcastTree {
    /// Creates the tree with the fan-out that minimizes hop latency.
    pub fn new(num_ranks: usize) -> Self {
        Self {
            num_ranks,
            branching_factor: broadcast_branching_factor(num_ranks, MAX_BROADCAST_BRANCHING_FACTOR),
        }
    }

    /// Creates the tree with an explicit fan-out.
    pub fn with_branching_factor(num_ranks: usize, branching_factor: usize) -> Result<Self> {
        check_branching_factor(branching_factor)?;
        Ok(Self {
            num_ranks,
            branching_factor,
        })
    }
}

impl TreeTopology for BroadcastTree {
    fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    fn branching_factor(&self) -> usize {
        self.branching_factor
    }

    fn write_ranks(&self, rank: Rank) -> Vec<Rank> {
        (1..=self.branching_factor)
            .map(|i| self.branching_factor * rank + i)
            .filter(|&n| n < self.num_ranks)
            .collect()
    }

    fn read_ranks(&self, rank: Rank) -> Vec<Rank> {
        if rank == 0 {
            Vec::new()
        } else {
            vec![(rank - 1) / self.branching_factor]
        }
    }
}

/// Number of levels below the root a `branch`-ary tree needs for `num_ranks` nodes.
pub fn tree_levels(num_ranks: usize, branch: usize) -> usize {
    let mut levels = 0;
    let mut ranks_in_level = 1;
    let mut ranks_in_tree = 1;
    while ranks_in_tree < num_ranks {
        ranks_in_level *= branch;
        ranks_in_tree += ranks_in_level;
        levels += 1;
    }
    levels
}

/// Picks the broadcast fan-out in `[2, max_branch]` minimizing `b * levels(b)`.
///
/// Ties keep the smaller fan-out. A single rank gets 2.
pub fn broadcast_branching_factor(num_ranks: usize, max_branch: usize) -> usize {
    let mut best_hops = num_ranks;
    let mut best_branch = 2;
    for branch in 2..=max_branch {
        let hops = branch * tree_levels(num_ranks, branch);
        if hops < best_hops {
            best_hops = hops;
            best_branch = branch;
        }
    }
    best_branch
}

/// One tree edge as seen from the local rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub peer: Rank,
    /// Buffer index of this edge on the local rank.
    pub local_index: usize,
    /// Buffer index the peer assigns to the same edge.
    pub remote_index: usize,
}

/// Buffer-index assignment for every edge touching one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeLayout {
    pub writes: Vec<Edge>,
    pub reads: Vec<Edge>,
}

impl EdgeLayout {
    /// Computes the layout of `rank` and the matching indices at its peers.
    ///
    /// # Errors
    ///
    /// `RankOutOfRange` for a rank outside the cluster, `AsymmetricTopology` if
    /// a peer does not list `rank` on the opposite side of the edge.
    pub fn new<Tp: TreeTopology + ?Sized>(tree: &Tp, rank: Rank) -> Result<Self> {
        if rank >= tree.num_ranks() {
            return Err(CommError::RankOutOfRange {
                rank,
                num_ranks: tree.num_ranks(),
            });
        }
        let write_ranks = tree.write_ranks(rank);
        let read_ranks = tree.read_ranks(rank);

        let writes = write_ranks
            .iter()
            .enumerate()
            .map(|(i, &peer)| {
                let peer_writes = tree.write_ranks(peer).len();
                let position = tree
                    .read_ranks(peer)
                    .iter()
                    .position(|&r| r == rank)
                    .ok_or(CommError::AsymmetricTopology { rank, peer })?;
                Ok(Edge {
                    peer,
                    local_index: i,
                    remote_index: peer_writes + position,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let reads = read_ranks
            .iter()
            .enumerate()
            .map(|(i, &peer)| {
                let position = tree
                    .write_ranks(peer)
                    .iter()
                    .position(|&r| r == rank)
                    .ok_or(CommError::AsymmetricTopology { rank, peer })?;
                Ok(Edge {
                    peer,
                    local_index: write_ranks.len() + i,
                    remote_index: position,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { writes, reads })
    }

    /// Total number of buffers (and notification slots) the rank needs.
    pub fn len(&self) -> usize {
        self.writes.len() + self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.reads.is_empty()
    }
}
