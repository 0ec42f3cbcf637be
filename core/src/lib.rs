//! # asgd-comm
//!
//! `asgd-comm` is the communication substrate for asynchronous data-parallel
//! training over one-sided remote memory.
//!
//! Two collectives run side by side, both driven by a polling loop that calls
//! `step()` between compute steps:
//!
//! - [`DiffAggregator`]: sums gradient blobs up a reduce tree to rank 0.
//! - [`ModelDistributor`]: replicates the parameters from rank 0 down a
//!   broadcast tree, one acknowledged version at a time.
//!
//! Neither ever blocks on a peer. Data moves through flow-controlled
//! [ring channels](ring) and is signalled through notification slots of the
//! [`Transport`].
//!
//! ## Modules
//!
//! - [`transport`]: the one-sided primitive and the in-process [`LocalFabric`].
//! - [`topology`]: reduce and broadcast tree shapes, buffer indices.
//! - [`ring`]: single-producer single-consumer streams between two ranks.
//! - [`aggregator`], [`distributor`]: the two collectives.
//! - [`data`]: per-rank batch sources.
//!
//! ## Example
//!
//! ```rust
//! use asgd_comm::{Blob, CommConfig, DiffAggregator, LocalFabric};
//! use std::sync::Arc;
//!
//! let fabric = LocalFabric::new(2);
//! let mut config = CommConfig::default();
//! config.diff.capacity = 64;
//!
//! let mut ranks: Vec<DiffAggregator<f32, _>> = fabric
//!     .transports()
//!     .into_iter()
//!     .map(|t| DiffAggregator::new(Arc::new(t), &config).unwrap())
//!     .collect();
//! for agg in ranks.iter_mut() {
//!     agg.add_calculated_blob(Blob::filled(&[4], 1.0)).unwrap();
//! }
//! while !ranks.iter().all(|a| a.finished()) {
//!     for agg in ranks.iter_mut() {
//!         agg.step().unwrap();
//!     }
//! }
//! assert_eq!(ranks[0].blob(0).unwrap().data(), &[2.0; 4]);
//! ```

pub mod aggregator;
pub mod blob;
pub mod config;
pub mod data;
pub mod distributor;
pub mod error;
pub mod ring;
pub mod topology;
pub mod transport;

pub use aggregator::DiffAggregator;
pub use blob::{Blob, Element};
pub use config::{CommConfig, DiffConfig, ModelConfig};
pub use distributor::{ModelDistributor, Version};
pub use error::{CommError, OrAbort, Result};
pub use topology::{BroadcastTree, EdgeLayout, ReduceTree, TreeTopology};
pub use transport::{LocalFabric, LocalTransport, Transport, TransportError};
