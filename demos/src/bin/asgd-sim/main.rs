//! Simulated asynchronous SGD cluster.
//!
//! Every rank runs on its own thread over a shared [`LocalFabric`]. Ranks
//! compute toy gradients for a stack of layers, the [`DiffAggregator`] sums
//! them at rank 0, rank 0 applies an SGD step and the [`ModelDistributor`]
//! pushes the new parameters back down. Workers never wait for the newest
//! model: they train on whatever version they last picked up.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=asgd_sim=info,asgd_comm=debug asgd-sim --ranks 8 --iterations 200
//!
//! # Shared settings from a file, ring capacity overridden on the command line
//! asgd-sim --config cluster.toml --capacity 4096
//! ```

use anyhow::{ensure, Context, Result};
use asgd_comm::data::{BatchSource, RandomSampler, ShardedBatches};
use asgd_comm::{
    Blob, CommConfig, CommError, DiffAggregator, LocalFabric, LocalTransport, ModelDistributor, OrAbort,
    Transport, Version,
};
use clap::Parser;
use crossbeam::utils::Backoff;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(name = "asgd-sim")]
#[command(about = "Run a simulated asynchronous data-parallel training loop")]
#[command(version)]
struct Args {
    /// Number of simulated ranks
    #[arg(short, long, default_value_t = 4)]
    ranks: usize,

    /// Training iterations per rank
    #[arg(short, long, default_value_t = 100)]
    iterations: usize,

    /// Parameters per layer
    #[arg(long, default_value_t = 256)]
    len: usize,

    /// Number of layers (one gradient blob each)
    #[arg(long, default_value_t = 4)]
    layers: usize,

    /// Samples drawn per step
    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    #[arg(long, default_value_t = 0.2)]
    learning_rate: f32,

    /// TOML file with the communication settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Ring capacity per tree edge, in elements
    #[arg(long)]
    capacity: Option<usize>,
}

const TARGET: f32 = 1.0;
const DATASET_LEN: usize = 4096;
const SEED: u64 = 0x5eed;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    ensure!(args.ranks > 0, "at least one rank is required");

    let mut config = match &args.config {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            CommConfig::from_toml_str(&source)?
        }
        None => CommConfig::default(),
    };
    if let Some(capacity) = args.capacity {
        config.diff.capacity = capacity;
    }
    config.validate()?;
    ensure!(
        args.len < config.diff.capacity,
        "layer size {} does not fit a ring of capacity {}",
        args.len,
        config.diff.capacity
    );

    let mut rng = rand::rng();
    let dataset: Vec<f32> = (0..DATASET_LEN)
        .map(|_| TARGET + rng.random_range(-0.5..0.5))
        .collect();

    tracing::info!(
        ranks = args.ranks,
        iterations = args.iterations,
        layers = args.layers,
        len = args.len,
        capacity = config.diff.capacity,
        "starting simulation"
    );

    let fabric = LocalFabric::new(args.ranks);
    crossbeam::scope(|s| {
        for transport in fabric.transports() {
            let args = args.clone();
            let config = config.clone();
            let dataset = dataset.clone();
            s.spawn(move |_| run_rank(transport, &args, &config, dataset));
        }
    })
    .map_err(|_| anyhow::anyhow!("a rank panicked"))?;

    tracing::info!("simulation finished");
    Ok(())
}

/// Everything one rank owns.
struct Rank {
    transport: Arc<LocalTransport>,
    aggregator: DiffAggregator<f32, LocalTransport>,
    distributor: ModelDistributor<f32, LocalTransport>,
    model: Vec<f32>,
    seen: Version,
    backoff: Backoff,
}

impl Rank {
    fn is_root(&self) -> bool {
        self.distributor.has_update_source()
    }

    /// One spin of the polling loop: advance both collectives and adopt a
    /// newer model if one arrived.
    fn poll(&mut self) {
        self.aggregator.step().or_abort();
        self.distributor.step().or_abort();
        if !self.is_root() && self.distributor.status() > self.seen {
            self.distributor.read_model(&mut self.model).or_abort();
            self.seen = self.distributor.status();
            self.distributor.acknowledge().or_abort();
            tracing::debug!(version = self.seen, "adopted model");
        }
    }

    fn spin_until(&mut self, mut done: impl FnMut(&mut Self) -> bool) {
        self.backoff.reset();
        while !done(self) {
            self.poll();
            self.backoff.snooze();
        }
    }
}

fn run_rank(transport: LocalTransport, args: &Args, config: &CommConfig, dataset: Vec<f32>) {
    let transport = Arc::new(transport);
    let rank = transport.rank();
    let _span = tracing::info_span!("rank", rank).entered();
    let num_ranks = transport.num_ranks();
    let size = args.layers * args.len;

    let model = vec![0.0; size];
    let mut state = Rank {
        aggregator: DiffAggregator::new(Arc::clone(&transport), config).or_abort(),
        distributor: ModelDistributor::new(Arc::clone(&transport), config, &model).or_abort(),
        transport,
        model,
        seen: 0,
        backoff: Backoff::new(),
    };
    let mut batches = ShardedBatches::new(
        dataset,
        &RandomSampler::seeded(SEED),
        args.batch_size,
        rank,
        num_ranks,
    );
    state.transport.barrier().map_err(CommError::from).or_abort();

    for iteration in 0..args.iterations {
        let batch = batches.next_batch();
        let mean = batch.iter().sum::<f32>() / batch.len().max(1) as f32;

        // Backpropagation order: last layer first.
        for layer in (0..args.layers).rev() {
            let weights = &state.model[layer * args.len..(layer + 1) * args.len];
            let grad = weights.iter().map(|w| w - mean).collect();
            state.aggregator.add_calculated_blob(Blob::from_vec(grad)).or_abort();
            state.poll();
        }
        state.spin_until(|s| s.aggregator.finished());
        let gradients = state.aggregator.reset();

        if state.is_root() {
            state.spin_until(|s| s.distributor.complete().or_abort());
            apply_sgd(&mut state.model, &gradients, args, num_ranks);
            state.distributor.write_model(&state.model).or_abort();
            state.distributor.update_model_on_root();
            state.distributor.acknowledge().or_abort();
            state.seen = state.distributor.status();

            if iteration % 10 == 0 || iteration + 1 == args.iterations {
                let loss = state.model.iter().map(|w| (w - TARGET).powi(2)).sum::<f32>() / size as f32;
                tracing::info!(iteration, version = state.seen, loss, "applied update");
            }
        }
    }

    // The root published one version per iteration; wait until all of them
    // made it through our subtree.
    let last = args.iterations as Version;
    state.spin_until(|s| s.seen >= last && s.distributor.complete().or_abort());
    tracing::debug!(distributor = ?state.distributor, "done");

    // Peers may still address our segments until everyone is here.
    state.transport.barrier().map_err(CommError::from).or_abort();
}

/// `model -= lr * mean(gradients)`, layer by layer.
fn apply_sgd(model: &mut [f32], gradients: &[Blob<f32>], args: &Args, num_ranks: usize) {
    let scale = args.learning_rate / num_ranks as f32;
    // Blobs were registered last layer first.
    for (blob, layer) in gradients.iter().zip((0..args.layers).rev()) {
        let weights = &mut model[layer * args.len..(layer + 1) * args.len];
        for (w, g) in weights.iter_mut().zip(blob.data()) {
            *w -= scale * g;
        }
    }
}
