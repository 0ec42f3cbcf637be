use asgd_comm::{Blob, CommConfig, DiffAggregator, LocalFabric, ModelDistributor, Transport};
use crossbeam::utils::Backoff;
use std::sync::Arc;

const LEN: usize = 10;

#[test]
fn test_collectives_with_one_thread_per_rank() {
    let world_size = 6;
    let iterations = 25;
    let fabric = LocalFabric::new(world_size);
    let mut config = CommConfig::default();
    config.diff.capacity = 16;

    crossbeam::scope(|s| {
        for transport in fabric.transports() {
            let config = config.clone();
            s.spawn(move |_| {
                let transport = Arc::new(transport);
                let rank = transport.rank();
                let mut aggregator =
                    DiffAggregator::<f32, _>::new(Arc::clone(&transport), &config).unwrap();
                let mut distributor =
                    ModelDistributor::new(Arc::clone(&transport), &config, &[0.0f32; LEN]).unwrap();
                // Every segment must exist before the first remote write.
                transport.barrier().unwrap();

                let backoff = Backoff::new();
                for _ in 0..iterations {
                    aggregator
                        .add_calculated_blob(Blob::filled(&[LEN], (rank + 1) as f32))
                        .unwrap();
                    while !aggregator.finished() {
                        aggregator.step().unwrap();
                        distributor.step().unwrap();
                        backoff.snooze();
                    }
                    backoff.reset();
                    let blobs = aggregator.reset();
                    if rank == 0 {
                        let expected = (world_size * (world_size + 1) / 2) as f32;
                        assert_eq!(blobs[0].data(), &[expected; LEN]);
                    }
                }

                if distributor.has_update_source() {
                    distributor.write_model(&[42.0; LEN]).unwrap();
                    distributor.update_model_on_root();
                    distributor.acknowledge().unwrap();
                } else {
                    while distributor.status() < 1 {
                        distributor.step().unwrap();
                        backoff.snooze();
                    }
                    let mut model = [0.0f32; LEN];
                    distributor.read_model(&mut model).unwrap();
                    assert_eq!(model, [42.0; LEN]);
                    distributor.acknowledge().unwrap();
                }
                while !distributor.complete().unwrap() {
                    distributor.step().unwrap();
                    backoff.snooze();
                }

                // Peers may still notify us until everyone is done.
                transport.barrier().unwrap();
            });
        }
    })
    .unwrap();
}
