use asgd_comm::transport::{FabricConfig, LocalTransport};
use asgd_comm::{Blob, CommConfig, CommError, DiffAggregator, LocalFabric};
use rand::Rng;
use std::sync::Arc;

fn config(capacity: usize) -> CommConfig {
    let mut config = CommConfig::default();
    config.diff.capacity = capacity;
    config
}

fn cluster(n: usize, capacity: usize) -> Vec<DiffAggregator<f64, LocalTransport>> {
    let fabric = LocalFabric::new(n);
    fabric
        .transports()
        .into_iter()
        .map(|t| DiffAggregator::new(Arc::new(t), &config(capacity)).unwrap())
        .collect()
}

/// Steps all ranks round-robin until every one reports completion.
fn run(ranks: &mut [DiffAggregator<f64, LocalTransport>]) {
    let mut rounds = 0;
    while !ranks.iter().all(|a| a.finished()) {
        for agg in ranks.iter_mut() {
            agg.step().unwrap();
        }
        rounds += 1;
        assert!(rounds < 1_000_000, "aggregation stalled");
    }
}

#[test]
fn test_three_ranks_wrapping_blob() {
    // Capacity 16 with blobs of 10: the second iteration wraps every ring.
    let mut ranks = cluster(3, 16);
    for _ in 0..3 {
        for (r, agg) in ranks.iter_mut().enumerate() {
            agg.add_calculated_blob(Blob::filled(&[10], (r + 1) as f64)).unwrap();
        }
        run(&mut ranks);
        assert_eq!(ranks[0].blob(0).unwrap().data(), &[6.0; 10]);
        for agg in ranks.iter_mut() {
            agg.reset();
        }
    }
}

#[test]
fn test_single_blob_sum() {
    let n = 6;
    let mut ranks = cluster(n, 64);
    for (r, agg) in ranks.iter_mut().enumerate() {
        agg.add_calculated_blob(Blob::from_vec(vec![r as f64; 7])).unwrap();
    }
    run(&mut ranks);
    let expected = (0..n).sum::<usize>() as f64;
    assert_eq!(ranks[0].blob(0).unwrap().data(), &[expected; 7]);
}

#[test]
fn test_thousand_blobs_sum() {
    let n = 5;
    let mut ranks = cluster(n, 32);
    for (r, agg) in ranks.iter_mut().enumerate() {
        for i in 0..1000 {
            agg.add_calculated_blob(Blob::filled(&[3], (r * 1000 + i) as f64)).unwrap();
        }
    }
    run(&mut ranks);
    for i in 0..1000 {
        let expected: f64 = (0..n).map(|r| (r * 1000 + i) as f64).sum();
        assert_eq!(ranks[0].blob(i).unwrap().data(), &[expected; 3], "blob {i}");
    }
}

#[test]
fn test_blobs_arriving_between_steps() {
    let n = 8;
    let mut ranks = cluster(n, 20);
    let mut rng = rand::rng();
    let lengths: Vec<usize> = (0..12).map(|_| rng.random_range(1..20)).collect();

    for &len in &lengths {
        for (r, agg) in ranks.iter_mut().enumerate() {
            agg.add_calculated_blob(Blob::filled(&[len], 1.0 + r as f64)).unwrap();
            agg.step().unwrap();
        }
    }
    run(&mut ranks);
    let expected = (1..=n).sum::<usize>() as f64;
    for (i, &len) in lengths.iter().enumerate() {
        assert_eq!(ranks[0].blob(i).unwrap().data(), vec![expected; len].as_slice());
    }
}

#[test]
fn test_parent_forwards_only_folded_blobs() {
    // Rank 1 reads from rank 3 and writes to rank 0.
    let mut ranks = cluster(4, 16);
    for agg in ranks.iter_mut().take(3) {
        agg.add_calculated_blob(Blob::filled(&[4], 1.0)).unwrap();
    }
    ranks[1].step().unwrap();
    assert!(!ranks[1].read_finished(0));
    assert!(!ranks[1].finished());

    ranks[3].add_calculated_blob(Blob::filled(&[4], 1.0)).unwrap();
    ranks[3].step().unwrap();
    ranks[1].step().unwrap();
    assert!(ranks[1].read_finished(0));
    assert!(ranks[1].finished());
    assert_eq!(ranks[1].blob(0).unwrap().data(), &[2.0; 4]);
}

#[test]
fn test_capacity_beyond_notification_range_is_fatal() {
    let fabric = LocalFabric::with_config(
        2,
        FabricConfig {
            notification_max: 255,
            ..FabricConfig::default()
        },
    );
    let transport = Arc::new(fabric.transport(0).unwrap());
    let result = DiffAggregator::<f32, _>::new(transport, &config(256));
    assert!(matches!(
        result,
        Err(CommError::CapacityExceedsNotificationRange { capacity: 256, max: 255 })
    ));
}

#[test]
fn test_too_few_notification_ids_is_fatal() {
    let fabric = LocalFabric::with_config(
        3,
        FabricConfig {
            notification_slots: 8,
            ..FabricConfig::default()
        },
    );
    let mut config = config(16);
    config.diff.notification_base = 7;
    let transport = Arc::new(fabric.transport(0).unwrap());
    let result = DiffAggregator::<f32, _>::new(transport, &config);
    assert!(matches!(
        result,
        Err(CommError::NotificationIdsExhausted { base: 7, needed: 2, available: 8 })
    ));
}
