use asgd_comm::transport::{FabricConfig, LocalTransport};
use asgd_comm::{CommConfig, CommError, LocalFabric, ModelDistributor};
use std::sync::Arc;

const LEN: usize = 6;

fn cluster(n: usize, config: &CommConfig) -> Vec<ModelDistributor<f32, LocalTransport>> {
    let fabric = LocalFabric::new(n);
    fabric
        .transports()
        .into_iter()
        .map(|t| ModelDistributor::new(Arc::new(t), config, &[0.0; LEN]).unwrap())
        .collect()
}

fn step_all(ranks: &mut [ModelDistributor<f32, LocalTransport>]) {
    for dist in ranks.iter_mut() {
        dist.step().unwrap();
    }
}

#[test]
fn test_single_version_reaches_every_rank() {
    let mut ranks = cluster(9, &CommConfig::default());
    ranks[0].write_model(&[1.5; LEN]).unwrap();
    assert!(ranks[0].update_model_on_root());

    let mut rounds = 0;
    while ranks.iter().any(|d| d.status() < 1) {
        step_all(&mut ranks);
        rounds += 1;
        assert!(rounds < 100);
    }
    for dist in &ranks {
        let mut out = [0.0; LEN];
        dist.read_model(&mut out).unwrap();
        assert_eq!(out, [1.5; LEN]);
    }
}

#[test]
fn test_versions_arrive_in_order_with_matching_data() {
    let mut config = CommConfig::default();
    config.model.branching_factor = Some(2);
    let n = 11;
    let last = 20u64;
    let mut ranks = cluster(n, &config);
    let mut seen = vec![0u64; n];
    let mut published = 0u64;

    let mut rounds = 0;
    while published < last || seen.iter().any(|&s| s < last) || !ranks[0].complete().unwrap() {
        if published < last && ranks[0].complete().unwrap() {
            published += 1;
            ranks[0].write_model(&[published as f32; LEN]).unwrap();
            ranks[0].update_model_on_root();
            ranks[0].acknowledge().unwrap();
            seen[0] = published;
        }
        step_all(&mut ranks);

        for (rank, dist) in ranks.iter_mut().enumerate().skip(1) {
            let status = dist.status();
            if status > seen[rank] {
                let mut out = [0.0; LEN];
                dist.read_model(&mut out).unwrap();
                assert_eq!(out, [status as f32; LEN], "rank {rank} read a torn model");
                seen[rank] = status;
                dist.acknowledge().unwrap();
            }
        }
        rounds += 1;
        assert!(rounds < 10_000, "broadcast stalled: {:?}", ranks[0]);
    }
    // Every hop had to wait for the previous version to be acknowledged.
    for dist in &ranks {
        assert_eq!(dist.acknowledgement_total(), last);
        assert_eq!(dist.status_completed(), last);
    }
}

#[test]
fn test_root_waits_for_slowest_subtree() {
    let mut ranks = cluster(3, &CommConfig::default());
    ranks[0].write_model(&[2.0; LEN]).unwrap();
    ranks[0].update_model_on_root();
    ranks[0].acknowledge().unwrap();
    step_all(&mut ranks);

    // Only rank 1 acknowledges.
    ranks[1].acknowledge().unwrap();
    step_all(&mut ranks);
    assert!(!ranks[0].complete().unwrap());
    assert_eq!(ranks[0].producers()[0].acknowledged_by_remote(), 1);
    assert_eq!(ranks[0].producers()[1].acknowledged_by_remote(), 0);

    ranks[2].acknowledge().unwrap();
    step_all(&mut ranks);
    assert!(ranks[0].complete().unwrap());
}

#[test]
fn test_child_holds_back_until_acknowledged() {
    let mut ranks = cluster(2, &CommConfig::default());
    for version in 1..=3 {
        ranks[0].write_model(&[version as f32; LEN]).unwrap();
        ranks[0].update_model_on_root();
        step_all(&mut ranks);
    }
    // Version 1 went out; versions 2 and 3 wait for the acknowledgement.
    assert_eq!(ranks[1].status(), 1);
    assert_eq!(ranks[0].producers()[0].started_sending(), 1);

    ranks[1].acknowledge().unwrap();
    step_all(&mut ranks);
    step_all(&mut ranks);
    assert_eq!(ranks[1].status(), 3);
    let mut out = [0.0; LEN];
    ranks[1].read_model(&mut out).unwrap();
    assert_eq!(out, [3.0; LEN]);
}

#[test]
fn test_version_overflow_is_fatal() {
    let fabric = LocalFabric::with_config(
        2,
        FabricConfig {
            notification_max: 3,
            ..FabricConfig::default()
        },
    );
    let mut ranks: Vec<ModelDistributor<f32, _>> = fabric
        .transports()
        .into_iter()
        .map(|t| ModelDistributor::new(Arc::new(t), &CommConfig::default(), &[0.0]).unwrap())
        .collect();

    let mut result = Ok(());
    for _ in 0..4 {
        ranks[0].update_model_on_root();
        result = ranks[0].step();
        if result.is_err() {
            break;
        }
        ranks[1].step().unwrap();
        ranks[1].acknowledge().unwrap();
    }
    assert!(matches!(result, Err(CommError::VersionOverflow(3))));
}

#[test]
fn test_too_few_notification_ids_is_fatal() {
    let fabric = LocalFabric::with_config(
        2,
        FabricConfig {
            notification_slots: 1000,
            ..FabricConfig::default()
        },
    );
    let transport = Arc::new(fabric.transport(0).unwrap());
    let result = ModelDistributor::<f32, _>::new(transport, &CommConfig::default(), &[0.0; 4]);
    assert!(matches!(
        result,
        Err(CommError::NotificationIdsExhausted { base: 1000, needed: 1, available: 1000 })
    ));
}
