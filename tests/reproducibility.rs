//! Cross-partition reproducibility of the distributed summation.
//!
//! The oracle throughout is `canopy::tree::reference_sum`, the scalar fold
//! with the canonical index-tree pairing. Every distributed result must
//! match it bit for bit — not approximately.

use canopy::tree::reference_sum;
use canopy::{
    BinaryTreeSummation, CanopyConfig, DualTreeSummation, MemoryTransport, Region, ReduceMode,
    Transport,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Scatter `values` per `regions` and run one dual-tree reduction on every
/// rank of an in-process cluster. Returns each rank's result.
async fn run_dual_tree(values: &[f64], regions: &[Region], config: CanopyConfig) -> Vec<f64> {
    let mut handles = Vec::new();
    for transport in MemoryTransport::cluster(regions.len() as u32) {
        let rank = transport.rank() as usize;
        let regions = regions.to_vec();
        let local: Vec<f64> =
            values[regions[rank].start as usize..regions[rank].end() as usize].to_vec();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let mut summation = DualTreeSummation::new(Arc::new(transport), &regions, config)
                .await
                .expect("construction");
            summation.buffer_mut().copy_from_slice(&local);
            summation.accumulate().await.expect("accumulate")
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.expect("rank task"));
    }
    results
}

/// Same scatter, single-tree driver.
async fn run_binary_tree(values: &[f64], regions: &[Region]) -> Vec<f64> {
    let mut handles = Vec::new();
    for transport in MemoryTransport::cluster(regions.len() as u32) {
        let rank = transport.rank() as usize;
        let regions = regions.to_vec();
        let local: Vec<f64> =
            values[regions[rank].start as usize..regions[rank].end() as usize].to_vec();
        handles.push(tokio::spawn(async move {
            let mut summation =
                BinaryTreeSummation::new(Arc::new(transport), &regions, CanopyConfig::default())
                    .expect("construction");
            summation.buffer_mut().copy_from_slice(&local);
            summation.accumulate().await.expect("accumulate")
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.expect("rank task"));
    }
    results
}

/// Even split with the remainder on the first ranks.
fn distribute_evenly(n: u64, p: u32) -> Vec<Region> {
    let per_rank = n / p as u64;
    let remainder = n % p as u64;
    let mut regions = Vec::with_capacity(p as usize);
    let mut start = 0u64;
    for r in 0..p as u64 {
        let count = if r < remainder { per_rank + 1 } else { per_rank };
        regions.push(Region::new(start, count));
        start += count;
    }
    regions
}

/// Random split points, then a shuffle so rank order and array order
/// disagree.
fn distribute_randomly(n: u64, p: u32, rng: &mut StdRng) -> Vec<Region> {
    let mut points: Vec<u64> = (1..p).map(|_| rng.gen_range(0..=n)).collect();
    points.push(0);
    points.push(n);
    points.sort_unstable();

    let mut regions: Vec<Region> = points
        .windows(2)
        .map(|w| Region::new(w[0], w[1] - w[0]))
        .collect();
    regions.shuffle(rng);
    regions
}

fn assert_all_bits(results: &[f64], expected: f64, context: &str) {
    for (rank, r) in results.iter().enumerate() {
        assert_eq!(
            r.to_bits(),
            expected.to_bits(),
            "{context}: rank {rank} returned {r:e}, expected {expected:e}"
        );
    }
}

#[tokio::test]
async fn test_simple_sum_keeps_the_ulp() {
    let eps = f64::EPSILON;
    let values = [1e3, eps, eps / 2.0, eps / 2.0];
    // The naive left fold loses the two half-epsilons.
    let naive: f64 = values.iter().sum();
    assert_eq!(naive, 1e3 + eps);

    let expected = (1e3 + eps) + (eps / 2.0 + eps / 2.0);
    let regions = [Region::new(0, 2), Region::new(2, 2)];
    let results = run_dual_tree(&values, &regions, CanopyConfig::default()).await;
    assert_all_bits(&results, expected, "simple sum");
    assert_ne!(results[0].to_bits(), naive.to_bits());
}

#[tokio::test]
async fn test_works_with_empty_region_at_rank_zero() {
    // Rank 0 owns nothing; rank 1 is promoted to the front of array order.
    let values = [1.0, 2.0, 3.0, 4.0];
    let regions = [Region::new(0, 0), Region::new(0, 4)];
    let results = run_dual_tree(&values, &regions, CanopyConfig::default()).await;
    assert_all_bits(&results, (1.0 + 2.0) + (3.0 + 4.0), "empty rank 0");
}

#[tokio::test]
async fn test_single_process_matches_pairwise_tree() {
    let values: Vec<f64> = (0..8).map(|i| (i as f64).exp()).collect();
    let results = run_dual_tree(&values, &[Region::new(0, 8)], CanopyConfig::default()).await;
    assert_all_bits(&results, reference_sum(&values), "single process");
}

#[tokio::test]
async fn test_equal_three_way_split_of_nine() {
    let values: Vec<f64> = (0..9).map(|i| 1.0 / (1.0 + i as f64)).collect();
    let expected = reference_sum(&values);
    let results = run_dual_tree(&values, &distribute_evenly(9, 3), CanopyConfig::default()).await;
    assert_all_bits(&results, expected, "9 over 3");
}

#[tokio::test]
async fn test_shuffled_regions_non_monotonic_rank_order() {
    let mut rng = StdRng::seed_from_u64(42);
    let values: Vec<f64> = (0..30).map(|_| rng.gen_range(0.0..1.0) - 0.5).collect();
    let expected = reference_sum(&values);

    let regions = distribute_randomly(30, 4, &mut rng);
    let results = run_dual_tree(&values, &regions, CanopyConfig::default()).await;
    assert_all_bits(&results, expected, "shuffled regions");
}

#[tokio::test]
async fn test_fuzzed_partitions_match_reference() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for array_no in 0..8 {
        let len: usize = rng.gen_range(0..=20);
        let values: Vec<f64> = (0..len).map(|_| rng.gen_range(0.0..1.0)).collect();
        let expected = reference_sum(&values);

        for distribution_no in 0..6 {
            let p: u32 = rng.gen_range(1..=4);
            let regions = distribute_randomly(len as u64, p, &mut rng);
            let results = run_dual_tree(&values, &regions, CanopyConfig::default()).await;
            assert_all_bits(
                &results,
                expected,
                &format!("array {array_no}, distribution {distribution_no}, p {p}"),
            );
        }
    }
}

#[tokio::test]
async fn test_partition_order_independence() {
    // Two physical layouts with the same array-order region sequence must
    // produce the same bits.
    let mut rng = StdRng::seed_from_u64(7);
    let values: Vec<f64> = (0..17).map(|_| rng.gen_range(0.0..1.0) * 1e6).collect();

    let forward = [Region::new(0, 9), Region::new(9, 8)];
    let swapped = [Region::new(9, 8), Region::new(0, 9)];

    let a = run_dual_tree(&values, &forward, CanopyConfig::default()).await;
    let b = run_dual_tree(&values, &swapped, CanopyConfig::default()).await;
    assert_eq!(a[0].to_bits(), b[0].to_bits());
    assert_eq!(a[0].to_bits(), reference_sum(&values).to_bits());
}

#[tokio::test]
async fn test_accumulate_is_idempotent() {
    let values: Vec<f64> = (0..11).map(|i| (i as f64) * 0.1 + f64::EPSILON).collect();
    let regions = distribute_evenly(11, 3);

    let mut handles = Vec::new();
    for transport in MemoryTransport::cluster(3) {
        let rank = transport.rank() as usize;
        let regions = regions.clone();
        let local: Vec<f64> =
            values[regions[rank].start as usize..regions[rank].end() as usize].to_vec();
        handles.push(tokio::spawn(async move {
            let mut summation =
                DualTreeSummation::new(Arc::new(transport), &regions, CanopyConfig::default())
                    .await
                    .expect("construction");
            summation.buffer_mut().copy_from_slice(&local);
            let first = summation.accumulate().await.expect("first accumulate");
            let second = summation.accumulate().await.expect("second accumulate");
            (first, second)
        }));
    }
    for handle in handles {
        let (first, second) = handle.await.expect("rank task");
        assert_eq!(first.to_bits(), second.to_bits());
        assert_eq!(first.to_bits(), reference_sum(&values).to_bits());
    }
}

#[tokio::test]
async fn test_boundary_sizes() {
    // N = 1: the result is exactly A[0], whatever the rank count.
    let values = [0.1 + f64::EPSILON];
    let regions = [Region::new(0, 1), Region::new(1, 0), Region::new(1, 0)];
    let results = run_dual_tree(&values, &regions, CanopyConfig::default()).await;
    assert_all_bits(&results, values[0], "n=1");

    // N = 0: the result is 0.0.
    let regions = [Region::new(0, 0), Region::new(0, 0)];
    let results = run_dual_tree(&[], &regions, CanopyConfig::default()).await;
    assert_all_bits(&results, 0.0, "n=0");
}

#[tokio::test]
async fn test_reduce_only_mode() {
    let values = [1.5, 2.5, 3.5, 4.5];
    let regions = distribute_evenly(4, 2);
    let config = CanopyConfig {
        reduce_mode: ReduceMode::ReduceOnly,
        ..CanopyConfig::default()
    };
    let results = run_dual_tree(&values, &regions, config).await;
    assert_eq!(results[0].to_bits(), reference_sum(&values).to_bits());
    assert_eq!(results[1], 0.0);
}

#[tokio::test]
async fn test_from_local_size_builds_rank_order_layout() {
    let values: Vec<f64> = (0..10).map(|i| (i as f64).sqrt()).collect();
    let counts = [4u64, 3, 3];
    let expected = reference_sum(&values);

    let mut handles = Vec::new();
    for transport in MemoryTransport::cluster(3) {
        let rank = transport.rank() as usize;
        let start: u64 = counts[..rank].iter().sum();
        let local: Vec<f64> =
            values[start as usize..(start + counts[rank]) as usize].to_vec();
        handles.push(tokio::spawn(async move {
            let mut summation = DualTreeSummation::from_local_size(
                Arc::new(transport),
                local.len() as u64,
                CanopyConfig::default(),
            )
            .await
            .expect("construction");
            summation.buffer_mut().copy_from_slice(&local);
            summation.accumulate().await.expect("accumulate")
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.expect("rank task").to_bits(), expected.to_bits());
    }
}

#[tokio::test]
async fn test_binary_tree_agrees_with_dual_tree() {
    let mut rng = StdRng::seed_from_u64(0xbead);
    for _ in 0..5 {
        let len: usize = rng.gen_range(1..=20);
        let values: Vec<f64> = (0..len).map(|_| rng.gen_range(0.0..1.0) * 100.0).collect();
        let p: u32 = rng.gen_range(1..=3);
        let regions = distribute_evenly(len as u64, p);

        let dual = run_dual_tree(&values, &regions, CanopyConfig::default()).await;
        let single = run_binary_tree(&values, &regions).await;
        let expected = reference_sum(&values);
        assert_all_bits(&dual, expected, "dual tree");
        assert_all_bits(&single, expected, "binary tree");
    }
}

#[tokio::test]
async fn test_binary_tree_shuffled_regions() {
    let mut rng = StdRng::seed_from_u64(99);
    let values: Vec<f64> = (0..23).map(|_| rng.gen_range(0.0..1.0)).collect();
    let regions = distribute_randomly(23, 3, &mut rng);
    let results = run_binary_tree(&values, &regions).await;
    assert_all_bits(&results, reference_sum(&values), "binary tree shuffled");
}
