use asgd_comm::topology::{broadcast_branching_factor, tree_levels};
use asgd_comm::{BroadcastTree, EdgeLayout, ReduceTree, TreeTopology};

/// Every edge is listed on both ends and the buffer indices agree.
fn check_mutual_inverse<Tp: TreeTopology>(tree: &Tp) {
    let n = tree.num_ranks();
    let layouts: Vec<EdgeLayout> = (0..n).map(|r| EdgeLayout::new(tree, r).unwrap()).collect();

    for rank in 0..n {
        for &w in &tree.write_ranks(rank) {
            assert!(tree.read_ranks(w).contains(&rank), "{rank} -> {w} not mirrored");
        }
        for &r in &tree.read_ranks(rank) {
            assert!(tree.write_ranks(r).contains(&rank), "{r} -> {rank} not mirrored");
        }

        for edge in &layouts[rank].writes {
            let mirror = layouts[edge.peer]
                .reads
                .iter()
                .find(|e| e.peer == rank)
                .unwrap();
            assert_eq!(mirror.local_index, edge.remote_index);
            assert_eq!(mirror.remote_index, edge.local_index);
        }
    }
}

/// Following parents from any rank reaches rank 0.
fn check_rooted<Tp: TreeTopology>(tree: &Tp, parent: impl Fn(&Tp, usize) -> Vec<usize>) {
    for start in 1..tree.num_ranks() {
        let mut rank = start;
        let mut hops = 0;
        while rank != 0 {
            let parents = parent(tree, rank);
            assert_eq!(parents.len(), 1, "rank {rank} has {} parents", parents.len());
            assert!(parents[0] < rank);
            rank = parents[0];
            hops += 1;
            assert!(hops <= tree.num_ranks());
        }
    }
}

#[test]
fn test_reduce_tree_is_consistent() {
    for branching_factor in [2, 3, 4, 7] {
        for n in 1..=64 {
            let tree = ReduceTree::new(n, branching_factor).unwrap();
            check_mutual_inverse(&tree);
            check_rooted(&tree, |t, r| t.write_ranks(r));
            assert!(tree.write_ranks(0).is_empty());
        }
    }
}

#[test]
fn test_broadcast_tree_is_consistent() {
    for n in 1..=64 {
        let tree = BroadcastTree::new(n);
        check_mutual_inverse(&tree);
        check_rooted(&tree, |t, r| t.read_ranks(r));
    }
    for branching_factor in [2, 5, 9] {
        let tree = BroadcastTree::with_branching_factor(50, branching_factor).unwrap();
        check_mutual_inverse(&tree);
    }
}

#[test]
fn test_reduce_tree_covers_every_rank_once() {
    let tree = ReduceTree::new(23, 3).unwrap();
    let mut children: Vec<usize> = (0..23).flat_map(|r| tree.read_ranks(r)).collect();
    children.sort_unstable();
    assert_eq!(children, (1..23).collect::<Vec<_>>());
}

#[test]
fn test_broadcast_factor_minimizes_hops() {
    for n in [1, 2, 5, 17, 100, 1000] {
        let best = broadcast_branching_factor(n, 100);
        let hops = best * tree_levels(n, best);
        for b in 2..=100 {
            assert!(b * tree_levels(n, b) >= hops || n == 1);
        }
    }
}
