//! SOLO runs over the in-process cluster

mod common;

use common::{tx, Cluster};

#[test]
fn test_solo_commits_without_peers() {
    let mut cluster = Cluster::uniform("SOLO", 1);
    cluster.start();
    assert!(cluster.nodes[0].committed.is_empty());

    let first = tx(1);
    let second = tx(2);
    cluster.submit(first.clone());
    cluster.submit(second.clone());
    cluster.run();

    let node = &cluster.nodes[0];
    // Both were in the pool when the first batch was fetched
    assert_eq!(node.committed.len(), 1);
    assert_eq!(node.committed[0].txs.len(), 2);
    assert_eq!(node.committed[0].commit_qc.signature_count(), 1);
    assert!(node.pool.is_empty());

    let third = tx(3);
    cluster.submit(third.clone());
    cluster.run();

    let node = &cluster.nodes[0];
    assert_eq!(node.status().committed_height, 2);
    assert_eq!(node.events.len(), 2);
    assert!(node.has_committed(&third));
    assert_eq!(node.committed[1].block.justify_qc, node.committed[0].commit_qc);
    cluster.assert_consistent();
}
