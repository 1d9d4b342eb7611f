//! Value replication scenarios: put, get, selection, correcting puts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{NetworkRegistry, TestNode, spawn_mesh};
use kadmesh::messages::{Message, MessageType};
use kadmesh::{KadError, Record};

/// A value put by one node is retrievable from a node that never talked to
/// the publisher directly.
#[tokio::test]
async fn put_then_get_across_a_sparse_mesh() {
    let registry = Arc::new(NetworkRegistry::default());
    let nodes = spawn_mesh(&registry, 20, &[1, 3, 7, 9, 13]).await;

    nodes[0]
        .node
        .put_value(b"/test/hello", b"world".to_vec())
        .await
        .expect("put succeeds");

    let value = nodes[11]
        .node
        .get_value(b"/test/hello")
        .await
        .expect("get succeeds");
    assert_eq!(value, b"world");
}

#[tokio::test]
async fn get_of_a_missing_key_is_not_found() {
    let registry = Arc::new(NetworkRegistry::default());
    let nodes = spawn_mesh(&registry, 8, &[1, 2]).await;

    let result = nodes[2].node.get_value(b"/test/never-stored").await;
    assert!(matches!(result, Err(KadError::NotFound)), "got {result:?}");
}

#[tokio::test]
async fn get_many_returns_copies_from_several_holders() {
    let registry = Arc::new(NetworkRegistry::default());
    let nodes = spawn_mesh(&registry, 10, &[1, 2, 3]).await;

    nodes[4]
        .node
        .put_value(b"/test/replicated", b"payload".to_vec())
        .await
        .expect("put succeeds");

    let records = nodes[7]
        .node
        .get_many(b"/test/replicated", 4)
        .await
        .expect("get_many succeeds");
    assert!(!records.is_empty());
    assert!(records.len() <= 4);
    for record in &records {
        assert_eq!(record.value, b"payload");
    }
}

/// Two nodes hold a stale v1; after a fresh put of v2 elsewhere, a reader
/// triggers correcting puts and the stale holders converge on v2.
#[tokio::test]
async fn stale_holders_receive_correcting_puts() {
    let registry = Arc::new(NetworkRegistry::default());
    let publisher = TestNode::spawn(registry.clone(), 0).await;
    let stale_a = TestNode::spawn(registry.clone(), 1).await;
    let stale_b = TestNode::spawn(registry.clone(), 2).await;
    let reader = TestNode::spawn(registry.clone(), 3).await;

    for node in [&publisher, &stale_a, &stale_b] {
        reader.node.observe(node.contact()).await;
        node.node.observe(reader.contact()).await;
        publisher.node.observe(node.contact()).await;
        node.node.observe(publisher.contact()).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Seed the stale copies straight through the handler.
    let v1 = Record::new(b"/test/doc".to_vec(), b"v1".to_vec());
    for stale in [&stale_a, &stale_b] {
        stale
            .node
            .handle_message(&publisher.contact(), Message::put_value(&v1))
            .await
            .expect("v1 stored");
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The stale holders are partitioned away while v2 replicates, so only
    // the reader and the publisher hold the fresh version.
    publisher
        .network
        .set_failure(stale_a.peer(), true)
        .await;
    publisher
        .network
        .set_failure(stale_b.peer(), true)
        .await;
    publisher
        .node
        .put_value(b"/test/doc", b"v2".to_vec())
        .await
        .expect("v2 put succeeds");
    publisher
        .network
        .set_failure(stale_a.peer(), false)
        .await;
    publisher
        .network
        .set_failure(stale_b.peer(), false)
        .await;

    let value = reader.node.get_value(b"/test/doc").await.expect("get succeeds");
    assert_eq!(value, b"v2", "selector must pick the newest record");

    // Correcting puts are fire-and-forget; give them a moment to land.
    tokio::time::sleep(Duration::from_millis(200)).await;

    for stale in [&stale_a, &stale_b] {
        let reply = stale
            .node
            .handle_message(&reader.contact(), Message::get_value(b"/test/doc"))
            .await
            .expect("local get");
        assert_eq!(reply.msg_type, MessageType::GetValue);
        let record = reply.record.expect("record present").into_record();
        assert_eq!(record.value, b"v2", "stale holder was corrected");
    }
}

/// Records that fail validation are rejected at the door.
#[tokio::test]
async fn invalid_records_are_rejected_on_put() {
    let registry = Arc::new(NetworkRegistry::default());
    let nodes = spawn_mesh(&registry, 4, &[1]).await;

    let result = nodes[0].node.put_value(b"/test/bad", Vec::new()).await;
    assert!(matches!(result, Err(KadError::InvalidRecord { .. })), "got {result:?}");

    let result = nodes[0]
        .node
        .put_value(b"no-namespace-key", b"v".to_vec())
        .await;
    assert!(matches!(result, Err(KadError::InvalidRecord { .. })), "got {result:?}");
}

/// A publisher with its quorum raised fails loudly when too few peers ack.
#[tokio::test]
async fn raised_quorum_fails_without_enough_acks() {
    let registry = Arc::new(NetworkRegistry::default());
    let config = kadmesh::Config {
        put_quorum: 5,
        ..common::test_config()
    };
    let main = TestNode::spawn_with_config(registry.clone(), 0, config).await;
    let only_peer = TestNode::spawn(registry.clone(), 1).await;
    main.node.observe(only_peer.contact()).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let result = main.node.put_value(b"/test/k", b"v".to_vec()).await;
    assert!(
        matches!(result, Err(KadError::QuorumFailed { needed: 5, .. })),
        "got {result:?}"
    );
}
