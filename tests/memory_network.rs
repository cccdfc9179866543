//! Multi-node scenarios over the in-memory transport.

use std::net::SocketAddr;
use std::time::Duration;

use discv5::{Config, EntryStatus, Event, Keypair, MemoryNetwork, Node, NodeLookupConfig};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn addr(last_octet: u8) -> SocketAddr {
    SocketAddr::from(([10, 7, 0, last_octet], 9000))
}

fn node(network: &MemoryNetwork, last_octet: u8) -> Node {
    Node::in_memory(network, addr(last_octet), Keypair::generate(), Config::default())
}

/// Seed node plus `count` nodes bootstrapped through it.
async fn network_of(network: &MemoryNetwork, count: u8) -> Vec<Node> {
    let seed = node(network, 1);
    let seed_record = seed.local_record().await.unwrap();
    let mut nodes = vec![seed];
    for octet in 2..(count + 2) {
        let joiner = node(network, octet);
        joiner.bootstrap(&[seed_record.clone()]).await.unwrap();
        nodes.push(joiner);
    }
    nodes
}

async fn next_matching<F, T>(events: &mut mpsc::Receiver<Event>, mut pick: F) -> T
where
    F: FnMut(Event) -> Option<T>,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

#[tokio::test]
async fn lookup_finds_existing_node() {
    let network = MemoryNetwork::new();
    let nodes = network_of(&network, 14).await;

    let searcher = &nodes[5];
    let wanted = &nodes[11];
    let found = searcher.find_peers(wanted.node_id()).await;

    assert_eq!(found.first().map(|r| r.node_id()), Some(wanted.node_id()));
    assert!(found.iter().all(|r| r.node_id() != searcher.node_id()));
}

#[tokio::test]
async fn lookup_results_are_sorted_by_distance() {
    let network = MemoryNetwork::new();
    let nodes = network_of(&network, 10).await;
    let target = discv5::NodeId::random();

    let found = nodes[3].discover(target, NodeLookupConfig::default()).await;
    assert!(!found.is_empty());
    let distances: Vec<[u8; 32]> = found.iter().map(|r| r.node_id().xor_distance(&target)).collect();
    let mut sorted = distances.clone();
    sorted.sort();
    assert_eq!(distances, sorted);
}

#[tokio::test]
async fn unresponsive_entry_is_replaced_by_live_node() {
    let network = MemoryNetwork::new();
    let mut config = Config::with_request_timeout(Duration::from_millis(100));
    config.bucket_size = 1;
    let a = Node::in_memory(&network, addr(1), Keypair::generate(), config);
    let mut events = a.events().await.unwrap();
    let b = node(&network, 2);

    let distance = a.node_id().log2_distance(&b.node_id());
    let ghost = loop {
        let key = Keypair::generate();
        if a.node_id().log2_distance(&key.node_id()) == distance {
            break key.create_record(1, Some(addr(99)));
        }
    };
    assert!(a.add_peer(ghost.clone()).await);

    let a_record = a.local_record().await.unwrap();
    b.ping(&a_record).await.unwrap();

    let (inserted, evicted) = next_matching(&mut events, |event| match event {
        Event::RecordAdded {
            inserted,
            evicted: Some(evicted),
        } => Some((inserted, evicted)),
        _ => None,
    })
    .await;
    assert_eq!(inserted.node_id(), b.node_id());
    assert_eq!(evicted, ghost);

    let peers = a.peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].0.node_id(), b.node_id());
    assert_eq!(peers[0].1, EntryStatus::Connected);
}

#[tokio::test]
async fn restarted_peer_gets_a_fresh_handshake() {
    let network = MemoryNetwork::new();
    let a = node(&network, 1);
    let mut events = a.events().await.unwrap();
    let b_key = Keypair::generate();
    let b = Node::in_memory(&network, addr(2), b_key.clone(), Config::default());
    let b_record = b.local_record().await.unwrap();

    a.ping(&b_record).await.unwrap();
    next_matching(&mut events, |e| matches!(e, Event::SessionEstablished(_)).then_some(())).await;

    // Same identity and address, no session state.
    b.shutdown().await;
    let restarted = Node::in_memory(&network, addr(2), b_key, Config::default());

    a.ping(&b_record).await.unwrap();
    let ended = next_matching(&mut events, |e| match e {
        Event::SessionEnded(id) => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(ended, restarted.node_id());
    next_matching(&mut events, |e| matches!(e, Event::SessionEstablished(_)).then_some(())).await;
}

#[tokio::test]
async fn newer_record_is_fetched_after_ping() {
    let network = MemoryNetwork::new();
    let a = node(&network, 1);
    let b_key = Keypair::generate();
    let b = Node::in_memory(&network, addr(2), b_key.clone(), Config::default());
    let b_record = b.local_record().await.unwrap();

    a.ping(&b_record).await.unwrap();
    assert_eq!(a.service().find_record(b.node_id()).await, Some(b_record.clone()));

    // b comes back with a bumped record at the same address.
    b.shutdown().await;
    let updated = b_key.update_record_addr(&b_record, addr(2));
    let (transport, inbound) = network.bind(addr(2));
    let (restarted, _events) = discv5::Discv5::new(
        b_key,
        updated.clone(),
        Config::default(),
        std::sync::Arc::new(transport),
        inbound,
    );

    assert_eq!(a.ping(&b_record).await.unwrap(), updated.seq);
    let refreshed = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(record) = a.service().find_record(restarted.local_id()).await
                && record.seq == updated.seq
            {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(refreshed, updated);
}
