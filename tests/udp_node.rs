//! Node public API over real UDP sockets on loopback.

use std::time::{Duration, Instant};

use discv5::{Config, Event, Keypair, Node, RequestError};

async fn udp_node(config: Config) -> Node {
    Node::bind_with("127.0.0.1:0", Keypair::generate(), config)
        .await
        .expect("bind loopback")
}

#[tokio::test]
async fn record_advertises_the_bound_address() {
    let node = udp_node(Config::default()).await;
    let record = node.local_record().await.unwrap();
    assert_eq!(record.addr, Some(node.local_addr()));
    assert_eq!(record.node_id(), node.node_id());
    assert!(record.verify().is_ok());
}

#[tokio::test]
async fn ping_establishes_one_session_and_reuses_it() {
    let a = udp_node(Config::default()).await;
    let b = udp_node(Config::default()).await;
    let mut b_events = b.events().await.unwrap();
    let b_record = b.local_record().await.unwrap();

    for _ in 0..3 {
        assert_eq!(a.ping(&b_record).await.unwrap(), b_record.seq);
    }

    let mut established = 0;
    while let Ok(event) = b_events.try_recv() {
        if event == Event::SessionEstablished(a.node_id()) {
            established += 1;
        }
    }
    assert_eq!(established, 1);

    let a_peers = a.peers().await;
    assert_eq!(a_peers.len(), 1);
    assert_eq!(a_peers[0].0, b_record);
}

#[tokio::test]
async fn find_node_at_distance_zero_returns_the_peer_record() {
    let a = udp_node(Config::default()).await;
    let b = udp_node(Config::default()).await;
    let b_record = b.local_record().await.unwrap();

    let records = a.find_node(&b_record, vec![0]).await.unwrap();
    assert_eq!(records, vec![b_record]);
}

#[tokio::test]
async fn talk_request_round_trip() {
    let a = udp_node(Config::default()).await;
    let b = udp_node(Config::default()).await;
    let b_record = b.local_record().await.unwrap();

    let mut requests = b.talk_requests().await.unwrap();
    let a_id = a.node_id();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            assert_eq!(request.node_address.node_id, a_id);
            let reply = [request.protocol.as_slice(), b":", request.payload.as_slice()].concat();
            request.respond(reply);
        }
    });

    let answer = a.talk(&b_record, b"echo", b"hello".to_vec()).await.unwrap();
    assert_eq!(answer, b"echo:hello");
}

#[tokio::test]
async fn silent_peer_times_out_on_schedule() {
    let request_timeout = Duration::from_millis(200);
    let a = udp_node(Config::with_request_timeout(request_timeout)).await;

    // Bound but never read, so nothing ever answers.
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let ghost = Keypair::generate().create_record(1, Some(silent.local_addr().unwrap()));

    let started = Instant::now();
    let err = a.service().ping(&ghost).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err, RequestError::Timeout);
    assert!(elapsed >= request_timeout, "timed out early: {elapsed:?}");
    assert!(elapsed < request_timeout + Duration::from_millis(500), "timed out late: {elapsed:?}");
}

#[tokio::test]
async fn bootstrap_over_udp() {
    let seed = udp_node(Config::default()).await;
    let seed_record = seed.local_record().await.unwrap();

    let mut joiners = Vec::new();
    for _ in 0..4 {
        let joiner = udp_node(Config::default()).await;
        assert_eq!(joiner.bootstrap(&[seed_record.clone()]).await.unwrap(), 1);
        joiners.push(joiner);
    }
    assert_eq!(seed.peers().await.len(), joiners.len());

    let wanted = joiners[0].node_id();
    let found = joiners[3].find_peers(wanted).await;
    assert_eq!(found.first().map(|r| r.node_id()), Some(wanted));
}
