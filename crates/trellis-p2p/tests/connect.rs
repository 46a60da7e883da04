//! Integration tests: once and watch dialing between localhost nodes.

mod common;

use std::time::Duration;

use tokio::time::timeout;
use trellis_p2p::{
    connect, connect_with, Context, DialError, DialMode, Node, PeerId, PeerInfo, Secret, WatchBackoff,
};

use common::{init_tracing, node, options, silent_addr, STEP_TIMEOUT};

/// A target nobody listens on; dials fail fast with connection refused.
fn unreachable_target() -> PeerInfo {
    PeerInfo::new(PeerId::random(), vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()])
}

#[tokio::test(flavor = "multi_thread")]
async fn once_mode_emits_one_event_per_target() {
    init_tracing();
    let ctx = Context::background();
    let secret = Secret::generate();

    let dialer = node(&ctx, &secret).await;
    let first = node(&ctx, &secret).await;
    let second = node(&ctx, &secret).await;
    let missing = unreachable_target();

    let targets = vec![first.info(), second.info(), missing.clone()];
    let mut events = connect(&dialer, targets, true);

    let mut seen = Vec::new();
    timeout(STEP_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
    })
    .await
    .expect("once-mode stream never closed");
    assert!(events.is_closed());

    assert_eq!(seen.len(), 3);
    for event in &seen {
        if event.target.id == missing.id {
            assert!(matches!(event.error, Some(DialError::Failed { .. })), "{:?}", event.error);
        } else {
            assert!(event.is_ok(), "{:?}", event.error);
        }
    }

    assert!(dialer.is_connected(first.id()).await);
    let mut peers = dialer.connected_peers().await;
    peers.sort();
    let mut expected = vec![first.id(), second.id()];
    expected.sort();
    assert_eq!(peers, expected);

    for n in [&dialer, &first, &second] {
        n.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn once_mode_without_targets_is_exhausted() {
    init_tracing();
    let ctx = Context::background();
    let dialer = node(&ctx, &Secret::generate()).await;

    let events = timeout(STEP_TIMEOUT, connect(&dialer, Vec::new(), true).collect_all())
        .await
        .unwrap();
    assert!(events.is_empty());

    dialer.shutdown().await.unwrap();
}

#[tokio::test]
async fn watch_mode_keeps_reporting_failures_until_shutdown() {
    init_tracing();
    let ctx = Context::background();
    let dialer = node(&ctx, &Secret::generate()).await;

    let mut events = connect(&dialer, vec![unreachable_target()], false);
    for _ in 0..2 {
        let event = timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("watch mode went quiet")
            .expect("watch stream closed while the node lives");
        assert!(!event.is_ok());
    }
    assert!(!events.is_closed());

    dialer.shutdown().await.unwrap();
    timeout(STEP_TIMEOUT, async { while events.recv().await.is_some() {} })
        .await
        .expect("watch stream outlived its node");
    assert!(events.is_closed());
}

#[tokio::test]
async fn once_mode_emits_nothing_after_shutdown() {
    init_tracing();
    let ctx = Context::background();
    let dialer = node(&ctx, &Secret::generate()).await;
    let stalled = PeerInfo::new(PeerId::random(), vec![silent_addr().await]);

    let mut events = connect(&dialer, vec![stalled], true);
    assert!(timeout(Duration::from_millis(300), events.recv()).await.is_err());

    dialer.shutdown().await.unwrap();
    let late = timeout(STEP_TIMEOUT, events.collect_all()).await.unwrap();
    assert!(late.is_empty(), "{late:?}");
}

#[tokio::test]
async fn watch_mode_without_targets_closes_with_node() {
    init_tracing();
    let ctx = Context::background();
    let dialer = node(&ctx, &Secret::generate()).await;

    let mut events = connect(&dialer, Vec::new(), false);
    assert!(timeout(Duration::from_millis(300), events.recv()).await.is_err());

    dialer.shutdown().await.unwrap();
    let end = timeout(STEP_TIMEOUT, events.recv()).await.unwrap();
    assert!(end.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_mode_redials_after_disconnect() {
    init_tracing();
    let ctx = Context::background();
    let secret = Secret::generate();
    let dialer = node(&ctx, &secret).await;
    let target = node(&ctx, &secret).await;

    let backoff = WatchBackoff {
        initial_ms: 50,
        ..WatchBackoff::default()
    };
    let mut events = connect_with(&dialer, vec![target.info()], DialMode::Watch(backoff));

    let first = timeout(STEP_TIMEOUT, events.recv()).await.unwrap().unwrap();
    assert!(first.is_ok(), "{:?}", first.error);

    target.shutdown().await.unwrap();

    let after = timeout(STEP_TIMEOUT, events.recv()).await.unwrap().unwrap();
    assert_eq!(after.target.id, target.id());
    assert!(!after.is_ok());

    dialer.shutdown().await.unwrap();
}

/// The seeker shares only a hub with the target and dials it by id.
#[tokio::test(flavor = "multi_thread")]
async fn identity_only_target_is_found_through_the_dht() {
    init_tracing();
    let ctx = Context::background();
    let secret = Secret::generate();
    let hub = node(&ctx, &secret).await;
    let seeker = node(&ctx, &secret).await;
    let target = node(&ctx, &secret).await;

    for n in [&seeker, &target] {
        let events = timeout(STEP_TIMEOUT, connect(n, vec![hub.info()], true).collect_all())
            .await
            .unwrap();
        assert!(events[0].is_ok(), "{:?}", events[0].error);
    }
    assert!(!seeker.is_connected(target.id()).await);

    // The hub only answers once identify has filled its routing table.
    timeout(STEP_TIMEOUT, async {
        loop {
            match seeker.dial(&PeerInfo::from_id(target.id())).await {
                Ok(()) => return,
                Err(DialError::NodeClosed) => panic!("seeker closed"),
                Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            }
        }
    })
    .await
    .expect("target never resolved through the dht");
    assert!(seeker.is_connected(target.id()).await);

    for n in [&seeker, &target, &hub] {
        n.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn different_network_secret_cannot_connect() {
    init_tracing();
    let ctx = Context::background();

    let mut opts = options(&Secret::generate());
    opts.transport.dial_timeout_ms = 5_000;
    let dialer = Node::new(&ctx, opts).await.unwrap();
    let outsider = node(&ctx, &Secret::generate()).await;

    let events = timeout(STEP_TIMEOUT, connect(&dialer, vec![outsider.info()], true).collect_all())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].error.is_some());
    assert!(!dialer.is_connected(outsider.id()).await);

    dialer.shutdown().await.unwrap();
    outsider.shutdown().await.unwrap();
}

#[tokio::test]
async fn connect_on_closed_node_is_closed() {
    init_tracing();
    let ctx = Context::background();
    let dialer = node(&ctx, &Secret::generate()).await;
    dialer.shutdown().await.unwrap();

    let events = connect(&dialer, vec![unreachable_target()], false);
    assert!(events.is_closed());
}
