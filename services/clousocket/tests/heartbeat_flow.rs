//! Heartbeat behavior over a live connection: ACK adaptation under regular
//! pongs, and the TIMEOUT frame plus close for a silent peer.
//!
//! Intervals are scaled down from the production defaults to keep the suite
//! fast; the ratios (init between min and max, timeout under max) match.

mod common;

use common::{HeartbeatTuning, builtin_table, spawn_server, test_config};
use clousocket::handlers::HandlerRegistry;
use cs_test_utils::{MockStoreServer, TestClient};
use std::time::Duration;

/// min 100ms / max 1000ms / init 200ms / timeout 400ms.
const HB_FAST: HeartbeatTuning = HeartbeatTuning {
    min: 100,
    max: 1000,
    init: 200,
    timeout: 400,
};

#[tokio::test]
async fn acks_adapt_monotonically_and_stay_bounded() {
    let store = MockStoreServer::start().await.unwrap();
    let (_supervisor, addr) = spawn_server(
        test_config(&store.url(), HB_FAST),
        builtin_table(),
        HandlerRegistry::builtin(),
    )
    .await;

    let mut client = TestClient::connect(addr).await.unwrap();

    // Keep a pong pending at all times and collect three ACK cycles.
    let mut acks: Vec<u64> = Vec::new();
    while acks.len() < 3 {
        client.send_tokens(["HEARTBEAT"]).await.unwrap();
        match tokio::time::timeout(Duration::from_millis(150), client.recv_or_eof()).await {
            Err(_) => continue, // no ACK yet; pong again
            Ok(None) => panic!("server closed during heartbeat exchange"),
            Ok(Some(frame)) => {
                let tokens = frame.tokens().unwrap();
                assert_eq!(&tokens[..2], ["HEARTBEAT", "ACK"]);
                acks.push(tokens[2].parse().expect("ACK carries the interval in ms"));
            }
        }
    }

    for window in acks.windows(2) {
        assert!(
            window[1] >= window[0],
            "ACK intervals must not shrink while the peer only heartbeats: {acks:?}"
        );
    }
    for ms in &acks {
        assert!(
            (HB_FAST.min..=HB_FAST.max).contains(ms),
            "ACK interval {ms} outside [{}, {}]",
            HB_FAST.min,
            HB_FAST.max
        );
    }
}

#[tokio::test]
async fn silent_peer_gets_timeout_frame_then_close() {
    let store = MockStoreServer::start().await.unwrap();
    let (supervisor, addr) = spawn_server(
        test_config(&store.url(), HB_FAST),
        builtin_table(),
        HandlerRegistry::builtin(),
    )
    .await;

    let mut client = TestClient::connect(addr).await.unwrap();
    // Send nothing at all.

    let frame = client.recv().await.unwrap();
    assert_eq!(frame.tokens().unwrap(), vec!["HEARTBEAT", "TIMEOUT"]);
    client.expect_eof().await;

    common::await_registry_len(&supervisor, 0).await;
}

#[tokio::test]
async fn heartbeat_frames_with_extra_tokens_still_pong() {
    let store = MockStoreServer::start().await.unwrap();
    let (_supervisor, addr) = spawn_server(
        test_config(&store.url(), HB_FAST),
        builtin_table(),
        HandlerRegistry::builtin(),
    )
    .await;

    let mut client = TestClient::connect(addr).await.unwrap();

    // Lowercase spelling and trailing tokens both count as pongs.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        client.send_tokens(["heartbeat", "extra", "tokens"]).await.unwrap();
        match tokio::time::timeout(Duration::from_millis(150), client.recv_or_eof()).await {
            Err(_) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "no ACK arrived for lowercase heartbeat frames"
                );
            }
            Ok(None) => panic!("session should stay open while pongs arrive"),
            Ok(Some(frame)) => {
                assert_eq!(&frame.tokens().unwrap()[..2], ["HEARTBEAT", "ACK"]);
                break;
            }
        }
    }
}
