//! Two sessions over the real WebRTC stack on localhost.

use std::sync::Arc;
use std::time::Duration;

use peerlink::{ConnectionState, MemoryStore, RtcTransport, Session, SessionConfig};

#[tokio::test]
#[ignore = "opens UDP sockets; run with --ignored"]
async fn test_rtc_sessions_connect() {
    peerlink::logger::init();
    let config = SessionConfig {
        ice_servers: vec![],
        ..Default::default()
    };
    let store = Arc::new(MemoryStore::new());
    let creator = Session::new(store.clone(), RtcTransport::new(), config.clone()).unwrap();
    let joiner = Session::new(store.clone(), RtcTransport::new(), config).unwrap();

    let room_id = creator.start_as_creator().await.unwrap();
    joiner.join_as_joiner(&room_id).await.unwrap();

    let states = tokio::time::timeout(Duration::from_secs(20), async {
        tokio::join!(
            creator.wait_for_state(ConnectionState::Connected),
            joiner.wait_for_state(ConnectionState::Connected)
        )
    })
    .await
    .unwrap();
    assert_eq!(states, (ConnectionState::Connected, ConnectionState::Connected));

    assert!(creator.send_chat("over the wire").await.unwrap());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(joiner
        .transcript()
        .await
        .contains(&"over the wire".to_string()));

    creator.leave().await.unwrap();
    assert!(!store.contains(&room_id).await);
}
