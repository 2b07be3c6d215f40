// Two sessions in one process, talking over real WebRTC through an in-memory room
use std::sync::Arc;
use std::time::Duration;

use peerlink::{
    logger, ConnectionState, MemoryStore, RtcTransport, Session, SessionConfig, SessionError,
    Vector3,
};
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> Result<(), SessionError> {
    logger::init();

    // Loopback only; host candidates are enough
    let config = SessionConfig {
        ice_servers: vec![],
        ..Default::default()
    };
    let store = Arc::new(MemoryStore::new());
    let creator = Session::new(store.clone(), RtcTransport::new(), config.clone())?;
    let joiner = Session::new(store, RtcTransport::new(), config)?;

    let room_id = creator.start_as_creator().await?;
    info!("Room {} is ready", room_id);
    joiner.join_as_joiner(&room_id).await?;

    let connected = tokio::time::timeout(CONNECT_TIMEOUT, async {
        tokio::join!(
            creator.wait_for_state(ConnectionState::Connected),
            joiner.wait_for_state(ConnectionState::Connected)
        )
    })
    .await;

    match connected {
        Ok((ConnectionState::Connected, ConnectionState::Connected)) => {
            creator.send_chat("hello from the creator").await?;
            joiner.send_chat("hello back").await?;
            for sample in [
                Vector3::new(0.5, 0.0, 0.0),
                Vector3::new(0.5, 0.1, 0.0),
                Vector3::new(0.0, -0.4, 0.3),
            ] {
                joiner.send_move(sample).await?;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;

            info!("Creator transcript: {:?}", creator.transcript().await);
            info!("Joiner transcript: {:?}", joiner.transcript().await);
            info!("Remote cursor at {:?}", creator.remote_position().await);
        }
        Ok(states) => warn!("Connection did not come up: {:?}", states),
        Err(_) => warn!("Timed out waiting for the data channel"),
    }

    joiner.leave().await?;
    creator.leave().await?;
    Ok(())
}
