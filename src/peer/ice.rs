use crate::error::{StoreError, TransportError};
use crate::logger::{analyze_candidates, dump_candidate};
use crate::peer::transport::{CandidateEvents, PeerConnection};
use crate::peer::types::{CandidateEvent, IceCandidate};
use crate::signaling::{SignalingStore, Subcollection};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Default)]
struct ExchangeState {
    remote_description_set: bool,
    // Candidates received before the remote description was applied
    pending: Vec<IceCandidate>,
    applied: HashSet<IceCandidate>,
}

/// Applies the counterpart's candidates to the local connection.
///
/// Queues candidates that arrive before the remote description when the
/// connection cannot take them yet, and ignores duplicates.
pub struct CandidateExchange<C> {
    connection: Arc<C>,
    state: Mutex<ExchangeState>,
}

impl<C: PeerConnection> CandidateExchange<C> {
    pub fn new(connection: Arc<C>) -> Self {
        Self {
            connection,
            state: Mutex::new(ExchangeState::default()),
        }
    }

    /// Apply one remote candidate, or queue it until the remote description is set
    pub async fn apply_remote(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if candidate.candidate.is_empty() {
            debug!("Ignoring end-of-candidates marker from remote");
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if state.applied.contains(&candidate) || state.pending.contains(&candidate) {
            debug!("Duplicate remote candidate ignored: {}", candidate.candidate);
            return Ok(());
        }

        if !state.remote_description_set && !self.connection.buffers_early_candidates() {
            debug!("Remote description not set yet, queuing candidate");
            state.pending.push(candidate);
            return Ok(());
        }

        dump_candidate("REMOTE", &candidate);
        self.connection.add_ice_candidate(candidate.clone()).await?;
        state.applied.insert(candidate);
        Ok(())
    }

    /// Mark the remote description as applied and flush queued candidates
    pub async fn remote_description_set(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.remote_description_set = true;

        let pending = std::mem::take(&mut state.pending);
        if !pending.is_empty() {
            info!("Applying {} pending remote candidates", pending.len());
        }
        for candidate in pending {
            dump_candidate("REMOTE", &candidate);
            self.connection.add_ice_candidate(candidate.clone()).await?;
            state.applied.insert(candidate);
        }
        Ok(())
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn applied_len(&self) -> usize {
        self.state.lock().await.applied.len()
    }
}

/// Publish local candidates to `outgoing` until the gathering sentinel arrives.
/// Returns how many were written.
pub async fn publish_local<S: SignalingStore + ?Sized>(
    store: &S,
    room_id: &str,
    outgoing: Subcollection,
    mut candidates: CandidateEvents,
) -> Result<usize, StoreError> {
    let mut published = Vec::new();

    while let Some(event) = candidates.recv().await {
        match event {
            CandidateEvent::Candidate(candidate) => {
                dump_candidate("LOCAL", &candidate);
                store
                    .append_to_subcollection(room_id, outgoing, candidate.clone())
                    .await?;
                published.push(candidate);
            }
            CandidateEvent::Complete => {
                info!("ICE candidate gathering completed");
                break;
            }
        }
    }

    if published.is_empty() {
        warn!("No local candidates were gathered");
    }
    analyze_candidates(&published);
    Ok(published.len())
}
