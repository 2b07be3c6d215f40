//! In-memory transport for driving two sessions without a network.
//!
//! Descriptions are opaque strings naming the connection that produced them
//! (`loopback offer conn=1`); setting a remote description pairs the two
//! connections. The shared channel opens once both sides hold both
//! descriptions, a channel with the same id and at least one remote candidate.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use peerlink::peer::{
    CandidateEvent, CandidateEvents, ChannelEvent, ChannelEvents, DataChannel, IceCandidate,
    PeerConnection, SdpType, SessionDescription, Transport,
};
use peerlink::signaling::{RoomUpdate, Subcollection, Subscription};
use peerlink::{MemoryStore, RoomRecord, SessionConfig, SignalingStore, StoreError, TransportError};
use tokio::sync::mpsc;

#[derive(Default)]
struct PeerEntry {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    partner: Option<u64>,
    remote_candidates: Vec<IceCandidate>,
    channel: Option<(u16, mpsc::UnboundedSender<ChannelEvent>)>,
    candidates: Option<mpsc::UnboundedSender<CandidateEvent>>,
    remote_description_calls: usize,
    open: bool,
    closed: bool,
}

impl PeerEntry {
    fn ready(&self) -> bool {
        self.local.is_some()
            && self.remote.is_some()
            && self.channel.is_some()
            && !self.remote_candidates.is_empty()
            && !self.open
            && !self.closed
    }
}

#[derive(Default)]
struct NetState {
    next_id: u64,
    peers: BTreeMap<u64, PeerEntry>,
}

impl NetState {
    fn peer(&mut self, id: u64) -> &mut PeerEntry {
        self.peers.get_mut(&id).unwrap()
    }

    fn try_open(&mut self, id: u64) {
        let Some(partner) = self.peers.get(&id).and_then(|p| p.partner) else {
            return;
        };
        let (Some(a), Some(b)) = (self.peers.get(&id), self.peers.get(&partner)) else {
            return;
        };
        if a.partner != Some(partner) || b.partner != Some(id) || !a.ready() || !b.ready() {
            return;
        }
        if a.channel.as_ref().map(|c| c.0) != b.channel.as_ref().map(|c| c.0) {
            return;
        }
        for peer in [id, partner] {
            let entry = self.peer(peer);
            entry.open = true;
            if let Some((_, events)) = &entry.channel {
                let _ = events.send(ChannelEvent::Open);
            }
        }
    }

    fn close_channel(&mut self, id: u64) {
        let partner = {
            let entry = self.peer(id);
            if entry.closed {
                return;
            }
            entry.closed = true;
            if let Some((_, events)) = &entry.channel {
                let _ = events.send(ChannelEvent::Closed);
            }
            entry.partner
        };
        if let Some(entry) = partner.and_then(|p| self.peers.get_mut(&p)) {
            if entry.open && !entry.closed {
                entry.closed = true;
                if let Some((_, events)) = &entry.channel {
                    let _ = events.send(ChannelEvent::Closed);
                }
            }
        }
    }
}

/// Shared medium for every loopback connection of a test
#[derive(Default)]
pub struct LoopbackNetwork {
    state: Mutex<NetState>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `set_remote_description` call count per connection, in creation order
    pub fn remote_description_calls(&self) -> Vec<usize> {
        let state = self.state.lock().unwrap();
        state
            .peers
            .values()
            .map(|p| p.remote_description_calls)
            .collect()
    }

    /// Negotiated channel id per connection, in creation order
    pub fn channel_ids(&self) -> Vec<Option<u16>> {
        let state = self.state.lock().unwrap();
        state
            .peers
            .values()
            .map(|p| p.channel.as_ref().map(|c| c.0))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().peers.len()
    }
}

pub struct LoopbackTransport {
    net: Arc<LoopbackNetwork>,
    buffers_early: bool,
    fail_remote_description: bool,
}

impl LoopbackTransport {
    pub fn new(net: &Arc<LoopbackNetwork>) -> Self {
        Self {
            net: Arc::clone(net),
            buffers_early: false,
            fail_remote_description: false,
        }
    }

    /// Connections accept candidates before the remote description
    pub fn buffering_early_candidates(mut self) -> Self {
        self.buffers_early = true;
        self
    }

    /// Connections reject every remote description
    pub fn failing_remote_description(mut self) -> Self {
        self.fail_remote_description = true;
        self
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    type Connection = LoopbackPeer;

    async fn create_connection(
        &self,
        _config: &SessionConfig,
    ) -> Result<(LoopbackPeer, CandidateEvents), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.net.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.peers.insert(
            id,
            PeerEntry {
                candidates: Some(tx),
                ..Default::default()
            },
        );
        Ok((
            LoopbackPeer {
                id,
                net: Arc::clone(&self.net),
                buffers_early: self.buffers_early,
                fail_remote_description: self.fail_remote_description,
            },
            rx,
        ))
    }
}

pub struct LoopbackPeer {
    id: u64,
    net: Arc<LoopbackNetwork>,
    buffers_early: bool,
    fail_remote_description: bool,
}

impl LoopbackPeer {
    pub fn id(&self) -> u64 {
        self.id
    }
}

fn conn_of(sdp: &str) -> Option<u64> {
    sdp.split_whitespace()
        .find_map(|word| word.strip_prefix("conn="))
        .and_then(|n| n.parse().ok())
}

pub fn host_candidate(port: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{port} 1 udp 2122260223 127.0.0.1 {port} typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    type Channel = LoopbackChannel;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer(format!(
            "loopback offer conn={}",
            self.id
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.net.state.lock().unwrap();
        if state.peer(self.id).remote.is_none() {
            return Err(TransportError::Negotiation(
                "no remote offer to answer".into(),
            ));
        }
        Ok(SessionDescription::answer(format!(
            "loopback answer conn={}",
            self.id
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.net.state.lock().unwrap();
        let entry = state.peer(self.id);
        if entry.local.is_some() {
            return Err(TransportError::Negotiation("local description already set".into()));
        }
        entry.local = Some(desc);

        // Gathering starts with the local description
        if let Some(candidates) = entry.candidates.take() {
            let base = 40000 + (self.id as u16) * 10;
            let _ = candidates.send(CandidateEvent::Candidate(host_candidate(base)));
            let _ = candidates.send(CandidateEvent::Candidate(host_candidate(base + 1)));
            let _ = candidates.send(CandidateEvent::Complete);
        }
        state.try_open(self.id);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = self.net.state.lock().unwrap();
        let entry = state.peer(self.id);
        entry.remote_description_calls += 1;
        if self.fail_remote_description {
            return Err(TransportError::Negotiation("remote description rejected".into()));
        }
        let expected = if entry.local.is_some() {
            SdpType::Answer
        } else {
            SdpType::Offer
        };
        if desc.sdp_type != expected {
            return Err(TransportError::Negotiation(format!(
                "unexpected {} description",
                desc.sdp_type
            )));
        }
        entry.partner = conn_of(&desc.sdp);
        entry.remote = Some(desc);
        state.try_open(self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.net.state.lock().unwrap();
        let entry = state.peer(self.id);
        if entry.remote.is_none() && !self.buffers_early {
            return Err(TransportError::Negotiation(
                "candidate before remote description".into(),
            ));
        }
        entry.remote_candidates.push(candidate);
        state.try_open(self.id);
        Ok(())
    }

    fn buffers_early_candidates(&self) -> bool {
        self.buffers_early
    }

    async fn create_negotiated_channel(
        &self,
        _label: &str,
        id: u16,
    ) -> Result<(Arc<LoopbackChannel>, ChannelEvents), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.net.state.lock().unwrap();
        state.peer(self.id).channel = Some((id, tx));
        state.try_open(self.id);
        Ok((
            Arc::new(LoopbackChannel {
                id,
                conn: self.id,
                net: Arc::clone(&self.net),
            }),
            rx,
        ))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.net.state.lock().unwrap().close_channel(self.id);
        Ok(())
    }
}

pub struct LoopbackChannel {
    id: u16,
    conn: u64,
    net: Arc<LoopbackNetwork>,
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn id(&self) -> u16 {
        self.id
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let mut state = self.net.state.lock().unwrap();
        let entry = state.peer(self.conn);
        if !entry.open || entry.closed {
            return Err(TransportError::ChannelClosed);
        }
        let partner = entry.partner.ok_or(TransportError::ChannelClosed)?;
        let remote = state.peer(partner);
        match &remote.channel {
            Some((_, events)) if !remote.closed => {
                let _ = events.send(ChannelEvent::Message(Bytes::from(text)));
                Ok(())
            }
            _ => Err(TransportError::ChannelClosed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.net.state.lock().unwrap().close_channel(self.conn);
        Ok(())
    }
}

pub fn init_logging() {
    peerlink::logger::init();
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Wait for a state with a deadline so a broken handshake fails instead of hanging
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

/// [`MemoryStore`] whose operations can be held back, to land a teardown while
/// a store call is in flight
#[derive(Default)]
pub struct DelayedStore {
    pub inner: MemoryStore,
    delays: Mutex<HashMap<&'static str, Duration>>,
    created: Mutex<Vec<String>>,
}

impl DelayedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hold `op` (a trait method name) for `delay` before it runs
    pub fn delay(&self, op: &'static str, delay: Duration) {
        self.delays.lock().unwrap().insert(op, delay);
    }

    /// Ids of every record written through this store
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    async fn pause(&self, op: &'static str) {
        let delay = self.delays.lock().unwrap().get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SignalingStore for DelayedStore {
    async fn create_record(
        &self,
        id: Option<String>,
        record: RoomRecord,
    ) -> Result<String, StoreError> {
        self.pause("create_record").await;
        let id = self.inner.create_record(id, record).await?;
        self.created.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn get_record(&self, id: &str) -> Result<Option<RoomRecord>, StoreError> {
        self.pause("get_record").await;
        self.inner.get_record(id).await
    }

    async fn update_record(&self, id: &str, update: RoomUpdate) -> Result<(), StoreError> {
        self.pause("update_record").await;
        self.inner.update_record(id, update).await
    }

    async fn delete_record(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete_record(id).await
    }

    async fn subscribe_to_record(
        &self,
        id: &str,
    ) -> Result<Subscription<Option<RoomRecord>>, StoreError> {
        self.pause("subscribe_to_record").await;
        self.inner.subscribe_to_record(id).await
    }

    async fn append_to_subcollection(
        &self,
        id: &str,
        name: Subcollection,
        item: IceCandidate,
    ) -> Result<(), StoreError> {
        self.inner.append_to_subcollection(id, name, item).await
    }

    async fn subscribe_to_subcollection_adds(
        &self,
        id: &str,
        name: Subcollection,
    ) -> Result<Subscription<IceCandidate>, StoreError> {
        self.pause("subscribe_to_subcollection_adds").await;
        self.inner.subscribe_to_subcollection_adds(id, name).await
    }
}
