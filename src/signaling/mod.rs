//! Signaling store contract.
//!
//! The store only bootstraps the connection: one record per room holding the
//! creator's id, the negotiated channel id and both descriptions, plus two
//! append-only candidate subcollections. Each field has exactly one writer.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::peer::state::Role;
use crate::peer::types::{IceCandidate, SessionDescription};

/// External shape of a room: `{creatorId, channelId, offer?, answer?}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub creator_id: String,
    pub channel_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

/// Joiner-side change to a room; `None` leaves the field as it is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomUpdate {
    pub answer: Option<SessionDescription>,
}

impl RoomUpdate {
    pub fn answer(answer: SessionDescription) -> Self {
        Self {
            answer: Some(answer),
        }
    }

    pub fn apply(self, record: &mut RoomRecord) {
        if let Some(answer) = self.answer {
            record.answer = Some(answer);
        }
    }
}

/// Candidate subcollections of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subcollection {
    CallerCandidates,
    CalleeCandidates,
}

impl Subcollection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subcollection::CallerCandidates => "callerCandidates",
            Subcollection::CalleeCandidates => "calleeCandidates",
        }
    }

    /// Where `role` publishes its own candidates
    pub fn outgoing(role: Role) -> Self {
        match role {
            Role::Creator => Subcollection::CallerCandidates,
            Role::Joiner => Subcollection::CalleeCandidates,
        }
    }

    /// Where `role` reads the counterpart's candidates
    pub fn incoming(role: Role) -> Self {
        match role {
            Role::Creator => Subcollection::CalleeCandidates,
            Role::Joiner => Subcollection::CallerCandidates,
        }
    }
}

impl std::fmt::Display for Subcollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream of change notifications with a single owner.
///
/// Dropping the subscription, or calling [`Subscription::cancel`], stops
/// delivery; nothing queued afterwards is observed.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// Next notification, or `None` once the source is gone or cancelled.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn cancel(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

/// Shared, multi-writer store used only for the handshake.
#[async_trait]
pub trait SignalingStore: Send + Sync + 'static {
    /// Create a room record; a fresh id is generated when `id` is `None`.
    async fn create_record(
        &self,
        id: Option<String>,
        record: RoomRecord,
    ) -> Result<String, StoreError>;

    async fn get_record(&self, id: &str) -> Result<Option<RoomRecord>, StoreError>;

    async fn update_record(&self, id: &str, update: RoomUpdate) -> Result<(), StoreError>;

    /// Remove the record and both subcollections. Deleting a missing record is not an error.
    async fn delete_record(&self, id: &str) -> Result<(), StoreError>;

    /// Current snapshot first, then one snapshot per change; `None` after deletion.
    async fn subscribe_to_record(
        &self,
        id: &str,
    ) -> Result<Subscription<Option<RoomRecord>>, StoreError>;

    async fn append_to_subcollection(
        &self,
        id: &str,
        name: Subcollection,
        item: IceCandidate,
    ) -> Result<(), StoreError>;

    /// Existing entries replayed as additions, then new ones in append order.
    async fn subscribe_to_subcollection_adds(
        &self,
        id: &str,
        name: Subcollection,
    ) -> Result<Subscription<IceCandidate>, StoreError>;
}
