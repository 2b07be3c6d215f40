//! In-process signaling store.
//!
//! Both participants share one `Arc<MemoryStore>`; notifications are pushed to
//! subscriber channels while the store lock is held, so per-subcollection
//! delivery follows append order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{RoomRecord, RoomUpdate, SignalingStore, Subcollection, Subscription};
use crate::error::StoreError;
use crate::peer::types::IceCandidate;
use crate::utils::random_id;

struct Room {
    record: RoomRecord,
    caller_candidates: Vec<IceCandidate>,
    callee_candidates: Vec<IceCandidate>,
    record_watchers: Vec<mpsc::UnboundedSender<Option<RoomRecord>>>,
    caller_watchers: Vec<mpsc::UnboundedSender<IceCandidate>>,
    callee_watchers: Vec<mpsc::UnboundedSender<IceCandidate>>,
}

impl Room {
    fn new(record: RoomRecord) -> Self {
        Self {
            record,
            caller_candidates: Vec::new(),
            callee_candidates: Vec::new(),
            record_watchers: Vec::new(),
            caller_watchers: Vec::new(),
            callee_watchers: Vec::new(),
        }
    }

    fn subcollection(
        &mut self,
        name: Subcollection,
    ) -> (
        &mut Vec<IceCandidate>,
        &mut Vec<mpsc::UnboundedSender<IceCandidate>>,
    ) {
        match name {
            Subcollection::CallerCandidates => {
                (&mut self.caller_candidates, &mut self.caller_watchers)
            }
            Subcollection::CalleeCandidates => {
                (&mut self.callee_candidates, &mut self.callee_watchers)
            }
        }
    }

    fn notify_record(&mut self) {
        let snapshot = self.record.clone();
        self.record_watchers
            .retain(|tx| tx.send(Some(snapshot.clone())).is_ok());
    }
}

#[derive(Default)]
pub struct MemoryStore {
    rooms: Mutex<HashMap<String, Room>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every operation fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.rooms.lock().await.contains_key(id)
    }

    pub async fn subcollection_len(&self, id: &str, name: Subcollection) -> usize {
        let mut rooms = self.rooms.lock().await;
        rooms
            .get_mut(id)
            .map(|room| room.subcollection(name).0.len())
            .unwrap_or(0)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn create_record(
        &self,
        id: Option<String>,
        record: RoomRecord,
    ) -> Result<String, StoreError> {
        self.check_online()?;
        let id = id.unwrap_or_else(random_id);
        let mut rooms = self.rooms.lock().await;
        match rooms.get_mut(&id) {
            Some(room) => {
                room.record = record;
                room.notify_record();
            }
            None => {
                rooms.insert(id.clone(), Room::new(record));
            }
        }
        debug!(room = %id, "room record written");
        Ok(id)
    }

    async fn get_record(&self, id: &str) -> Result<Option<RoomRecord>, StoreError> {
        self.check_online()?;
        Ok(self
            .rooms
            .lock()
            .await
            .get(id)
            .map(|room| room.record.clone()))
    }

    async fn update_record(&self, id: &str, update: RoomUpdate) -> Result<(), StoreError> {
        self.check_online()?;
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        update.apply(&mut room.record);
        room.notify_record();
        Ok(())
    }

    async fn delete_record(&self, id: &str) -> Result<(), StoreError> {
        self.check_online()?;
        if let Some(room) = self.rooms.lock().await.remove(id) {
            for tx in room.record_watchers {
                let _ = tx.send(None);
            }
            debug!(room = %id, "room record deleted");
        }
        Ok(())
    }

    async fn subscribe_to_record(
        &self,
        id: &str,
    ) -> Result<Subscription<Option<RoomRecord>>, StoreError> {
        self.check_online()?;
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Some(room.record.clone()));
        room.record_watchers.push(tx);
        Ok(Subscription::new(rx))
    }

    async fn append_to_subcollection(
        &self,
        id: &str,
        name: Subcollection,
        item: IceCandidate,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let (entries, watchers) = room.subcollection(name);
        watchers.retain(|tx| tx.send(item.clone()).is_ok());
        entries.push(item);
        Ok(())
    }

    async fn subscribe_to_subcollection_adds(
        &self,
        id: &str,
        name: Subcollection,
    ) -> Result<Subscription<IceCandidate>, StoreError> {
        self.check_online()?;
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let (entries, watchers) = room.subcollection(name);
        let (tx, rx) = mpsc::unbounded_channel();
        for entry in entries.iter() {
            let _ = tx.send(entry.clone());
        }
        watchers.push(tx);
        Ok(Subscription::new(rx))
    }
}
