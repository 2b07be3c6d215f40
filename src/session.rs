//! Connection coordinator.
//!
//! A [`Session`] drives one participant through creating or joining a room.
//! Every subscription it opens runs in a background task the session owns;
//! [`Session::leave`], or the data channel closing, aborts those tasks, closes
//! the transport and deletes the room record if this participant created it.
//!
//! Each attempt carries an epoch. Work that finishes after its attempt was torn
//! down finds a different epoch (or none) and its result is dropped.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{self, DataMessage, Inbound};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::motion::{PositionFilter, Vector3};
use crate::peer::data_channel::{greeting, ChannelIds, ChannelManager, ChannelOutcome};
use crate::peer::ice::{publish_local, CandidateExchange};
use crate::peer::state::{ChannelState, ConnectionState, Role};
use crate::peer::transport::{CandidateEvents, ChannelEvents, PeerConnection, Transport};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::signaling::{RoomRecord, RoomUpdate, SignalingStore, Subcollection, Subscription};
use crate::utils::random_id;

const EVENT_CAPACITY: usize = 256;

/// Notifications for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// A line was appended to the transcript (sent or received)
    Message(String),
    /// New filtered position of the remote cursor
    Position(Vector3),
    Closed { reason: Option<String> },
}

/// Resources of one attempt, released by teardown
struct Attempt<C: PeerConnection> {
    epoch: u64,
    owned_room: Option<String>,
    connection: Option<Arc<C>>,
    exchange: Option<Arc<CandidateExchange<C>>>,
    channel: Option<Arc<ChannelManager<C::Channel>>>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: PeerConnection> Attempt<C> {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            owned_room: None,
            connection: None,
            exchange: None,
            channel: None,
            local_description: None,
            remote_description: None,
            tasks: Vec::new(),
        }
    }
}

/// What the presentation layer can observe; survives teardown
#[derive(Default)]
struct View {
    role: Option<Role>,
    room_id: Option<String>,
    creator_id: Option<String>,
    channel_id: Option<u16>,
    transcript: Vec<String>,
    filter: PositionFilter,
    position: Vector3,
}

struct Inner<C: PeerConnection> {
    epoch: u64,
    attempt: Option<Attempt<C>>,
    view: View,
}

struct Shared<S, C: PeerConnection> {
    store: Arc<S>,
    local_id: String,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    inner: Mutex<Inner<C>>,
}

impl<S: SignalingStore, C: PeerConnection> Shared<S, C> {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn begin(&self, role: Role) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.attempt.is_some() {
            return Err(SessionError::AlreadyStarted);
        }
        inner.epoch += 1;
        let epoch = inner.epoch;
        inner.attempt = Some(Attempt::new(epoch));
        inner.view = View {
            role: Some(role),
            ..View::default()
        };
        self.state.send_replace(ConnectionState::Idle);
        Ok(epoch)
    }

    /// Run `f` against the attempt identified by `epoch`, or fail with
    /// [`SessionError::Closed`] if it has been torn down.
    async fn with_attempt<R>(
        &self,
        epoch: u64,
        f: impl FnOnce(&mut Attempt<C>, &mut View) -> R,
    ) -> Result<R> {
        let mut guard = self.inner.lock().await;
        let Inner { attempt, view, .. } = &mut *guard;
        match attempt {
            Some(attempt) if attempt.epoch == epoch => Ok(f(attempt, view)),
            _ => Err(SessionError::Closed),
        }
    }

    /// Move the state machine forward; never backwards and never out of `Closed`.
    async fn advance(&self, epoch: u64, to: ConnectionState) {
        let changed = {
            let guard = self.inner.lock().await;
            if !matches!(&guard.attempt, Some(attempt) if attempt.epoch == epoch) {
                return;
            }
            self.state.send_if_modified(|current| {
                if !current.is_terminal() && current.rank() < to.rank() {
                    *current = to;
                    true
                } else {
                    false
                }
            })
        };
        if changed {
            info!(state = %to, "Connection state changed");
            self.emit(SessionEvent::StateChanged(to));
        }
    }

    async fn spawn_task<F>(&self, epoch: u64, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.inner.lock().await;
        match guard.attempt.as_mut() {
            Some(attempt) if attempt.epoch == epoch => {
                attempt.tasks.push(tokio::spawn(task));
                Ok(())
            }
            _ => Err(SessionError::Closed),
        }
    }

    async fn claim_local_description(&self, epoch: u64, desc: &SessionDescription) -> Result<()> {
        self.with_attempt(epoch, |attempt, _| {
            if attempt.local_description.is_some() {
                return Err(SessionError::DescriptionAlreadySet("local"));
            }
            attempt.local_description = Some(desc.clone());
            Ok(())
        })
        .await?
    }

    async fn claim_remote_description(&self, epoch: u64, desc: &SessionDescription) -> Result<()> {
        self.with_attempt(epoch, |attempt, _| {
            if attempt.remote_description.is_some() {
                return Err(SessionError::DescriptionAlreadySet("remote"));
            }
            attempt.remote_description = Some(desc.clone());
            Ok(())
        })
        .await?
    }

    /// Creator side: apply the answer the first time a snapshot carries one.
    /// Later snapshots, with or without an answer, are ignored.
    async fn on_room_snapshot(&self, epoch: u64, snapshot: Option<RoomRecord>) -> Result<()> {
        let Some(record) = snapshot else {
            debug!("Room record removed");
            return Ok(());
        };

        let claimed = self
            .with_attempt(epoch, |attempt, _| {
                let answer = record.answer.as_ref().filter(|a| !a.sdp.is_empty())?;
                if attempt.remote_description.is_some() {
                    return None;
                }
                attempt.remote_description = Some(answer.clone());
                Some((attempt.connection.clone(), attempt.exchange.clone(), answer.clone()))
            })
            .await?;

        let Some((Some(connection), Some(exchange), answer)) = claimed else {
            return Ok(());
        };

        info!("Got remote description (answer)");
        connection.set_remote_description(answer).await?;
        exchange.remote_description_set().await?;
        Ok(())
    }

    async fn deliver(&self, epoch: u64, inbound: Inbound) {
        match inbound {
            Inbound::Chat(text) => {
                let appended = self
                    .with_attempt(epoch, |_, view| view.transcript.push(text.clone()))
                    .await;
                if appended.is_ok() {
                    self.emit(SessionEvent::Message(text));
                }
            }
            Inbound::Data(DataMessage::RemoteMove(sample)) => {
                let now = chrono::Utc::now().timestamp_millis() as f64;
                let position = self
                    .with_attempt(epoch, |_, view| {
                        view.position = view.filter.update(now, sample);
                        view.position
                    })
                    .await;
                if let Ok(position) = position {
                    self.emit(SessionEvent::Position(position));
                }
            }
            Inbound::Ignored => {}
        }
    }

    /// Tear down the attempt `epoch` (any attempt when `None`). Returns
    /// `false` when there was nothing to tear down.
    async fn teardown(&self, epoch: Option<u64>, reason: Option<String>) -> Result<bool> {
        let attempt = {
            let mut guard = self.inner.lock().await;
            let mut attempt = match guard.attempt.take() {
                Some(attempt) if epoch.map_or(true, |e| e == attempt.epoch) => attempt,
                other => {
                    guard.attempt = other;
                    return Ok(false);
                }
            };
            for task in attempt.tasks.drain(..) {
                task.abort();
            }
            self.state.send_replace(ConnectionState::Closed);
            attempt
        };

        match &reason {
            Some(reason) => warn!("Tearing down session: {}", reason),
            None => info!("Tearing down session"),
        }
        self.emit(SessionEvent::StateChanged(ConnectionState::Closed));
        self.emit(SessionEvent::Closed { reason });

        if let Some(channel) = attempt.channel {
            channel.close().await;
        }
        if let Some(connection) = attempt.connection {
            if let Err(e) = connection.close().await {
                warn!("Failed to close peer connection: {}", e);
            }
        }
        if let Some(room_id) = attempt.owned_room {
            self.store.delete_record(&room_id).await?;
            info!(room = %room_id, "Room record deleted");
        }
        Ok(true)
    }
}

// Teardown from inside an owned task must not abort itself half way, so it
// runs detached.
fn spawn_teardown<S: SignalingStore, C: PeerConnection>(
    shared: &Arc<Shared<S, C>>,
    epoch: u64,
    reason: SessionError,
) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        if let Err(e) = shared.teardown(Some(epoch), Some(reason.to_string())).await {
            warn!("Teardown incomplete: {}", e);
        }
    });
}

async fn pump_channel<S: SignalingStore, C: PeerConnection>(
    shared: Arc<Shared<S, C>>,
    epoch: u64,
    channel: Arc<ChannelManager<C::Channel>>,
    mut events: ChannelEvents,
) {
    while let Some(event) = events.recv().await {
        match channel.on_event(event).await {
            ChannelOutcome::Opened => shared.advance(epoch, ConnectionState::Connected).await,
            ChannelOutcome::Delivered(inbound) => shared.deliver(epoch, inbound).await,
            ChannelOutcome::Closed => {
                spawn_teardown(&shared, epoch, SessionError::ChannelClosedUnexpectedly);
                return;
            }
            ChannelOutcome::Ignored => {}
        }
    }

    if channel.state().await != ChannelState::Closed {
        spawn_teardown(&shared, epoch, SessionError::ChannelClosedUnexpectedly);
    }
}

async fn watch_answer<S: SignalingStore, C: PeerConnection>(
    shared: Arc<Shared<S, C>>,
    epoch: u64,
    mut snapshots: Subscription<Option<RoomRecord>>,
) {
    while let Some(snapshot) = snapshots.next().await {
        if let Err(e) = shared.on_room_snapshot(epoch, snapshot).await {
            if !matches!(e, SessionError::Closed) {
                error!("Failed to apply remote answer: {}", e);
                spawn_teardown(&shared, epoch, e);
            }
            return;
        }
    }
}

async fn apply_candidates<S: SignalingStore, C: PeerConnection>(
    shared: Arc<Shared<S, C>>,
    epoch: u64,
    exchange: Arc<CandidateExchange<C>>,
    mut additions: Subscription<IceCandidate>,
) {
    while let Some(candidate) = additions.next().await {
        if let Err(e) = exchange.apply_remote(candidate).await {
            error!("Failed to add remote ICE candidate: {}", e);
            spawn_teardown(&shared, epoch, e.into());
            return;
        }
    }
}

async fn publish_candidates<S: SignalingStore, C: PeerConnection>(
    shared: Arc<Shared<S, C>>,
    epoch: u64,
    room_id: String,
    outgoing: Subcollection,
    candidates: CandidateEvents,
) {
    match publish_local(shared.store.as_ref(), &room_id, outgoing, candidates).await {
        Ok(count) => debug!("Published {} local candidates to {}", count, outgoing),
        Err(e) => {
            error!("Failed to publish local candidates: {}", e);
            spawn_teardown(&shared, epoch, e.into());
        }
    }
}

/// One participant of a two-party room.
pub struct Session<S: SignalingStore, T: Transport> {
    transport: T,
    config: SessionConfig,
    channel_ids: ChannelIds,
    shared: Arc<Shared<S, T::Connection>>,
}

impl<S: SignalingStore, T: Transport> Session<S, T> {
    pub fn new(store: Arc<S>, transport: T, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let local_id = random_id();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        debug!(local_id = %local_id, "Session created");

        Ok(Self {
            transport,
            channel_ids: ChannelIds::starting_at(config.first_channel_id),
            config,
            shared: Arc::new(Shared {
                store,
                local_id,
                state,
                events,
                inner: Mutex::new(Inner {
                    epoch: 0,
                    attempt: None,
                    view: View::default(),
                }),
            }),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the session reaches `target`. Returns early with `Closed`
    /// if the attempt ends first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> ConnectionState {
        let mut rx = self.watch_state();
        let state = match rx.wait_for(|state| *state == target || state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Closed,
        };
        state
    }

    pub async fn role(&self) -> Option<Role> {
        self.shared.inner.lock().await.view.role
    }

    pub async fn room_id(&self) -> Option<String> {
        self.shared.inner.lock().await.view.room_id.clone()
    }

    pub async fn channel_id(&self) -> Option<u16> {
        self.shared.inner.lock().await.view.channel_id
    }

    pub async fn transcript(&self) -> Vec<String> {
        self.shared.inner.lock().await.view.transcript.clone()
    }

    pub async fn remote_position(&self) -> Vector3 {
        self.shared.inner.lock().await.view.position
    }

    /// Whether the room record names this participant as its creator
    pub async fn is_initiator(&self) -> bool {
        self.shared.inner.lock().await.view.creator_id.as_deref() == Some(self.local_id())
    }

    /// Create a room, publish the offer and wait for an answer in the
    /// background. Returns the room id to hand to the joiner.
    pub async fn start_as_creator(&self) -> Result<String> {
        let epoch = self.shared.begin(Role::Creator).await?;
        info!("Creating room as {}", self.local_id());
        match self.run_creator(epoch).await {
            Ok(room_id) => Ok(room_id),
            Err(err) => Err(self.abort(epoch, err).await),
        }
    }

    /// Join an existing room and publish the answer.
    pub async fn join_as_joiner(&self, room_id: &str) -> Result<()> {
        let epoch = self.shared.begin(Role::Joiner).await?;
        info!(room = %room_id, "Joining room as {}", self.local_id());
        match self.run_joiner(epoch, room_id).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.abort(epoch, err).await),
        }
    }

    /// End the session. Safe to call repeatedly or before any attempt.
    pub async fn leave(&self) -> Result<()> {
        self.shared.teardown(None, None).await.map(|_| ())
    }

    /// Send a chat line and append it to the local transcript. Returns `false`
    /// when nothing was sent (channel not open or empty text).
    pub async fn send_chat(&self, text: &str) -> Result<bool> {
        let Some((epoch, channel)) = self.current_channel().await else {
            return Ok(false);
        };
        if !channel.send(text).await? {
            return Ok(false);
        }
        let appended = self
            .shared
            .with_attempt(epoch, |_, view| view.transcript.push(text.to_string()))
            .await;
        if appended.is_ok() {
            self.shared.emit(SessionEvent::Message(text.to_string()));
        }
        Ok(true)
    }

    /// Send a raw accelerometer sample as a `remote_move` message.
    pub async fn send_move(&self, sample: Vector3) -> Result<bool> {
        let Some((_, channel)) = self.current_channel().await else {
            return Ok(false);
        };
        let message = DataMessage::RemoteMove(sample);
        debug!("Sending {} message", message.msg_type());
        let encoded = codec::encode(&message)?;
        Ok(channel.send(&encoded).await?)
    }

    async fn current_channel(&self) -> Option<(u64, Arc<ChannelManager<<T::Connection as PeerConnection>::Channel>>)> {
        let inner = self.shared.inner.lock().await;
        let attempt = inner.attempt.as_ref()?;
        attempt
            .channel
            .as_ref()
            .map(|channel| (attempt.epoch, Arc::clone(channel)))
    }

    /// Tear down a failed setup. A step that fails after the attempt was
    /// already torn down reports `Closed`, not its own error.
    async fn abort(&self, epoch: u64, err: SessionError) -> SessionError {
        match self.shared.teardown(Some(epoch), Some(err.to_string())).await {
            Ok(true) => {
                warn!("Setup aborted: {}", err);
                err
            }
            Ok(false) => {
                debug!("Setup step finished after teardown: {}", err);
                SessionError::Closed
            }
            Err(e) => {
                warn!("Setup aborted: {}, cleanup incomplete: {}", err, e);
                err
            }
        }
    }

    async fn create_connection(
        &self,
        epoch: u64,
    ) -> Result<(
        Arc<T::Connection>,
        Arc<CandidateExchange<T::Connection>>,
        CandidateEvents,
    )> {
        let (connection, candidates) = self.transport.create_connection(&self.config).await?;
        let connection = Arc::new(connection);
        let exchange = Arc::new(CandidateExchange::new(Arc::clone(&connection)));

        let attached = self
            .shared
            .with_attempt(epoch, |attempt, _| {
                attempt.connection = Some(Arc::clone(&connection));
                attempt.exchange = Some(Arc::clone(&exchange));
            })
            .await;
        if let Err(e) = attached {
            let _ = connection.close().await;
            return Err(e);
        }

        self.shared
            .advance(epoch, ConnectionState::TransportCreated)
            .await;
        Ok((connection, exchange, candidates))
    }

    async fn open_channel(
        &self,
        epoch: u64,
        connection: &T::Connection,
        channel_id: u16,
        is_initiator: bool,
    ) -> Result<()> {
        let (channel, events) = connection
            .create_negotiated_channel(&self.config.channel_label, channel_id)
            .await?;
        let manager = Arc::new(ChannelManager::new(
            channel,
            greeting(is_initiator, self.local_id()),
        ));

        self.shared
            .with_attempt(epoch, |attempt, view| {
                attempt.channel = Some(Arc::clone(&manager));
                view.channel_id = Some(manager.channel_id());
            })
            .await?;

        self.shared
            .spawn_task(
                epoch,
                pump_channel(Arc::clone(&self.shared), epoch, manager, events),
            )
            .await
    }

    async fn run_creator(&self, epoch: u64) -> Result<String> {
        let shared = &self.shared;
        let (connection, exchange, candidates) = self.create_connection(epoch).await?;

        shared
            .with_attempt(epoch, |_, view| {
                view.creator_id = Some(shared.local_id.clone());
            })
            .await?;

        let channel_id = self.channel_ids.allocate()?;
        self.open_channel(epoch, &connection, channel_id, true)
            .await?;

        let offer = connection.create_offer().await?;
        shared.claim_local_description(epoch, &offer).await?;
        connection.set_local_description(offer.clone()).await?;
        shared.advance(epoch, ConnectionState::OfferSet).await;

        let record = RoomRecord {
            creator_id: shared.local_id.clone(),
            channel_id,
            offer: Some(offer),
            answer: None,
        };
        let room_id = shared.store.create_record(None, record).await?;

        let owned = shared
            .with_attempt(epoch, |attempt, view| {
                attempt.owned_room = Some(room_id.clone());
                view.room_id = Some(room_id.clone());
            })
            .await;
        if let Err(e) = owned {
            // Torn down while the write was in flight: the record is ours to remove
            if let Err(err) = shared.store.delete_record(&room_id).await {
                warn!(room = %room_id, "Failed to remove orphaned room: {}", err);
            }
            return Err(e);
        }
        info!(room = %room_id, channel_id, "Room created");

        shared
            .spawn_task(
                epoch,
                publish_candidates(
                    Arc::clone(shared),
                    epoch,
                    room_id.clone(),
                    Subcollection::outgoing(Role::Creator),
                    candidates,
                ),
            )
            .await?;

        let snapshots = shared.store.subscribe_to_record(&room_id).await?;
        shared
            .spawn_task(epoch, watch_answer(Arc::clone(shared), epoch, snapshots))
            .await?;

        let additions = shared
            .store
            .subscribe_to_subcollection_adds(&room_id, Subcollection::incoming(Role::Creator))
            .await?;
        shared
            .spawn_task(
                epoch,
                apply_candidates(Arc::clone(shared), epoch, exchange, additions),
            )
            .await?;

        shared.advance(epoch, ConnectionState::AwaitingAnswer).await;
        Ok(room_id)
    }

    async fn run_joiner(&self, epoch: u64, room_id: &str) -> Result<()> {
        let shared = &self.shared;
        let (connection, exchange, candidates) = self.create_connection(epoch).await?;
        shared.advance(epoch, ConnectionState::AwaitingOffer).await;

        let record = shared
            .store
            .get_record(room_id)
            .await?
            .ok_or_else(|| SessionError::RoomNotFound(room_id.to_string()))?;
        let offer = record
            .offer
            .clone()
            .ok_or_else(|| SessionError::IncompleteRoom(room_id.to_string()))?;
        let is_initiator = record.creator_id == shared.local_id;

        shared
            .with_attempt(epoch, |_, view| {
                view.room_id = Some(room_id.to_string());
                view.creator_id = Some(record.creator_id.clone());
            })
            .await?;

        self.open_channel(epoch, &connection, record.channel_id, is_initiator)
            .await?;

        let additions = shared
            .store
            .subscribe_to_subcollection_adds(room_id, Subcollection::incoming(Role::Joiner))
            .await?;
        shared
            .spawn_task(
                epoch,
                apply_candidates(Arc::clone(shared), epoch, Arc::clone(&exchange), additions),
            )
            .await?;

        shared.claim_remote_description(epoch, &offer).await?;
        connection.set_remote_description(offer).await?;
        exchange.remote_description_set().await?;

        let answer = connection.create_answer().await?;
        shared.claim_local_description(epoch, &answer).await?;
        connection.set_local_description(answer.clone()).await?;

        shared
            .spawn_task(
                epoch,
                publish_candidates(
                    Arc::clone(shared),
                    epoch,
                    room_id.to_string(),
                    Subcollection::outgoing(Role::Joiner),
                    candidates,
                ),
            )
            .await?;

        shared
            .store
            .update_record(room_id, RoomUpdate::answer(answer))
            .await?;
        shared.with_attempt(epoch, |_, _| ()).await?;
        shared.advance(epoch, ConnectionState::AnswerSet).await;
        info!(room = %room_id, channel_id = record.channel_id, "Answer written");
        Ok(())
    }
}

impl<S: SignalingStore, T: Transport> Drop for Session<S, T> {
    fn drop(&mut self) {
        // Stop background work even if leave() was never awaited
        if let Ok(mut inner) = self.shared.inner.try_lock() {
            if let Some(attempt) = inner.attempt.as_mut() {
                for task in attempt.tasks.drain(..) {
                    task.abort();
                }
            }
        }
    }
}
