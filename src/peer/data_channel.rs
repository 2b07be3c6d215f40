use crate::codec::{self, Inbound};
use crate::error::{SessionError, TransportError};
use crate::peer::state::ChannelState;
use crate::peer::transport::DataChannel;
use crate::peer::types::ChannelEvent;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

/// Greeting sent as soon as the channel opens
pub fn greeting(is_initiator: bool, local_id: &str) -> String {
    if is_initiator {
        format!("Created by {local_id}")
    } else {
        format!("{local_id} joined")
    }
}

/// Session-scoped allocator for negotiated channel ids
#[derive(Debug)]
pub struct ChannelIds {
    next: AtomicU16,
}

impl ChannelIds {
    pub fn starting_at(first: u16) -> Self {
        Self {
            next: AtomicU16::new(first),
        }
    }

    /// Next free id. `u16::MAX` is reserved and never handed out.
    pub fn allocate(&self) -> Result<u16, SessionError> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                (id < u16::MAX).then(|| id + 1)
            })
            .map_err(|_| SessionError::ChannelIdsExhausted)
    }
}

/// What the owner has to do after an event went through the manager
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOutcome {
    /// Channel just opened; the greeting is already on the wire
    Opened,
    Delivered(Inbound),
    /// Channel closed for any reason; the whole session must go down
    Closed,
    Ignored,
}

/// Owns the negotiated channel of one session: greeting on open, decoding of
/// inbound frames, idempotent close.
pub struct ChannelManager<D> {
    channel: Arc<D>,
    greeting: String,
    state: Mutex<ChannelState>,
}

impl<D: DataChannel> ChannelManager<D> {
    pub fn new(channel: Arc<D>, greeting: String) -> Self {
        Self {
            channel,
            greeting,
            state: Mutex::new(ChannelState::Connecting),
        }
    }

    pub fn channel_id(&self) -> u16 {
        self.channel.id()
    }

    pub async fn state(&self) -> ChannelState {
        *self.state.lock().await
    }

    pub async fn on_event(&self, event: ChannelEvent) -> ChannelOutcome {
        match event {
            ChannelEvent::Open => {
                {
                    let mut state = self.state.lock().await;
                    if *state != ChannelState::Connecting {
                        return ChannelOutcome::Ignored;
                    }
                    *state = ChannelState::Open;
                }
                info!("Data channel {} open, sending greeting", self.channel.id());
                if let Err(e) = self.channel.send_text(self.greeting.clone()).await {
                    warn!("Failed to send greeting: {}", e);
                }
                ChannelOutcome::Opened
            }
            ChannelEvent::Message(data) => {
                if *self.state.lock().await == ChannelState::Closed {
                    return ChannelOutcome::Ignored;
                }
                let text = String::from_utf8_lossy(&data).into_owned();
                debug!("Received message, length: {}", data.len());
                ChannelOutcome::Delivered(codec::decode(&text))
            }
            ChannelEvent::Closed => {
                let mut state = self.state.lock().await;
                if *state == ChannelState::Closed {
                    return ChannelOutcome::Ignored;
                }
                *state = ChannelState::Closed;
                info!("Data channel {} closed", self.channel.id());
                ChannelOutcome::Closed
            }
        }
    }

    /// Send raw text. Returns `false` without sending when the channel is not
    /// open or `text` is empty.
    pub async fn send(&self, text: &str) -> Result<bool, TransportError> {
        if text.is_empty() || *self.state.lock().await != ChannelState::Open {
            return Ok(false);
        }
        self.channel.send_text(text.to_string()).await?;
        Ok(true)
    }

    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        if let Err(e) = self.channel.close().await {
            debug!("Closing data channel failed: {}", e);
        }
    }
}

/// WebRTC data channel
pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl RtcChannel {
    /// Wrap `dc`, forwarding its callbacks as [`ChannelEvent`]s
    pub fn attach(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        dc.on_open(Box::new({
            let events = events.clone();
            move || {
                let _ = events.send(ChannelEvent::Open);
                Box::pin(async {})
            }
        }));

        dc.on_message(Box::new({
            let events = events.clone();
            move |msg: DataChannelMessage| {
                let _ = events.send(ChannelEvent::Message(msg.data));
                Box::pin(async {})
            }
        }));

        dc.on_close(Box::new(move || {
            let _ = events.send(ChannelEvent::Closed);
            Box::pin(async {})
        }));

        Self { dc }
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn id(&self) -> u16 {
        self.dc.id()
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc.close().await?;
        Ok(())
    }
}
