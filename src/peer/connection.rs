use crate::config::SessionConfig;
use crate::error::TransportError;
use crate::logger::dump_selected_pair;
use crate::peer::data_channel::RtcChannel;
use crate::peer::transport::{CandidateEvents, ChannelEvents, PeerConnection, Transport};
use crate::peer::types::{CandidateEvent, IceCandidate, SdpType, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::{
    api::{APIBuilder, API},
    data_channel::data_channel_init::RTCDataChannelInit,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// [`Transport`] backed by the `webrtc` crate
pub struct RtcTransport {
    api: API,
}

impl RtcTransport {
    pub fn new() -> Self {
        Self {
            api: APIBuilder::new().build(),
        }
    }
}

impl Default for RtcTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for RtcTransport {
    type Connection = RtcPeer;

    async fn create_connection(
        &self,
        config: &SessionConfig,
    ) -> Result<(RtcPeer, CandidateEvents), TransportError> {
        let pc = Arc::new(self.api.new_peer_connection(rtc_config(config)).await?);
        let (tx, rx) = mpsc::unbounded_channel();

        // Trickle: every local candidate goes straight to the exchange
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(CandidateEvent::Candidate(IceCandidate::from(init)));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {:?}", e),
                },
                None => {
                    // cand == None marks the end of gathering
                    let _ = tx.send(CandidateEvent::Complete);
                }
            }
            Box::pin(async {})
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!("ICE gathering state changed to: {:?}", state);
            Box::pin(async {})
        }));

        let pc_state = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!("Peer connection state changed to: {:?}", st);

            match st {
                RTCPeerConnectionState::Connected => {
                    if let Some(pc) = pc_state.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "CONNECTED").await;
                        });
                    }
                }
                RTCPeerConnectionState::Failed => {
                    // No reconnection: closing the peer closes the channel,
                    // which takes the session down
                    warn!("Peer connection failed, closing");
                    if let Some(pc) = pc_state.upgrade() {
                        tokio::spawn(async move {
                            if let Err(e) = pc.close().await {
                                warn!("Failed to close peer connection: {:?}", e);
                            }
                        });
                    }
                }
                _ => {}
            }
            Box::pin(async {})
        }));

        Ok((RtcPeer { pc }, rx))
    }
}

/// One WebRTC peer connection
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    type Channel = RtcChannel;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        to_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        to_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        debug!("Setting local description ({})", desc.sdp_type);
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        debug!("Setting remote description ({})", desc.sdp_type);
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn create_negotiated_channel(
        &self,
        label: &str,
        id: u16,
    ) -> Result<(Arc<RtcChannel>, ChannelEvents), TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(id),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((Arc::new(RtcChannel::attach(dc, tx)), rx))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

fn to_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        other => {
            return Err(TransportError::Negotiation(format!(
                "unsupported description type {other}"
            )))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

/// Peer connection configuration from session settings
fn rtc_config(config: &SessionConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(&config.ice_servers),
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}
