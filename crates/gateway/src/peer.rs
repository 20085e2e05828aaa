use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use prism_protocol::VideoCodec;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_HEVC, MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Monotonic part of every minted peer id. Process-lifetime unique together
/// with the random suffix.
static PEER_SEQ: AtomicU64 = AtomicU64::new(0);

/// How many generated local candidates each session remembers for polling
/// clients.
const LOCAL_CANDIDATE_RING: usize = 64;

/// Constrained Baseline, the profile every browser offers. The producer
/// contract requires parameter sets inside each keyframe, so no further
/// profile negotiation happens here.
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

/// Parameters needed to create a new viewer session.
#[derive(Clone)]
pub struct PeerSessionConfig {
    pub video_codec: VideoCodec,
    /// Advertised on the video section of the answer SDP when set.
    pub max_bitrate_kbps: Option<u32>,
    /// ICE server URLs; empty on a LAN (host candidates only).
    pub ice_servers: Vec<String>,
}

/// Application-level session state.
///
/// ```text
/// New --offer--> Offered --answer + local desc--> Answered
/// Answered --ice connected/completed--> Connected
/// any --transport failure--> Failed
/// any --close--> Closed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Offered,
    Answered,
    Connected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }

    /// Track writes are permitted before ICE completes; the transport
    /// buffers or drops per its own policy.
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            PeerState::Offered | PeerState::Answered | PeerState::Connected
        )
    }
}

/// Lifecycle notifications from a session to its owner.
#[derive(Debug)]
pub enum PeerEvent {
    Connected {
        peer_id: String,
    },
    Terminal {
        peer_id: String,
        state: PeerState,
        was_connected: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("invalid offer: {0}")]
    InvalidOffer(String),
    #[error(transparent)]
    Transport(#[from] webrtc::Error),
}

/// A locally generated ICE candidate, shaped for the signaling response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

type CandidateCallback = Box<dyn Fn(LocalCandidate) + Send + Sync>;

/// One viewer: a peer connection, its two outbound tracks, and the
/// candidate bookkeeping around the offer/answer exchange.
pub struct PeerSession {
    peer_id: String,
    created_at: Instant,
    max_bitrate_kbps: Option<u32>,
    peer_connection: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Arc<TrackLocalStaticSample>,
    state: Mutex<PeerState>,
    gate: Mutex<CandidateGate>,
    /// Serialises candidate application so queued candidates land before
    /// any that trickle in while the queue is draining.
    candidate_apply: tokio::sync::Mutex<()>,
    local_candidates: Mutex<VecDeque<LocalCandidate>>,
    candidate_push: Mutex<Option<CandidateCallback>>,
    was_connected: AtomicBool,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerSession {
    /// Create the peer connection, register the configured codecs, attach
    /// both tracks, and wire the state/candidate callbacks.
    pub async fn connect(
        config: &PeerSessionConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<Self>, PeerError> {
        let peer_id = mint_peer_id();

        let mut media_engine = build_media_engine(config.video_codec)?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);

        let (video_mime, video_fmtp) = video_codec_params(config.video_codec);
        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: video_mime.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: video_fmtp.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "prism".to_string(),
        ));
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "prism".to_string(),
        ));

        let video_sender = peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        let audio_sender = peer_connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Drain inbound RTCP so the interceptor chain keeps running. The
        // feedback itself is not acted on; keyframe cadence is the
        // producer's responsibility.
        for sender in [video_sender, audio_sender] {
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
            });
        }

        let session = Arc::new(Self {
            peer_id,
            created_at: Instant::now(),
            max_bitrate_kbps: config.max_bitrate_kbps,
            peer_connection,
            video_track,
            audio_track,
            state: Mutex::new(PeerState::New),
            gate: Mutex::new(CandidateGate::default()),
            candidate_apply: tokio::sync::Mutex::new(()),
            local_candidates: Mutex::new(VecDeque::with_capacity(LOCAL_CANDIDATE_RING)),
            candidate_push: Mutex::new(None),
            was_connected: AtomicBool::new(false),
            events,
        });
        session.wire_callbacks();

        info!(peer_id = %session.peer_id, codec = %config.video_codec, "Peer session created");
        Ok(session)
    }

    /// Callbacks hold a `Weak` so the peer connection never keeps its own
    /// session alive.
    fn wire_callbacks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.peer_connection
            .on_ice_connection_state_change(Box::new(move |ice_state| {
                if let Some(session) = weak.upgrade() {
                    match ice_state {
                        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                            if session.transition(PeerState::Connected).is_some() {
                                session.was_connected.store(true, Ordering::Relaxed);
                                info!(peer_id = %session.peer_id, "Peer connected");
                                let _ = session.events.send(PeerEvent::Connected {
                                    peer_id: session.peer_id.clone(),
                                });
                            }
                        }
                        _ => {
                            debug!(peer_id = %session.peer_id, ?ice_state, "ICE state changed");
                        }
                    }
                }
                Box::pin(async {})
            }));

        let weak = Arc::downgrade(self);
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |pc_state| {
                if let Some(session) = weak.upgrade() {
                    if pc_state == RTCPeerConnectionState::Failed {
                        let was_connected = session.was_connected.load(Ordering::Relaxed);
                        if let Some(prev) = session.transition(PeerState::Failed) {
                            warn!(peer_id = %session.peer_id, ?prev, "Peer transport failed");
                            let _ = session.events.send(PeerEvent::Terminal {
                                peer_id: session.peer_id.clone(),
                                state: PeerState::Failed,
                                was_connected,
                            });
                        }
                    } else {
                        info!(peer_id = %session.peer_id, ?pc_state, "Peer connection state changed");
                    }
                }
                Box::pin(async {})
            }));

        let weak = Arc::downgrade(self);
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                if let Some(c) = candidate
                    && let Some(session) = weak.upgrade()
                {
                    match c.to_json() {
                        Ok(json) => session.record_local_candidate(LocalCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        }),
                        Err(e) => {
                            warn!(peer_id = %session.peer_id, "Failed to serialize ICE candidate: {e}");
                        }
                    }
                }
                Box::pin(async {})
            }));
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Apply the remote offer and produce the local answer SDP.
    ///
    /// A syntactically invalid offer leaves the session in `New`; the caller
    /// destroys it. On success the session is `Answered` with both
    /// descriptions set, and any candidates that arrived early have been
    /// applied in receipt order.
    pub async fn handle_offer(&self, sdp: &str) -> Result<String, PeerError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| PeerError::InvalidOffer(e.to_string()))?;

        if self.transition(PeerState::Offered).is_none() {
            return Err(PeerError::InvalidOffer(
                "session has already negotiated".to_string(),
            ));
        }

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| PeerError::InvalidOffer(e.to_string()))?;

        self.apply_pending_candidates().await;

        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        self.transition(PeerState::Answered);

        debug!(peer_id = %self.peer_id, "Answer created");
        let answer_sdp = match self.max_bitrate_kbps {
            Some(kbps) => advertise_bitrate(&answer.sdp, kbps),
            None => answer.sdp,
        };
        Ok(answer_sdp)
    }

    /// Queue or apply one remote candidate. Candidates submitted before the
    /// remote description are queued; duplicates are ignored.
    pub async fn add_remote_candidate(
        &self,
        init: RTCIceCandidateInit,
    ) -> Result<(), webrtc::Error> {
        let submission = {
            let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            gate.submit(init)
        };
        match submission {
            Submission::Queued => {
                debug!(peer_id = %self.peer_id, "Candidate queued (no remote description yet)");
                Ok(())
            }
            Submission::Duplicate => {
                debug!(peer_id = %self.peer_id, "Duplicate candidate ignored");
                Ok(())
            }
            Submission::Apply(init) => {
                let _order = self.candidate_apply.lock().await;
                self.peer_connection.add_ice_candidate(init).await
            }
        }
    }

    /// Drain candidates queued before the remote description was set.
    /// A single bad candidate is logged and skipped, not fatal.
    async fn apply_pending_candidates(&self) {
        let _order = self.candidate_apply.lock().await;
        let pending = {
            let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            gate.open_and_drain()
        };
        for init in pending {
            if let Err(e) = self.peer_connection.add_ice_candidate(init).await {
                warn!(peer_id = %self.peer_id, "Queued candidate rejected: {e}");
            }
        }
    }

    /// Register an out-of-band push for locally generated candidates.
    /// Candidates stay in the polling ring either way.
    pub fn on_local_candidate(&self, callback: impl Fn(LocalCandidate) + Send + Sync + 'static) {
        let mut push = self.candidate_push.lock().unwrap_or_else(|e| e.into_inner());
        *push = Some(Box::new(callback));
    }

    fn record_local_candidate(&self, candidate: LocalCandidate) {
        {
            let mut ring = self
                .local_candidates
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if ring.len() == LOCAL_CANDIDATE_RING {
                ring.pop_front();
            }
            ring.push_back(candidate.clone());
        }
        let push = self.candidate_push.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cb) = push.as_ref() {
            cb(candidate);
        }
    }

    /// Return and clear everything accumulated since the last poll.
    pub fn drain_local_candidates(&self) -> Vec<LocalCandidate> {
        let mut ring = self
            .local_candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        ring.drain(..).collect()
    }

    /// Write one video sample. No-op (returns false) unless the session is
    /// in a writable state.
    pub async fn write_video(
        &self,
        payload: Bytes,
        duration: Duration,
    ) -> Result<bool, webrtc::Error> {
        if !self.state().is_writable() {
            return Ok(false);
        }
        self.video_track
            .write_sample(&webrtc::media::Sample {
                data: payload,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }

    /// Write one audio sample. Same no-op rule as [`Self::write_video`].
    pub async fn write_audio(
        &self,
        payload: Bytes,
        duration: Duration,
    ) -> Result<bool, webrtc::Error> {
        if !self.state().is_writable() {
            return Ok(false);
        }
        self.audio_track
            .write_sample(&webrtc::media::Sample {
                data: payload,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }

    /// Transition to `Closed` and release the transport. Safe to call more
    /// than once; only the first call emits the terminal event.
    pub async fn close(&self) {
        let was_connected = self.was_connected.load(Ordering::Relaxed);
        match self.transition(PeerState::Closed) {
            Some(prev) => {
                if !prev.is_terminal() {
                    let _ = self.events.send(PeerEvent::Terminal {
                        peer_id: self.peer_id.clone(),
                        state: PeerState::Closed,
                        was_connected,
                    });
                }
                if let Err(e) = self.peer_connection.close().await {
                    warn!(peer_id = %self.peer_id, "Error closing peer connection: {e}");
                }
                info!(peer_id = %self.peer_id, "Peer session closed");
            }
            None => {
                debug!(peer_id = %self.peer_id, "Close on already-closed session");
            }
        }
    }

    /// Apply a state transition if the edge is legal. Returns the previous
    /// state when the transition happened.
    fn transition(&self, next: PeerState) -> Option<PeerState> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = *state;
        let allowed = match next {
            PeerState::New => false,
            PeerState::Offered => current == PeerState::New,
            PeerState::Answered => current == PeerState::Offered,
            PeerState::Connected => {
                matches!(current, PeerState::Offered | PeerState::Answered)
            }
            PeerState::Failed => !current.is_terminal(),
            // Closing a Failed session releases its resources; Closed stays
            // terminal.
            PeerState::Closed => current != PeerState::Closed,
        };
        if !allowed {
            return None;
        }
        *state = next;
        Some(current)
    }
}

/// Gate for remote candidates around the remote-description boundary.
/// Everything submitted before `open_and_drain` is held in receipt order;
/// repeated candidate strings are ignored.
#[derive(Default)]
struct CandidateGate {
    open: bool,
    pending: Vec<RTCIceCandidateInit>,
    seen: HashSet<String>,
}

enum Submission {
    Queued,
    Apply(RTCIceCandidateInit),
    Duplicate,
}

impl CandidateGate {
    fn submit(&mut self, init: RTCIceCandidateInit) -> Submission {
        if !self.seen.insert(init.candidate.clone()) {
            return Submission::Duplicate;
        }
        if self.open {
            Submission::Apply(init)
        } else {
            self.pending.push(init);
            Submission::Queued
        }
    }

    fn open_and_drain(&mut self) -> Vec<RTCIceCandidateInit> {
        self.open = true;
        std::mem::take(&mut self.pending)
    }
}

fn mint_peer_id() -> String {
    let seq = PEER_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{seq}-{}", &suffix[..8])
}

fn video_codec_params(codec: VideoCodec) -> (&'static str, &'static str) {
    match codec {
        VideoCodec::H264 => (MIME_TYPE_H264, H264_FMTP),
        VideoCodec::Hevc => (MIME_TYPE_HEVC, ""),
    }
}

/// Register only the configured video codec plus Opus. Registering the
/// browser's whole default codec list risks negotiating a codec the
/// producer does not emit.
fn build_media_engine(codec: VideoCodec) -> Result<MediaEngine, webrtc::Error> {
    let mut media_engine = MediaEngine::default();

    let video_feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "ccm".into(),
            parameter: "fir".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "pli".into(),
        },
        RTCPFeedback {
            typ: "transport-cc".into(),
            parameter: "".into(),
        },
    ];

    let (video_mime, video_fmtp) = video_codec_params(codec);
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: video_mime.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: video_fmtp.to_string(),
                rtcp_feedback: video_feedback,
            },
            payload_type: match codec {
                VideoCodec::H264 => 125,
                VideoCodec::Hevc => 126,
            },
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: OPUS_FMTP.to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    Ok(media_engine)
}

/// Insert `b=AS`/`b=TIAS` bandwidth lines into the video media section of an
/// answer SDP. Applied to the SDP returned to the viewer, not to the local
/// description.
fn advertise_bitrate(sdp: &str, kbps: u32) -> String {
    let mut out = String::with_capacity(sdp.len() + 48);
    let mut insert_pending = false;
    for line in sdp.lines() {
        if insert_pending && !line.starts_with("c=") && !line.starts_with("b=") {
            push_bandwidth_lines(&mut out, kbps);
            insert_pending = false;
        }
        out.push_str(line);
        out.push_str("\r\n");
        if line.starts_with("m=video") {
            insert_pending = true;
        }
    }
    if insert_pending {
        push_bandwidth_lines(&mut out, kbps);
    }
    out
}

fn push_bandwidth_lines(out: &mut String, kbps: u32) {
    out.push_str(&format!("b=AS:{kbps}\r\n"));
    out.push_str(&format!("b=TIAS:{}\r\n", kbps as u64 * 1000));
}
