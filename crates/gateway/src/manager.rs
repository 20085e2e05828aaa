//! Owner of the viewer session set.
//!
//! Fan-out takes a snapshot of the sessions under the read lock and releases
//! it before any track write awaits, so signaling handlers creating or
//! removing sessions are never blocked behind a slow transport. Session
//! lifecycle events arrive on a channel and are handled by a background
//! task, which is the only place sessions are removed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::peer::{
    LocalCandidate, PeerError, PeerEvent, PeerSession, PeerSessionConfig, PeerState,
};
use crate::stats::StreamStats;

/// Per-session budget when shutting the whole set down.
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub type PeerHook = Box<dyn Fn(&str) + Send + Sync>;

/// Single-subscriber lifecycle hooks. Hooks run on the event task and must
/// not call back into the manager.
#[derive(Default)]
pub struct PeerHooks {
    pub on_peer_connected: Option<PeerHook>,
    pub on_peer_disconnected: Option<PeerHook>,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerManagerError {
    #[error("invalid offer: {0}")]
    InvalidOffer(String),
    #[error("viewer session limit reached ({limit})")]
    Exhausted { limit: usize },
    #[error("unknown peer '{0}'")]
    NotFound(String),
    #[error(transparent)]
    Transport(#[from] webrtc::Error),
}

pub struct PeerManager {
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
    session_config: PeerSessionConfig,
    max_peers: usize,
    stats: Arc<StreamStats>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    connected: AtomicUsize,
}

impl PeerManager {
    pub fn new(
        session_config: PeerSessionConfig,
        max_peers: usize,
        stats: Arc<StreamStats>,
        hooks: PeerHooks,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            session_config,
            max_peers,
            stats,
            events_tx,
            connected: AtomicUsize::new(0),
        });
        // The event task holds a Weak so the manager can be dropped.
        tokio::spawn(run_peer_events(
            Arc::downgrade(&manager),
            events_rx,
            hooks,
        ));
        manager
    }

    /// Create a session for an inbound offer. On success the session is
    /// registered in `Answered` state and `(peer_id, answer_sdp)` is
    /// returned.
    pub async fn create_peer(
        &self,
        offer_sdp: &str,
    ) -> Result<(String, String), PeerManagerError> {
        if self.sessions.read().await.len() >= self.max_peers {
            return Err(PeerManagerError::Exhausted {
                limit: self.max_peers,
            });
        }

        let session = PeerSession::connect(&self.session_config, self.events_tx.clone())
            .await
            .map_err(map_peer_error)?;

        // Candidates are fetched by polling; the push callback just gives
        // gathering progress a place in the logs.
        session.on_local_candidate({
            let peer_id = session.peer_id().to_string();
            move |candidate| {
                debug!(peer_id = %peer_id, candidate = %candidate.candidate, "Local candidate gathered");
            }
        });

        let answer = match session.handle_offer(offer_sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                session.close().await;
                return Err(map_peer_error(e));
            }
        };

        let peer_id = session.peer_id().to_string();
        {
            let mut sessions = self.sessions.write().await;
            // The cap may have been reached while the answer was built.
            if sessions.len() >= self.max_peers {
                drop(sessions);
                session.close().await;
                return Err(PeerManagerError::Exhausted {
                    limit: self.max_peers,
                });
            }
            sessions.insert(peer_id.clone(), Arc::clone(&session));
        }

        let peer_count = self.peer_count().await;
        info!(peer_id = %peer_id, peers = peer_count, "Viewer session registered");
        Ok((peer_id, answer))
    }

    /// Delegate a trickled remote candidate to its session.
    pub async fn add_remote_candidate(
        &self,
        peer_id: &str,
        init: RTCIceCandidateInit,
    ) -> Result<(), PeerManagerError> {
        let session = self
            .get(peer_id)
            .await
            .ok_or_else(|| PeerManagerError::NotFound(peer_id.to_string()))?;
        session.add_remote_candidate(init).await?;
        Ok(())
    }

    /// Hand back everything the session's candidate ring accumulated since
    /// the last poll.
    pub async fn drain_local_candidates(
        &self,
        peer_id: &str,
    ) -> Result<Vec<LocalCandidate>, PeerManagerError> {
        let session = self
            .get(peer_id)
            .await
            .ok_or_else(|| PeerManagerError::NotFound(peer_id.to_string()))?;
        Ok(session.drain_local_candidates())
    }

    /// Fan one video sample out to every writable session. Individual write
    /// errors are counted and logged, never propagated.
    pub async fn write_video_sample(&self, payload: &Bytes, duration: Duration) {
        for session in self.snapshot().await {
            if let Err(e) = session.write_video(payload.clone(), duration).await {
                self.stats.peer_write_errors.fetch_add(1, Ordering::Relaxed);
                debug!(peer_id = %session.peer_id(), "Video write failed: {e}");
            }
        }
    }

    /// Audio counterpart of [`Self::write_video_sample`].
    pub async fn write_audio_sample(&self, payload: &Bytes, duration: Duration) {
        for session in self.snapshot().await {
            if let Err(e) = session.write_audio(payload.clone(), duration).await {
                self.stats.peer_write_errors.fetch_add(1, Ordering::Relaxed);
                debug!(peer_id = %session.peer_id(), "Audio write failed: {e}");
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Peers that have reached ICE connected at least once and not yet left.
    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }

    /// Close every session, bounded per session, and empty the set.
    pub async fn close(&self) {
        let sessions: Vec<Arc<PeerSession>> = {
            let mut map = self.sessions.write().await;
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            if tokio::time::timeout(SESSION_CLOSE_TIMEOUT, session.close())
                .await
                .is_err()
            {
                warn!(peer_id = %session.peer_id(), "Session close timed out, abandoning");
            }
        }
        info!("All viewer sessions closed");
    }

    async fn get(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().await.get(peer_id).cloned()
    }

    /// Copy the current session list under the read lock; the lock is
    /// released before any caller awaits a track write.
    async fn snapshot(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    async fn remove_session(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.write().await.remove(peer_id)
    }
}

fn map_peer_error(e: PeerError) -> PeerManagerError {
    match e {
        PeerError::InvalidOffer(msg) => PeerManagerError::InvalidOffer(msg),
        PeerError::Transport(e) => PeerManagerError::Transport(e),
    }
}

/// Consume session lifecycle events: maintain the connected gauge, remove
/// failed sessions, and fire the subscriber hooks.
async fn run_peer_events(
    manager: Weak<PeerManager>,
    mut events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    hooks: PeerHooks,
) {
    while let Some(event) = events_rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match event {
            PeerEvent::Connected { peer_id } => {
                manager.connected.fetch_add(1, Ordering::Relaxed);
                info!(
                    peer_id = %peer_id,
                    connected = manager.connected_count(),
                    "Peer reached connected state"
                );
                if let Some(hook) = hooks.on_peer_connected.as_ref() {
                    hook(&peer_id);
                }
            }
            PeerEvent::Terminal {
                peer_id,
                state,
                was_connected,
            } => {
                if was_connected {
                    manager.connected.fetch_sub(1, Ordering::Relaxed);
                }
                if state == PeerState::Failed {
                    if let Some(session) = manager.remove_session(&peer_id).await {
                        let age_secs = session.created_at().elapsed().as_secs();
                        session.close().await;
                        info!(peer_id = %peer_id, age_secs, "Failed session removed");
                    }
                } else {
                    // Explicit close: clear any entry still in the set.
                    manager.remove_session(&peer_id).await;
                }
                if was_connected
                    && let Some(hook) = hooks.on_peer_disconnected.as_ref()
                {
                    hook(&peer_id);
                }
            }
        }
    }
    debug!("Peer event loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::viewer_offer;
    use prism_protocol::VideoCodec;

    fn test_manager(max_peers: usize) -> Arc<PeerManager> {
        PeerManager::new(
            PeerSessionConfig {
                video_codec: VideoCodec::H264,
                max_bitrate_kbps: None,
                ice_servers: Vec::new(),
            },
            max_peers,
            Arc::new(StreamStats::default()),
            PeerHooks::default(),
        )
    }

    #[tokio::test]
    async fn create_peer_returns_answer_and_registers() {
        let manager = test_manager(4);
        let offer = viewer_offer().await;

        let (peer_id, answer) = manager.create_peer(&offer).await.unwrap();
        assert!(!peer_id.is_empty());
        assert!(answer.starts_with("v=0"));
        assert_eq!(manager.peer_count().await, 1);

        manager.close().await;
        assert_eq!(manager.peer_count().await, 0);
    }

    #[tokio::test]
    async fn invalid_offer_creates_no_session() {
        let manager = test_manager(4);
        match manager.create_peer("this is not sdp").await {
            Err(PeerManagerError::InvalidOffer(_)) => {}
            other => panic!("expected InvalidOffer, got {other:?}"),
        }
        assert_eq!(manager.peer_count().await, 0);
    }

    #[tokio::test]
    async fn session_cap_returns_exhausted() {
        let manager = test_manager(1);
        let offer = viewer_offer().await;
        manager.create_peer(&offer).await.unwrap();

        let second = viewer_offer().await;
        match manager.create_peer(&second).await {
            Err(PeerManagerError::Exhausted { limit: 1 }) => {}
            other => panic!("expected Exhausted, got {other:?}"),
        }
        manager.close().await;
    }

    #[tokio::test]
    async fn candidate_for_unknown_peer_is_not_found() {
        let manager = test_manager(4);
        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 UDP 2130706431 10.0.0.1 4444 typ host".to_string(),
            ..Default::default()
        };
        match manager.add_remote_candidate("nonexistent-123", init).await {
            Err(PeerManagerError::NotFound(id)) => assert_eq!(id, "nonexistent-123"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_candidate_is_idempotent() {
        let manager = test_manager(4);
        let offer = viewer_offer().await;
        let (peer_id, _) = manager.create_peer(&offer).await.unwrap();

        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.7 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            ..Default::default()
        };
        manager
            .add_remote_candidate(&peer_id, init.clone())
            .await
            .unwrap();
        manager.add_remote_candidate(&peer_id, init).await.unwrap();

        manager.close().await;
    }

    #[tokio::test]
    async fn fanout_without_peers_is_a_noop() {
        let manager = test_manager(4);
        manager
            .write_video_sample(
                &Bytes::from_static(&[0, 0, 0, 1, 0x65]),
                Duration::from_millis(33),
            )
            .await;
        assert_eq!(manager.stats.peer_write_errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn fanout_reaches_registered_sessions_without_error() {
        let manager = test_manager(4);
        let offer = viewer_offer().await;
        manager.create_peer(&offer).await.unwrap();

        // Session is Answered but not ICE-connected; writes are accepted (or
        // buffered/dropped by the transport) and must not bubble errors.
        manager
            .write_video_sample(
                &Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]),
                Duration::from_millis(33),
            )
            .await;
        manager
            .write_audio_sample(&Bytes::from_static(&[0u8; 8]), Duration::from_millis(20))
            .await;

        manager.close().await;
    }
}
