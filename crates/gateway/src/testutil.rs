//! Helpers shared by the async test modules.

use webrtc::api::APIBuilder;
use webrtc::api::media_engine::MediaEngine;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Build the SDP a receive-only viewer would send as its offer.
pub(crate) async fn viewer_offer() -> String {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let api = APIBuilder::new().with_media_engine(media_engine).build();
    let pc = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .unwrap();
    pc.add_transceiver_from_kind(RTPCodecType::Video, None)
        .await
        .unwrap();
    pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
        .await
        .unwrap();
    let offer = pc.create_offer(None).await.unwrap();
    let sdp = offer.sdp.clone();
    let _ = pc.close().await;
    sdp
}
