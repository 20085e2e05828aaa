//! Single consumer of the ingest queue: stamps each sample with a
//! presentation duration and hands it to the peer manager for fan-out.

use std::sync::Arc;
use std::time::Duration;

use prism_protocol::StreamMetadata;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::encoder::AudioEncoder;
use crate::manager::PeerManager;
use crate::queue::{IngestItem, IngestReceiver};
use crate::stats::StreamStats;

/// How long to keep forwarding already-queued samples after shutdown is
/// signalled.
const DRAIN_BUDGET: Duration = Duration::from_millis(500);

/// Assumed framerate when neither config nor metadata supplied one.
const FALLBACK_FPS: u32 = 30;

/// Per-frame presentation duration for a given producer framerate.
pub fn video_duration_from_fps(fps: u32) -> Duration {
    let fps = if fps == 0 { FALLBACK_FPS } else { fps };
    Duration::from_nanos(1_000_000_000 / fps as u64)
}

/// Run until cancelled or the ingest queue closes, then drain briefly.
pub async fn run_distribution(
    mut rx: IngestReceiver,
    manager: Arc<PeerManager>,
    stats: Arc<StreamStats>,
    default_fps: u32,
    mut audio_encoder: Box<dyn AudioEncoder>,
    metadata_tx: watch::Sender<Option<StreamMetadata>>,
    cancel: CancellationToken,
) {
    let mut video_duration = video_duration_from_fps(default_fps);

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => item,
        };
        match item {
            Some(item) => {
                handle_item(
                    item,
                    &manager,
                    &stats,
                    &mut video_duration,
                    &mut audio_encoder,
                    &metadata_tx,
                )
                .await;
            }
            None => {
                info!("Ingest queue closed, distribution ending");
                return;
            }
        }
    }

    // Forward what is already queued so viewers are not cut mid-GOP, but
    // never hold shutdown for long.
    let deadline = Instant::now() + DRAIN_BUDGET;
    while Instant::now() < deadline {
        let Some(item) = rx.try_recv() else { break };
        handle_item(
            item,
            &manager,
            &stats,
            &mut video_duration,
            &mut audio_encoder,
            &metadata_tx,
        )
        .await;
    }
    info!("Distribution loop stopped");
}

async fn handle_item(
    item: IngestItem,
    manager: &PeerManager,
    stats: &StreamStats,
    video_duration: &mut Duration,
    audio_encoder: &mut Box<dyn AudioEncoder>,
    metadata_tx: &watch::Sender<Option<StreamMetadata>>,
) {
    match item {
        IngestItem::Metadata(meta) => {
            *video_duration = video_duration_from_fps(meta.video_fps);
            info!(
                width = meta.video_width,
                height = meta.video_height,
                codec = %meta.video_codec,
                fps = meta.video_fps,
                audio_rate = meta.audio_sample_rate,
                "Stream metadata updated"
            );
            let _ = metadata_tx.send(Some(meta));
        }
        IngestItem::Video(sample) => {
            stats.record_video(sample.payload.len());
            manager
                .write_video_sample(&sample.payload, *video_duration)
                .await;
        }
        IngestItem::Audio(sample) => {
            stats.record_audio(sample.payload.len());
            let duration = sample.duration();
            match audio_encoder.encode(&sample) {
                Ok(payload) => manager.write_audio_sample(&payload, duration).await,
                Err(e) => debug!("Audio encode failed, frame skipped: {e:#}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Passthrough;
    use crate::manager::{PeerHooks, PeerManager};
    use crate::peer::PeerSessionConfig;
    use crate::queue::ingest_channel;
    use bytes::Bytes;
    use prism_protocol::{AudioSample, VideoCodec, VideoSample};

    #[test]
    fn duration_policy_matches_fps() {
        assert_eq!(video_duration_from_fps(60), Duration::from_nanos(16_666_666));
        assert_eq!(video_duration_from_fps(30), Duration::from_nanos(33_333_333));
        // Unknown fps falls back to 30.
        assert_eq!(video_duration_from_fps(0), Duration::from_nanos(33_333_333));
    }

    fn video_sample(pts: i64) -> VideoSample {
        VideoSample {
            pts,
            dts: pts,
            keyframe: pts == 0,
            width: 1920,
            height: 1080,
            codec: VideoCodec::H264,
            payload: Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]),
            received_at: std::time::Instant::now(),
        }
    }

    fn audio_sample(pts: i64) -> AudioSample {
        AudioSample {
            pts,
            sample_rate: 48_000,
            channels: 2,
            sample_count: 960,
            payload: Bytes::from_static(&[0u8; 16]),
            received_at: std::time::Instant::now(),
        }
    }

    #[tokio::test]
    async fn samples_are_counted_and_metadata_published() {
        let stats = Arc::new(StreamStats::default());
        let (tx, rx) = ingest_channel(16, 16, Arc::clone(&stats));
        let manager = PeerManager::new(
            PeerSessionConfig {
                video_codec: VideoCodec::H264,
                max_bitrate_kbps: None,
                ice_servers: Vec::new(),
            },
            4,
            Arc::clone(&stats),
            PeerHooks::default(),
        );
        let (meta_tx, mut meta_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_distribution(
            rx,
            manager,
            Arc::clone(&stats),
            30,
            Box::new(Passthrough),
            meta_tx,
            cancel.clone(),
        ));

        tx.publish_metadata(StreamMetadata {
            video_width: 1920,
            video_height: 1080,
            video_codec: VideoCodec::H264,
            video_fps: 60,
            audio_sample_rate: 48_000,
            audio_channels: 2,
        });
        for pts in 0..3 {
            tx.publish_video(video_sample(pts));
        }
        tx.publish_audio(audio_sample(0));

        tokio::time::timeout(Duration::from_secs(5), meta_rx.changed())
            .await
            .expect("metadata not forwarded")
            .unwrap();
        assert_eq!(meta_rx.borrow().unwrap().video_fps, 60);

        // Let the loop consume everything queued, then stop it.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snap = stats.snapshot();
                if snap.video_frames == 3 && snap.audio_frames == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("samples not consumed");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn loop_ends_when_ingest_closes() {
        let stats = Arc::new(StreamStats::default());
        let (tx, rx) = ingest_channel(4, 4, Arc::clone(&stats));
        let manager = PeerManager::new(
            PeerSessionConfig {
                video_codec: VideoCodec::H264,
                max_bitrate_kbps: None,
                ice_servers: Vec::new(),
            },
            4,
            Arc::clone(&stats),
            PeerHooks::default(),
        );
        let (meta_tx, _meta_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_distribution(
            rx,
            manager,
            stats,
            30,
            Box::new(Passthrough),
            meta_tx,
            cancel,
        ));

        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("distribution did not stop")
            .unwrap();
    }
}
