//! Bounded queue between the producer ingest reader and the distribution
//! loop.
//!
//! Each stream kind gets its own bounded channel so a video burst cannot
//! starve audio (and vice versa). Overflow is drop-newest: `try_send`
//! failures discard the sample and bump the per-kind drop counter, so the
//! ingest reader never blocks on a slow consumer.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use prism_protocol::{AudioSample, StreamMetadata, VideoSample};
use tokio::sync::mpsc;
use tracing::debug;

use crate::stats::StreamStats;

const METADATA_QUEUE: usize = 4;

/// One dequeued item, in per-kind FIFO order.
#[derive(Debug)]
pub enum IngestItem {
    Video(VideoSample),
    Audio(AudioSample),
    Metadata(StreamMetadata),
}

/// Producer side. Cloned into each producer-connection reader task.
#[derive(Clone)]
pub struct IngestSender {
    video_tx: mpsc::Sender<VideoSample>,
    audio_tx: mpsc::Sender<AudioSample>,
    metadata_tx: mpsc::Sender<StreamMetadata>,
    stats: Arc<StreamStats>,
}

/// Consumer side, owned by the distribution loop.
pub struct IngestReceiver {
    video_rx: mpsc::Receiver<VideoSample>,
    audio_rx: mpsc::Receiver<AudioSample>,
    metadata_rx: mpsc::Receiver<StreamMetadata>,
}

/// Build the bounded ingest queue with the configured per-kind capacities.
pub fn ingest_channel(
    video_capacity: usize,
    audio_capacity: usize,
    stats: Arc<StreamStats>,
) -> (IngestSender, IngestReceiver) {
    let (video_tx, video_rx) = mpsc::channel(video_capacity.max(1));
    let (audio_tx, audio_rx) = mpsc::channel(audio_capacity.max(1));
    let (metadata_tx, metadata_rx) = mpsc::channel(METADATA_QUEUE);
    (
        IngestSender {
            video_tx,
            audio_tx,
            metadata_tx,
            stats,
        },
        IngestReceiver {
            video_rx,
            audio_rx,
            metadata_rx,
        },
    )
}

impl IngestSender {
    /// Publish a video sample; returns false if the queue was full and the
    /// sample was dropped.
    pub fn publish_video(&self, sample: VideoSample) -> bool {
        match self.video_tx.try_send(sample) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self
                    .stats
                    .dropped_video_frames
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                if dropped == 1 || dropped.is_multiple_of(100) {
                    debug!(dropped, "Video queue full, dropping frame");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Publish an audio sample; returns false if the queue was full and the
    /// sample was dropped.
    pub fn publish_audio(&self, sample: AudioSample) -> bool {
        match self.audio_tx.try_send(sample) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self
                    .stats
                    .dropped_audio_frames
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                if dropped == 1 || dropped.is_multiple_of(100) {
                    debug!(dropped, "Audio queue full, dropping frame");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn publish_metadata(&self, meta: StreamMetadata) -> bool {
        self.metadata_tx.try_send(meta).is_ok()
    }
}

impl IngestReceiver {
    /// Receive the next item across all kinds. Metadata is polled first so a
    /// stream reconfiguration is seen before the samples that follow it.
    /// Returns `None` once every sender is gone and the queues are empty.
    pub async fn recv(&mut self) -> Option<IngestItem> {
        tokio::select! {
            biased;
            Some(meta) = self.metadata_rx.recv() => Some(IngestItem::Metadata(meta)),
            Some(sample) = self.video_rx.recv() => Some(IngestItem::Video(sample)),
            Some(sample) = self.audio_rx.recv() => Some(IngestItem::Audio(sample)),
            else => None,
        }
    }

    /// Non-blocking variant used by the shutdown drain.
    pub fn try_recv(&mut self) -> Option<IngestItem> {
        if let Ok(meta) = self.metadata_rx.try_recv() {
            return Some(IngestItem::Metadata(meta));
        }
        if let Ok(sample) = self.video_rx.try_recv() {
            return Some(IngestItem::Video(sample));
        }
        if let Ok(sample) = self.audio_rx.try_recv() {
            return Some(IngestItem::Audio(sample));
        }
        None
    }

    #[cfg(test)]
    pub fn queued_video(&self) -> usize {
        self.video_rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use prism_protocol::VideoCodec;
    use std::time::Instant;

    fn video_sample(pts: i64) -> VideoSample {
        VideoSample {
            pts,
            dts: pts,
            keyframe: false,
            width: 1920,
            height: 1080,
            codec: VideoCodec::H264,
            payload: Bytes::from_static(&[0, 0, 0, 1, 0x41]),
            received_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn overflow_drops_newest_and_counts() {
        let stats = Arc::new(StreamStats::default());
        let (tx, rx) = ingest_channel(30, 60, Arc::clone(&stats));

        // No consumer running: only the first 30 fit.
        for pts in 0..200 {
            tx.publish_video(video_sample(pts));
        }

        assert_eq!(rx.queued_video(), 30);
        assert_eq!(stats.snapshot().dropped_video_frames, 170);
    }

    #[tokio::test]
    async fn per_kind_order_is_preserved() {
        let stats = Arc::new(StreamStats::default());
        let (tx, mut rx) = ingest_channel(16, 16, stats);

        for pts in 0..5 {
            assert!(tx.publish_video(video_sample(pts)));
        }

        for expected in 0..5 {
            match rx.recv().await {
                Some(IngestItem::Video(sample)) => assert_eq!(sample.pts, expected),
                other => panic!("expected video sample, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn metadata_is_delivered_before_queued_video() {
        let stats = Arc::new(StreamStats::default());
        let (tx, mut rx) = ingest_channel(16, 16, stats);

        tx.publish_video(video_sample(1));
        tx.publish_metadata(StreamMetadata {
            video_width: 1920,
            video_height: 1080,
            video_codec: VideoCodec::H264,
            video_fps: 60,
            audio_sample_rate: 48_000,
            audio_channels: 2,
        });

        assert!(matches!(rx.recv().await, Some(IngestItem::Metadata(_))));
        assert!(matches!(rx.recv().await, Some(IngestItem::Video(_))));
    }

    #[tokio::test]
    async fn recv_ends_when_sender_dropped() {
        let stats = Arc::new(StreamStats::default());
        let (tx, mut rx) = ingest_channel(4, 4, stats);
        tx.publish_video(video_sample(7));
        drop(tx);

        assert!(matches!(rx.recv().await, Some(IngestItem::Video(_))));
        assert!(rx.recv().await.is_none());
    }
}
