//! Rolling counters for the ingest and fan-out paths, plus the periodic
//! throughput summary.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::manager::PeerManager;

/// Shared counters. Ingest, the queue, the distribution loop, and the peer
/// manager all hold an `Arc` and bump these lock-free.
#[derive(Debug, Default)]
pub struct StreamStats {
    pub video_frames: AtomicU64,
    pub video_bytes: AtomicU64,
    pub audio_frames: AtomicU64,
    pub audio_bytes: AtomicU64,
    pub dropped_video_frames: AtomicU64,
    pub dropped_audio_frames: AtomicU64,
    pub peer_write_errors: AtomicU64,
    pub producer_connects: AtomicU64,
}

impl StreamStats {
    pub fn record_video(&self, bytes: usize) {
        self.video_frames.fetch_add(1, Ordering::Relaxed);
        self.video_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_audio(&self, bytes: usize) {
        self.audio_frames.fetch_add(1, Ordering::Relaxed);
        self.audio_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            video_frames: self.video_frames.load(Ordering::Relaxed),
            video_bytes: self.video_bytes.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
            audio_bytes: self.audio_bytes.load(Ordering::Relaxed),
            dropped_video_frames: self.dropped_video_frames.load(Ordering::Relaxed),
            dropped_audio_frames: self.dropped_audio_frames.load(Ordering::Relaxed),
            peer_write_errors: self.peer_write_errors.load(Ordering::Relaxed),
            producer_connects: self.producer_connects.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub video_frames: u64,
    pub video_bytes: u64,
    pub audio_frames: u64,
    pub audio_bytes: u64,
    pub dropped_video_frames: u64,
    pub dropped_audio_frames: u64,
    pub peer_write_errors: u64,
    pub producer_connects: u64,
}

/// Format an uptime as a compact human-readable string, e.g. "1h23m45s".
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Log a structured throughput summary every `interval_secs` until shutdown.
pub async fn run_stats_loop(
    stats: Arc<StreamStats>,
    manager: Arc<PeerManager>,
    interval_secs: u64,
    cancel: CancellationToken,
) {
    let period = Duration::from_secs(interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // consume the immediate first tick
    let mut last = stats.snapshot();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = stats.snapshot();
        let secs = period.as_secs_f64();
        let peer_count = manager.peer_count().await;
        info!(
            video_fps = format!("{:.1}", (now.video_frames - last.video_frames) as f64 / secs),
            audio_fps = format!("{:.1}", (now.audio_frames - last.audio_frames) as f64 / secs),
            video_kbps =
                (now.video_bytes - last.video_bytes) * 8 / 1000 / period.as_secs().max(1),
            audio_kbps =
                (now.audio_bytes - last.audio_bytes) * 8 / 1000 / period.as_secs().max(1),
            video_frames_total = now.video_frames,
            audio_frames_total = now.audio_frames,
            dropped_video = now.dropped_video_frames,
            dropped_audio = now.dropped_audio_frames,
            peer_write_errors = now.peer_write_errors,
            peers = peer_count,
            connected_peers = manager.connected_count(),
            "Throughput summary"
        );
        last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accumulates_counters() {
        let stats = StreamStats::default();
        stats.record_video(1000);
        stats.record_video(500);
        stats.record_audio(120);
        let snap = stats.snapshot();
        assert_eq!(snap.video_frames, 2);
        assert_eq!(snap.video_bytes, 1500);
        assert_eq!(snap.audio_frames, 1);
        assert_eq!(snap.audio_bytes, 120);
        assert_eq!(snap.dropped_video_frames, 0);
    }

    #[test]
    fn uptime_formats_all_ranges() {
        assert_eq!(format_uptime(Duration::from_secs(7)), "7s");
        assert_eq!(format_uptime(Duration::from_secs(65)), "1m5s");
        assert_eq!(format_uptime(Duration::from_secs(3600)), "1h0m0s");
        assert_eq!(format_uptime(Duration::from_secs(5025)), "1h23m45s");
    }
}
