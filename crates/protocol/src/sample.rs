use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Video track codec carried by the producer and advertised to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Hevc,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::Hevc => "hevc",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" => Ok(VideoCodec::H264),
            "hevc" => Ok(VideoCodec::Hevc),
            other => Err(format!("unknown video codec '{other}'")),
        }
    }
}

/// One encoded video access unit from the producer.
///
/// The payload is Annex-B formatted NAL units. Keyframe payloads carry their
/// own parameter sets (SPS/PPS for H.264, VPS/SPS/PPS for HEVC) ahead of the
/// slice data; the gateway forwards them untouched.
#[derive(Debug, Clone)]
pub struct VideoSample {
    /// Presentation timestamp in nanoseconds.
    pub pts: i64,
    /// Decode timestamp in nanoseconds.
    pub dts: i64,
    pub keyframe: bool,
    pub width: u32,
    pub height: u32,
    pub codec: VideoCodec,
    pub payload: Bytes,
    /// When the gateway finished reading this sample off the socket.
    pub received_at: Instant,
}

/// One frame of interleaved 16-bit signed PCM audio from the producer.
#[derive(Debug, Clone)]
pub struct AudioSample {
    /// Presentation timestamp in nanoseconds.
    pub pts: i64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in this frame.
    pub sample_count: u32,
    pub payload: Bytes,
    pub received_at: Instant,
}

impl AudioSample {
    /// Presentation duration of this frame, derived from the sample count.
    /// Falls back to 20 ms when the producer sent a zero rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::from_millis(20);
        }
        Duration::from_nanos(self.sample_count as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}

/// Stream-level configuration emitted at most once per producer connection,
/// before the first video sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub video_width: u32,
    pub video_height: u32,
    pub video_codec: VideoCodec,
    pub video_fps: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_roundtrips_through_serde() {
        let json = serde_json::to_string(&VideoCodec::H264).unwrap();
        assert_eq!(json, r#""h264""#);
        let parsed: VideoCodec = serde_json::from_str(r#""hevc""#).unwrap();
        assert_eq!(parsed, VideoCodec::Hevc);
    }

    #[test]
    fn codec_from_str_rejects_unknown() {
        assert!("vp9".parse::<VideoCodec>().is_err());
        assert_eq!("h264".parse::<VideoCodec>().unwrap(), VideoCodec::H264);
    }

    #[test]
    fn audio_duration_from_sample_count() {
        let sample = AudioSample {
            pts: 0,
            sample_rate: 48_000,
            channels: 2,
            sample_count: 960,
            payload: Bytes::new(),
            received_at: Instant::now(),
        };
        assert_eq!(sample.duration(), Duration::from_millis(20));
    }

    #[test]
    fn audio_duration_zero_rate_falls_back() {
        let sample = AudioSample {
            pts: 0,
            sample_rate: 0,
            channels: 2,
            sample_count: 960,
            payload: Bytes::new(),
            received_at: Instant::now(),
        };
        assert_eq!(sample.duration(), Duration::from_millis(20));
    }

    #[test]
    fn metadata_uses_snake_case_fields() {
        let meta = StreamMetadata {
            video_width: 1920,
            video_height: 1080,
            video_codec: VideoCodec::H264,
            video_fps: 60,
            audio_sample_rate: 48_000,
            audio_channels: 2,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains(r#""video_width":1920"#));
        assert!(json.contains(r#""video_codec":"h264""#));
        assert!(json.contains(r#""audio_sample_rate":48000"#));
        let parsed: StreamMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, meta);
    }
}
