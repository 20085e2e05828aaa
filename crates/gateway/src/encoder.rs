//! Seam for the downstream audio encoder.
//!
//! The producer ships raw PCM while the viewer tracks negotiate Opus.
//! Encoding itself lives outside the gateway; this trait is the contract a
//! real encoder implements. The passthrough forwards payload bytes
//! unchanged, for producers that already ship compressed frames.

use bytes::Bytes;
use prism_protocol::AudioSample;

pub trait AudioEncoder: Send {
    /// Encode one audio frame into the track codec's payload.
    fn encode(&mut self, sample: &AudioSample) -> anyhow::Result<Bytes>;
}

/// Forwards the producer payload untouched.
pub struct Passthrough;

impl AudioEncoder for Passthrough {
    fn encode(&mut self, sample: &AudioSample) -> anyhow::Result<Bytes> {
        Ok(sample.payload.clone())
    }
}
