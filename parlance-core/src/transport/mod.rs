//! Transport composition and configuration.
//!
//! A concrete duplex transport (websocket, RTC channel, …) lives outside
//! this crate. It plugs in through two seams:
//!
//! * [`BaseTransport`] exposes the ingress head and egress tail processors
//!   to embed in a pipeline.
//! * [`OutputDevice`] is the wire-level egress the output transport writes
//!   through.

pub mod input;
pub mod output;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::frames::Frame;
use crate::processors::ProcessorNode;
use crate::turn::TurnAnalyzer;
use crate::vad::VadAnalyzer;

/// Shared handle to a voice activity analyzer.
pub type VadAnalyzerHandle = Arc<Mutex<dyn VadAnalyzer>>;

/// Shared handle to a turn analyzer.
pub type TurnAnalyzerHandle = Arc<Mutex<dyn TurnAnalyzer>>;

/// Transport configuration.
///
/// The input flags are honored as configured: `audio_in_enabled` gates the
/// ingress queue and `audio_in_passthrough` gates downstream propagation
/// (with `vad_audio_passthrough` as the VAD-specific allowance).
#[derive(Clone)]
pub struct TransportParams {
    /// Gate for the output audio path; when false the sender drops audio.
    pub audio_out_enabled: bool,
    /// Overrides the `Start` frame's output sample rate when set.
    pub audio_out_sample_rate: Option<u32>,
    pub audio_out_channels: u16,
    /// Output chunk granularity in 10 ms units.
    pub audio_out_10ms_chunks: u32,
    /// Named destinations, each served by its own media sender. Duplicates
    /// are collapsed.
    pub audio_out_destinations: Vec<String>,
    pub audio_in_enabled: bool,
    /// Overrides the `Start` frame's input sample rate when set.
    pub audio_in_sample_rate: Option<u32>,
    pub audio_in_channels: u16,
    pub audio_in_passthrough: bool,
    pub vad_enabled: bool,
    pub vad_audio_passthrough: bool,
    pub vad_analyzer: Option<VadAnalyzerHandle>,
    pub turn_analyzer: Option<TurnAnalyzerHandle>,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            audio_out_enabled: false,
            audio_out_sample_rate: None,
            audio_out_channels: 1,
            audio_out_10ms_chunks: 4,
            audio_out_destinations: Vec::new(),
            audio_in_enabled: false,
            audio_in_sample_rate: None,
            audio_in_channels: 1,
            audio_in_passthrough: true,
            vad_enabled: false,
            vad_audio_passthrough: false,
            vad_analyzer: None,
            turn_analyzer: None,
        }
    }
}

impl std::fmt::Debug for TransportParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportParams")
            .field("audio_out_enabled", &self.audio_out_enabled)
            .field("audio_out_sample_rate", &self.audio_out_sample_rate)
            .field("audio_out_channels", &self.audio_out_channels)
            .field("audio_out_10ms_chunks", &self.audio_out_10ms_chunks)
            .field("audio_out_destinations", &self.audio_out_destinations)
            .field("audio_in_enabled", &self.audio_in_enabled)
            .field("audio_in_sample_rate", &self.audio_in_sample_rate)
            .field("audio_in_channels", &self.audio_in_channels)
            .field("audio_in_passthrough", &self.audio_in_passthrough)
            .field("vad_enabled", &self.vad_enabled)
            .field("vad_audio_passthrough", &self.vad_audio_passthrough)
            .field("vad_analyzer", &self.vad_analyzer.is_some())
            .field("turn_analyzer", &self.turn_analyzer.is_some())
            .finish()
    }
}

/// A duplex transport: an ingress head and an egress tail to embed in a
/// pipeline.
pub trait BaseTransport {
    fn input(&self) -> Arc<ProcessorNode>;
    fn output(&self) -> Arc<ProcessorNode>;
}

/// Wire-level egress used by the output transport.
#[async_trait]
pub trait OutputDevice: Send + Sync {
    /// Announce a named destination before media flows to it.
    async fn register_audio_destination(&self, _destination: &str) -> Result<()> {
        Ok(())
    }

    /// Emit PCM bytes on the wire for `destination` (`None` = default).
    async fn write_raw_audio_frames(&self, audio: &[u8], destination: Option<&str>) -> Result<()>;

    /// Deliver a transport message to the peer.
    async fn send_message(&self, frame: Frame) -> Result<()>;
}
