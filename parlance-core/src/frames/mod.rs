//! Frame taxonomy.
//!
//! Everything that travels through the pipeline is a [`Frame`]: a small
//! envelope (unique id, human-readable name, optional presentation
//! timestamp, optional destination) around one closed [`FramePayload`]
//! variant.
//!
//! Three delivery categories exist:
//!
//! | Category | Delivery |
//! |----------|----------|
//! | system   | out-of-band, bypasses per-processor FIFO queues |
//! | control  | ordered within a direction |
//! | data     | ordered within a direction |
//!
//! `TransportMessageUrgent` is data-shaped but delivered as system.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::vad::VadParams;

/// Process-global frame id counter. Ids are unique and monotonic across all
/// frame kinds, which also makes them the FIFO tie-breaker for timed frames
/// with equal timestamps.
static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

fn next_frame_id() -> u64 {
    NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed)
}

/// Raw PCM payload: interleaved signed 16-bit little-endian samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrameData {
    pub audio: Vec<u8>,
    pub sample_rate: u32,
    pub num_channels: u16,
}

impl AudioFrameData {
    pub fn new(audio: Vec<u8>, sample_rate: u32, num_channels: u16) -> Self {
        Self {
            audio,
            sample_rate,
            num_channels,
        }
    }

    /// Number of samples (per all channels together).
    pub fn num_samples(&self) -> usize {
        self.audio.len() / 2
    }
}

/// A recognized utterance attributed to a speaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionData {
    pub text: String,
    pub user_id: String,
    pub timestamp: String,
}

/// Pipeline start parameters. Carried by the first frame every processor
/// observes; distributes the shared clock and the negotiated sample rates.
#[derive(Clone)]
pub struct StartData {
    pub audio_in_sample_rate: u32,
    pub audio_out_sample_rate: u32,
    pub allow_interruptions: bool,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for StartData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartData")
            .field("audio_in_sample_rate", &self.audio_in_sample_rate)
            .field("audio_out_sample_rate", &self.audio_out_sample_rate)
            .field("allow_interruptions", &self.allow_interruptions)
            .finish_non_exhaustive()
    }
}

/// The closed set of frame variants.
#[derive(Debug, Clone)]
pub enum FramePayload {
    // System frames: immediate, out-of-band.
    Start(StartData),
    End,
    Cancel,
    StartInterruption,
    StopInterruption,
    BotInterruption,
    EmulateUserStartedSpeaking,
    EmulateUserStoppedSpeaking,
    VadParamsUpdate(VadParams),
    TransportMessageUrgent(serde_json::Value),

    // Control frames: ordered within a direction.
    VadUserStartedSpeaking,
    VadUserStoppedSpeaking,
    UserStartedSpeaking { emulated: bool },
    UserStoppedSpeaking { emulated: bool },
    BotStartedSpeaking,
    BotStoppedSpeaking,
    BotSpeaking,

    // Data frames: ordered within a direction.
    InputAudioRaw(AudioFrameData),
    OutputAudioRaw(AudioFrameData),
    TtsAudioRaw(AudioFrameData),
    Text(String),
    Transcription(TranscriptionData),
    TransportMessage(serde_json::Value),
}

impl FramePayload {
    /// Stable variant name used for frame naming and logging.
    pub fn variant_name(&self) -> &'static str {
        match self {
            FramePayload::Start(_) => "Start",
            FramePayload::End => "End",
            FramePayload::Cancel => "Cancel",
            FramePayload::StartInterruption => "StartInterruption",
            FramePayload::StopInterruption => "StopInterruption",
            FramePayload::BotInterruption => "BotInterruption",
            FramePayload::EmulateUserStartedSpeaking => "EmulateUserStartedSpeaking",
            FramePayload::EmulateUserStoppedSpeaking => "EmulateUserStoppedSpeaking",
            FramePayload::VadParamsUpdate(_) => "VadParamsUpdate",
            FramePayload::TransportMessageUrgent(_) => "TransportMessageUrgent",
            FramePayload::VadUserStartedSpeaking => "VadUserStartedSpeaking",
            FramePayload::VadUserStoppedSpeaking => "VadUserStoppedSpeaking",
            FramePayload::UserStartedSpeaking { .. } => "UserStartedSpeaking",
            FramePayload::UserStoppedSpeaking { .. } => "UserStoppedSpeaking",
            FramePayload::BotStartedSpeaking => "BotStartedSpeaking",
            FramePayload::BotStoppedSpeaking => "BotStoppedSpeaking",
            FramePayload::BotSpeaking => "BotSpeaking",
            FramePayload::InputAudioRaw(_) => "InputAudioRaw",
            FramePayload::OutputAudioRaw(_) => "OutputAudioRaw",
            FramePayload::TtsAudioRaw(_) => "TtsAudioRaw",
            FramePayload::Text(_) => "Text",
            FramePayload::Transcription(_) => "Transcription",
            FramePayload::TransportMessage(_) => "TransportMessage",
        }
    }
}

/// A typed message flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Unique monotonic identifier, assigned at construction.
    pub id: u64,
    /// Human-readable tag, `VariantName#id`.
    pub name: String,
    /// Optional presentation timestamp, nanoseconds in the clock's domain.
    /// `None` means "no timing constraint, deliver in FIFO order".
    pub pts: Option<u64>,
    /// Optional named output sink. `None` selects the default destination.
    pub transport_destination: Option<String>,
    pub payload: FramePayload,
}

impl Frame {
    pub fn new(payload: FramePayload) -> Self {
        let id = next_frame_id();
        let name = format!("{}#{id}", payload.variant_name());
        Self {
            id,
            name,
            pts: None,
            transport_destination: None,
            payload,
        }
    }

    pub fn with_pts(mut self, pts: u64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.transport_destination = Some(destination.into());
        self
    }

    /// System frames bypass the ordered FIFO queues and are delivered by
    /// direct invocation on the receiving processor.
    pub fn is_system(&self) -> bool {
        matches!(
            self.payload,
            FramePayload::Start(_)
                | FramePayload::End
                | FramePayload::Cancel
                | FramePayload::StartInterruption
                | FramePayload::StopInterruption
                | FramePayload::BotInterruption
                | FramePayload::EmulateUserStartedSpeaking
                | FramePayload::EmulateUserStoppedSpeaking
                | FramePayload::VadParamsUpdate(_)
                | FramePayload::TransportMessageUrgent(_)
        )
    }

    /// Output-bound audio, including the synthesized-speech kind.
    pub fn is_output_audio(&self) -> bool {
        matches!(
            self.payload,
            FramePayload::OutputAudioRaw(_) | FramePayload::TtsAudioRaw(_)
        )
    }

    /// Payload bytes for output-bound audio variants.
    pub fn output_audio(&self) -> Option<&AudioFrameData> {
        match &self.payload {
            FramePayload::OutputAudioRaw(a) | FramePayload::TtsAudioRaw(a) => Some(a),
            _ => None,
        }
    }

    /// Rebuild an output audio frame of the same concrete variant with new
    /// payload data. Used by the chunker so synthesized-speech audio stays
    /// recognizable downstream.
    pub fn same_audio_variant(&self, data: AudioFrameData) -> Option<Frame> {
        match self.payload {
            FramePayload::OutputAudioRaw(_) => {
                Some(Frame::new(FramePayload::OutputAudioRaw(data)))
            }
            FramePayload::TtsAudioRaw(_) => Some(Frame::new(FramePayload::TtsAudioRaw(data))),
            _ => None,
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
