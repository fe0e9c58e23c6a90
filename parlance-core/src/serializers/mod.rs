//! Wire serialization of frames.
//!
//! The duplex channel carries a tagged union with `text`, `audio`,
//! `transcription` and `message` variants. Serialization is lossy by
//! design: only client-facing variants cross the wire, everything else
//! returns `None` and is logged. Envelope fields (`id`, `name`, `pts`)
//! survive a round trip when present.
//!
//! Audio payloads are base64-encoded inside JSON; a binary payload is
//! accepted on the way in as UTF-8 JSON.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::frames::{AudioFrameData, Frame, FramePayload, TranscriptionData};

/// A frame encoded for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializedFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Converts frames to and from their wire shape.
///
/// Unserializable frames and unrecognized payloads map to `None`; the
/// pipeline drops them and keeps running.
pub trait FrameSerializer: Send + Sync {
    fn serialize(&self, frame: &Frame) -> Option<SerializedFrame>;
    fn deserialize(&self, data: &SerializedFrame) -> Option<Frame>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pts: Option<u64>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireFrame {
    #[serde(rename_all = "camelCase")]
    Text {
        text: String,
        #[serde(flatten)]
        envelope: WireEnvelope,
    },
    #[serde(rename_all = "camelCase")]
    Audio {
        audio: String,
        sample_rate: u32,
        num_channels: u16,
        #[serde(flatten)]
        envelope: WireEnvelope,
    },
    #[serde(rename_all = "camelCase")]
    Transcription {
        text: String,
        user_id: String,
        timestamp: String,
        #[serde(flatten)]
        envelope: WireEnvelope,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        data: serde_json::Value,
        #[serde(flatten)]
        envelope: WireEnvelope,
    },
}

/// JSON implementation of the wire contract.
#[derive(Debug, Default)]
pub struct JsonFrameSerializer;

impl JsonFrameSerializer {
    fn envelope(frame: &Frame) -> WireEnvelope {
        WireEnvelope {
            id: Some(frame.id),
            name: Some(frame.name.clone()),
            pts: frame.pts,
        }
    }

    fn apply_envelope(frame: &mut Frame, envelope: WireEnvelope) {
        if let Some(id) = envelope.id {
            frame.id = id;
        }
        if let Some(name) = envelope.name {
            frame.name = name;
        }
        if let Some(pts) = envelope.pts {
            frame.pts = Some(pts);
        }
    }
}

impl FrameSerializer for JsonFrameSerializer {
    fn serialize(&self, frame: &Frame) -> Option<SerializedFrame> {
        let envelope = Self::envelope(frame);
        let wire = match &frame.payload {
            FramePayload::Text(text) => WireFrame::Text {
                text: text.clone(),
                envelope,
            },
            FramePayload::OutputAudioRaw(a) | FramePayload::TtsAudioRaw(a) => WireFrame::Audio {
                audio: BASE64.encode(&a.audio),
                sample_rate: a.sample_rate,
                num_channels: a.num_channels,
                envelope,
            },
            FramePayload::Transcription(t) => WireFrame::Transcription {
                text: t.text.clone(),
                user_id: t.user_id.clone(),
                timestamp: t.timestamp.clone(),
                envelope,
            },
            FramePayload::TransportMessage(data)
            | FramePayload::TransportMessageUrgent(data) => WireFrame::Message {
                data: data.clone(),
                envelope,
            },
            _ => {
                warn!(frame = %frame, "frame is not serializable");
                return None;
            }
        };

        match serde_json::to_string(&wire) {
            Ok(json) => Some(SerializedFrame::Text(json)),
            Err(e) => {
                warn!(frame = %frame, error = %e, "failed to serialize frame");
                None
            }
        }
    }

    fn deserialize(&self, data: &SerializedFrame) -> Option<Frame> {
        let json = match data {
            SerializedFrame::Text(s) => s.as_str(),
            SerializedFrame::Binary(b) => match std::str::from_utf8(b) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "wire payload is not valid UTF-8");
                    return None;
                }
            },
        };

        let wire: WireFrame = match serde_json::from_str(json) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(error = %e, "unable to deserialize a valid frame");
                return None;
            }
        };

        let (payload, envelope) = match wire {
            WireFrame::Text { text, envelope } => (FramePayload::Text(text), envelope),
            WireFrame::Audio {
                audio,
                sample_rate,
                num_channels,
                envelope,
            } => {
                let audio = match BASE64.decode(audio.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "invalid base64 audio payload");
                        return None;
                    }
                };
                (
                    // Inbound audio always enters the pipeline as input audio.
                    FramePayload::InputAudioRaw(AudioFrameData::new(
                        audio,
                        sample_rate,
                        num_channels,
                    )),
                    envelope,
                )
            }
            WireFrame::Transcription {
                text,
                user_id,
                timestamp,
                envelope,
            } => (
                FramePayload::Transcription(TranscriptionData {
                    text,
                    user_id,
                    timestamp,
                }),
                envelope,
            ),
            WireFrame::Message { data, envelope } => {
                (FramePayload::TransportMessage(data), envelope)
            }
        };

        let mut frame = Frame::new(payload);
        Self::apply_envelope(&mut frame, envelope);
        Some(frame)
    }
}
