//! # parlance-core
//!
//! Real-time, bidirectional media conversation pipeline runtime.
//!
//! ## Architecture
//!
//! ```text
//! client bytes ─► InputTransport ─► (user processors) ─► OutputTransport ─► client bytes
//!                     │ VAD / turn analysis                  │ per-destination MediaSender
//!                     │ user-speaking + interruptions        │ resample ─ chunk ─ pace ─ write
//!                     └──────────────── frames flow both ways ┘
//! ```
//!
//! Frames are typed messages with a strict delivery contract: data and
//! control frames travel in FIFO order per direction, system frames
//! (start/end/cancel, interruptions) are delivered immediately out-of-band.
//! Processors are nodes linked into a linear [`pipeline::Pipeline`], driven
//! by a [`pipeline::task::PipelineTask`].
//!
//! Speech-to-text, dialog and synthesis services are external collaborators:
//! they plug in as ordinary processors between the two transports.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod clock;
pub mod error;
pub mod frames;
pub mod pipeline;
pub mod processors;
pub mod serializers;
pub mod transport;
pub mod turn;
pub mod vad;

// Convenience re-exports for downstream crates
pub use clock::{Clock, SystemClock};
pub use error::ParlanceError;
pub use frames::{AudioFrameData, Frame, FramePayload, StartData, TranscriptionData};
pub use pipeline::task::{PipelineParams, PipelineRunner, PipelineTask};
pub use pipeline::Pipeline;
pub use processors::{FrameDirection, FrameHandler, Passthrough, ProcessorNode, TaskHandle};
pub use serializers::{FrameSerializer, JsonFrameSerializer, SerializedFrame};
pub use transport::input::InputTransport;
pub use transport::output::OutputTransport;
pub use transport::{BaseTransport, OutputDevice, TransportParams};
pub use turn::{EndOfTurnState, TurnAnalyzer};
pub use vad::{EnergyVadAnalyzer, VadAnalyzer, VadParams, VadState};
