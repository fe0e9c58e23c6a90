//! End-of-turn analysis contract.
//!
//! A turn analyzer decides whether the user's utterance is complete. While
//! it reports `speech_triggered`, the input transport suppresses
//! user-started/stopped speaking frames so a single turn does not produce
//! duplicate interruption cycles; the raw VAD transition frames still flow.

use crate::frames::AudioFrameData;
use crate::vad::VadState;

/// Whether the analyzer considers the current turn finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOfTurnState {
    Incomplete,
    Complete,
}

/// Oracle deciding whether the user's utterance is complete.
///
/// Implementations are stateful; the input transport calls `append_audio`
/// for every ingress audio frame with the committed VAD state and the state
/// from the previous frame.
pub trait TurnAnalyzer: Send {
    /// True while the analyzer has seen speech for the current turn and has
    /// not yet decided the turn is over.
    fn speech_triggered(&self) -> bool;

    /// Observe one audio frame and the surrounding VAD states.
    fn append_audio(
        &mut self,
        frame: &AudioFrameData,
        vad_state: VadState,
        previous_vad_state: VadState,
    ) -> EndOfTurnState;
}
