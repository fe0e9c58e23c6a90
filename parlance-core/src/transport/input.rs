//! Ingress transport: client audio in, speaking events and interruptions out.
//!
//! Audio enters through [`InputTransport::push_audio_frame`] and is consumed
//! by a dedicated worker so the pipeline context never blocks on analysis.
//! Per frame the worker:
//!
//! 1. runs the VAD analyzer on a blocking thread and reduces its state into
//!    committed quiet/speaking transitions,
//! 2. feeds the turn analyzer hook with the committed and previous states,
//! 3. forwards the audio downstream when passthrough is configured.
//!
//! Committed transitions emit `VadUser{Started,Stopped}Speaking`; unless the
//! turn analyzer holds the turn (`speech_triggered`), they also emit the
//! `User{Started,Stopped}Speaking` pair, which is where interruptions are
//! generated.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ParlanceError, Result};
use crate::frames::{AudioFrameData, Frame, FramePayload, StartData};
use crate::processors::{FrameDirection, FrameHandler, ProcessorNode, TaskHandle};
use crate::transport::TransportParams;
use crate::vad::VadState;

struct InputState {
    params: TransportParams,
    sample_rate: AtomicU32,
    audio_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    audio_task: Mutex<Option<TaskHandle>>,
}

impl InputState {
    fn vad_active(&self) -> bool {
        self.params.vad_enabled && self.params.vad_analyzer.is_some()
    }

    fn passthrough_enabled(&self) -> bool {
        self.params.audio_in_passthrough
            || (self.params.vad_enabled && self.params.vad_audio_passthrough)
    }
}

/// Ingress head of a transport.
pub struct InputTransport {
    node: Arc<ProcessorNode>,
    state: Arc<InputState>,
}

impl InputTransport {
    pub fn new(params: TransportParams) -> Self {
        let state = Arc::new(InputState {
            params,
            sample_rate: AtomicU32::new(0),
            audio_tx: Mutex::new(None),
            audio_task: Mutex::new(None),
        });
        let node = ProcessorNode::new(
            "InputTransport",
            Box::new(InputTransportHandler {
                state: Arc::clone(&state),
            }),
        );
        Self { node, state }
    }

    /// The processor to embed at the head of a pipeline.
    pub fn node(&self) -> Arc<ProcessorNode> {
        Arc::clone(&self.node)
    }

    /// Negotiated input sample rate, available after `Start`.
    pub fn sample_rate(&self) -> u32 {
        self.state.sample_rate.load(Ordering::SeqCst)
    }

    /// Hand one client audio frame to the ingress queue.
    pub fn push_audio_frame(&self, frame: Frame) -> Result<()> {
        if !matches!(frame.payload, FramePayload::InputAudioRaw(_)) {
            return Err(ParlanceError::MalformedFrame(format!(
                "expected input audio, got {frame}"
            )));
        }
        let tx = self.state.audio_tx.lock().clone();
        match tx {
            Some(tx) => tx.send(frame).map_err(|_| ParlanceError::NotRunning),
            None => Err(ParlanceError::NotRunning),
        }
    }
}

struct InputTransportHandler {
    state: Arc<InputState>,
}

impl InputTransportHandler {
    async fn start(&self, node: &Arc<ProcessorNode>, start: &StartData) -> Result<()> {
        let sample_rate = self
            .state
            .params
            .audio_in_sample_rate
            .unwrap_or(start.audio_in_sample_rate);
        if sample_rate == 0 {
            return Err(ParlanceError::InvalidStart(
                "input sample rate is missing".into(),
            ));
        }
        self.state.sample_rate.store(sample_rate, Ordering::SeqCst);

        if self.state.vad_active() {
            if let Some(analyzer) = &self.state.params.vad_analyzer {
                analyzer.lock().set_sample_rate(sample_rate);
            }
        }

        if self.state.params.audio_in_enabled {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.state.audio_tx.lock() = Some(tx);
            let task = node.create_task(
                "audio-in",
                audio_worker(Arc::downgrade(node), Arc::clone(&self.state), rx),
            );
            *self.state.audio_task.lock() = Some(task);
        }
        Ok(())
    }

    async fn shutdown(&self, node: &Arc<ProcessorNode>) {
        self.state.audio_tx.lock().take();
        let task = self.state.audio_task.lock().take();
        if let Some(task) = task {
            node.cancel_task(task).await;
        }
    }
}

#[async_trait]
impl FrameHandler for InputTransportHandler {
    async fn handle_frame(
        &self,
        node: &Arc<ProcessorNode>,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        match &frame.payload {
            FramePayload::Start(start) => {
                let start = start.clone();
                node.push_frame(frame, direction).await;
                if let Err(e) = self.start(node, &start).await {
                    warn!(error = %e, "failed to start input transport");
                    node.push_frame(Frame::new(FramePayload::Cancel), FrameDirection::Downstream)
                        .await;
                }
            }
            FramePayload::Cancel => {
                self.shutdown(node).await;
                node.push_frame(frame, direction).await;
            }
            FramePayload::BotInterruption => {
                debug!("bot interruption");
                if node.interruptions_allowed() {
                    node.start_interruption().await;
                    node.push_frame(
                        Frame::new(FramePayload::StartInterruption),
                        FrameDirection::Downstream,
                    )
                    .await;
                }
            }
            FramePayload::EmulateUserStartedSpeaking => {
                debug!("emulate user started speaking");
                handle_user_interruption(
                    node,
                    Frame::new(FramePayload::UserStartedSpeaking { emulated: true }),
                )
                .await;
            }
            FramePayload::EmulateUserStoppedSpeaking => {
                debug!("emulate user stopped speaking");
                handle_user_interruption(
                    node,
                    Frame::new(FramePayload::UserStoppedSpeaking { emulated: true }),
                )
                .await;
            }
            FramePayload::VadParamsUpdate(params) => {
                if let Some(analyzer) = &self.state.params.vad_analyzer {
                    analyzer.lock().set_params(*params);
                }
            }
            FramePayload::End => {
                node.push_frame(frame, direction).await;
                self.shutdown(node).await;
            }
            _ => node.push_frame(frame, direction).await,
        }
        Ok(())
    }

    async fn cleanup(&self, node: &Arc<ProcessorNode>) {
        self.shutdown(node).await;
    }
}

/// Consume the ingress queue: VAD, turn hook, passthrough.
async fn audio_worker(
    node: Weak<ProcessorNode>,
    state: Arc<InputState>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    let mut vad_state = VadState::Quiet;
    while let Some(frame) = rx.recv().await {
        let Some(node) = node.upgrade() else { break };
        let FramePayload::InputAudioRaw(ref audio) = frame.payload else {
            continue;
        };

        let previous_vad_state = vad_state;
        if state.vad_active() {
            vad_state = handle_vad(&node, &state, audio, vad_state).await;
        }

        if let Some(turn) = &state.params.turn_analyzer {
            turn.lock().append_audio(audio, vad_state, previous_vad_state);
        }

        if state.passthrough_enabled() {
            node.push_frame(frame, FrameDirection::Downstream).await;
        }
    }
}

/// Run the analyzer off the pipeline context; failures count as quiet for
/// this cycle.
async fn analyze_audio(state: &InputState, audio: &AudioFrameData) -> VadState {
    let Some(analyzer) = &state.params.vad_analyzer else {
        return VadState::Quiet;
    };
    let analyzer = Arc::clone(analyzer);
    let bytes = audio.audio.clone();
    match tokio::task::spawn_blocking(move || analyzer.lock().analyze_audio(&bytes)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!(error = %e, "vad analyzer failed, treating as quiet");
            VadState::Quiet
        }
        Err(e) => {
            warn!(error = %e, "vad analyzer task failed, treating as quiet");
            VadState::Quiet
        }
    }
}

/// Reduce the analyzer state into committed transitions, returning the new
/// committed state. Only `Quiet` and `Speaking` commit; the transitional
/// states leave the committed value untouched.
async fn handle_vad(
    node: &Arc<ProcessorNode>,
    state: &Arc<InputState>,
    audio: &AudioFrameData,
    vad_state: VadState,
) -> VadState {
    let new_vad_state = analyze_audio(state, audio).await;
    if new_vad_state == vad_state
        || new_vad_state == VadState::Starting
        || new_vad_state == VadState::Stopping
    {
        return vad_state;
    }

    // While the turn analyzer holds the turn, the user frames (and with
    // them, interruptions) are suppressed; the raw VAD events still flow.
    let can_create_user_frames = match &state.params.turn_analyzer {
        Some(turn) => !turn.lock().speech_triggered(),
        None => true,
    };

    let mut user_frame = None;
    match new_vad_state {
        VadState::Speaking => {
            debug!("VAD: user started speaking");
            node.push_frame(
                Frame::new(FramePayload::VadUserStartedSpeaking),
                FrameDirection::Downstream,
            )
            .await;
            if can_create_user_frames {
                user_frame = Some(Frame::new(FramePayload::UserStartedSpeaking {
                    emulated: false,
                }));
            }
        }
        VadState::Quiet => {
            debug!("VAD: user stopped speaking");
            node.push_frame(
                Frame::new(FramePayload::VadUserStoppedSpeaking),
                FrameDirection::Downstream,
            )
            .await;
            if can_create_user_frames {
                user_frame = Some(Frame::new(FramePayload::UserStoppedSpeaking {
                    emulated: false,
                }));
            }
        }
        VadState::Starting | VadState::Stopping => {}
    }

    if let Some(frame) = user_frame {
        handle_user_interruption(node, frame).await;
    }

    new_vad_state
}

/// Push a user speaking transition downstream and, when allowed, the
/// matching interruption frame out-of-band.
async fn handle_user_interruption(node: &Arc<ProcessorNode>, frame: Frame) {
    match frame.payload {
        FramePayload::UserStartedSpeaking { .. } => {
            debug!("user started speaking");
            node.push_frame(frame, FrameDirection::Downstream).await;
            if node.interruptions_allowed() {
                node.start_interruption().await;
                node.push_frame(
                    Frame::new(FramePayload::StartInterruption),
                    FrameDirection::Downstream,
                )
                .await;
            }
        }
        FramePayload::UserStoppedSpeaking { .. } => {
            debug!("user stopped speaking");
            node.push_frame(frame, FrameDirection::Downstream).await;
            if node.interruptions_allowed() {
                node.push_frame(
                    Frame::new(FramePayload::StopInterruption),
                    FrameDirection::Downstream,
                )
                .await;
            }
        }
        _ => {}
    }
}
