//! Egress transport: paced, per-destination media writing.
//!
//! The output transport is a router keyed by `transport_destination`. Each
//! destination is served by its own [`MediaSender`], a self-contained actor
//! with two mailboxes and two workers:
//!
//! ```text
//!                    ┌───────────── MediaSender ─────────────┐
//! audio frames ────► │ resample ─► chunk ─► audio queue ─► audio worker │─► wire
//! timed frames ────► │            (pts, id) clock queue ─► clock worker │─► downstream
//! ```
//!
//! The audio worker paces chunks onto the wire, synthesizes the
//! bot-speaking lifecycle (started on synthesized speech, stopped after
//! 350 ms of queue silence) and emits a periodic `BotSpeaking` heartbeat.
//! The clock worker releases timed frames in `(pts, id)` order against the
//! shared pipeline clock. An interruption cancels and respawns both workers,
//! dropping everything in flight.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::audio::{create_default_resampler, AudioResampler};
use crate::clock::Clock;
use crate::error::{ParlanceError, Result};
use crate::frames::{AudioFrameData, Frame, FramePayload, StartData};
use crate::processors::{FrameDirection, FrameHandler, ProcessorNode, TaskHandle};
use crate::transport::{OutputDevice, TransportParams};

/// Queue silence after which the bot is considered done speaking.
const BOT_VAD_STOP: Duration = Duration::from_millis(350);

/// Target interval for the `BotSpeaking` heartbeat.
const BOT_SPEAKING_INTERVAL_MS: u32 = 200;

/// Egress tail of a transport.
pub struct OutputTransport {
    node: Arc<ProcessorNode>,
    state: Arc<OutputState>,
}

impl OutputTransport {
    pub fn new(params: TransportParams, device: Arc<dyn OutputDevice>) -> Self {
        let state = Arc::new(OutputState {
            params,
            device,
            sample_rate: AtomicU32::new(0),
            audio_chunk_size: AtomicUsize::new(0),
            senders: Mutex::new(HashMap::new()),
        });
        let node = ProcessorNode::new(
            "OutputTransport",
            Box::new(OutputTransportHandler {
                state: Arc::clone(&state),
            }),
        );
        Self { node, state }
    }

    /// The processor to embed at the tail of a pipeline.
    pub fn node(&self) -> Arc<ProcessorNode> {
        Arc::clone(&self.node)
    }

    /// Negotiated output sample rate, available after `Start`.
    pub fn sample_rate(&self) -> u32 {
        self.state.sample_rate.load(Ordering::SeqCst)
    }

    /// Bytes per paced chunk, available after `Start`.
    pub fn audio_chunk_size(&self) -> usize {
        self.state.audio_chunk_size.load(Ordering::SeqCst)
    }

    /// Queue an audio frame for ordered downstream delivery through this
    /// transport.
    pub async fn send_audio(&self, frame: Frame) -> Result<()> {
        self.node.queue_frame(frame, FrameDirection::Downstream).await
    }
}

struct OutputState {
    params: TransportParams,
    device: Arc<dyn OutputDevice>,
    sample_rate: AtomicU32,
    audio_chunk_size: AtomicUsize,
    senders: Mutex<HashMap<Option<String>, Arc<MediaSender>>>,
}

impl OutputState {
    async fn start(&self, node: &Arc<ProcessorNode>, start: &StartData) -> Result<()> {
        let sample_rate = self
            .params
            .audio_out_sample_rate
            .unwrap_or(start.audio_out_sample_rate);
        if sample_rate == 0 {
            return Err(ParlanceError::InvalidStart(
                "output sample rate is missing".into(),
            ));
        }
        self.sample_rate.store(sample_rate, Ordering::SeqCst);

        // One chunk is `audio_out_10ms_chunks` x 10 ms of PCM16.
        let bytes_10ms = (sample_rate as usize / 100) * self.params.audio_out_channels as usize * 2;
        let chunk_size = bytes_10ms * self.params.audio_out_10ms_chunks as usize;
        self.audio_chunk_size.store(chunk_size, Ordering::SeqCst);

        for destination in &self.params.audio_out_destinations {
            if let Err(e) = self.device.register_audio_destination(destination).await {
                warn!(%destination, error = %e, "failed to register audio destination");
            }
        }

        let default = MediaSender::new(
            None,
            sample_rate,
            chunk_size,
            self.params.clone(),
            Arc::clone(&self.device),
            Arc::clone(&start.clock),
        );
        default.start(node);
        self.senders.lock().insert(None, default);

        // One sender per unique declared destination.
        let mut seen = HashSet::new();
        for destination in &self.params.audio_out_destinations {
            if !seen.insert(destination.clone()) {
                continue;
            }
            let sender = MediaSender::new(
                Some(destination.clone()),
                sample_rate,
                chunk_size,
                self.params.clone(),
                Arc::clone(&self.device),
                Arc::clone(&start.clock),
            );
            sender.start(node);
            self.senders
                .lock()
                .insert(Some(destination.clone()), sender);
        }
        debug!(sample_rate, chunk_size, "output transport started");
        Ok(())
    }

    fn all_senders(&self) -> Vec<Arc<MediaSender>> {
        self.senders.lock().values().cloned().collect()
    }

    async fn stop(&self, node: &Arc<ProcessorNode>, frame: &Frame) {
        for sender in self.all_senders() {
            sender.stop(node, frame).await;
        }
    }

    async fn cancel(&self, node: &Arc<ProcessorNode>) {
        for sender in self.all_senders() {
            sender.cancel(node).await;
        }
    }

    /// Route a frame to the sender owning its destination.
    async fn route(&self, node: &Arc<ProcessorNode>, frame: Frame) {
        let sender = self.senders.lock().get(&frame.transport_destination).cloned();
        let Some(sender) = sender else {
            warn!(
                destination = ?frame.transport_destination,
                frame = %frame,
                "destination not registered for frame"
            );
            return;
        };

        match &frame.payload {
            FramePayload::StartInterruption => sender.handle_interruptions(node).await,
            FramePayload::OutputAudioRaw(_) | FramePayload::TtsAudioRaw(_) => {
                sender.handle_audio_frame(frame)
            }
            _ if frame.pts.is_some() => sender.handle_timed_frame(frame),
            _ => sender.handle_sync_frame(frame),
        }
    }
}

struct OutputTransportHandler {
    state: Arc<OutputState>,
}

#[async_trait]
impl FrameHandler for OutputTransportHandler {
    async fn handle_frame(
        &self,
        node: &Arc<ProcessorNode>,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        match &frame.payload {
            // Push Start first so every processor sees it before any other
            // frame, then bring the senders up. A bad Start is fatal for the
            // stream.
            FramePayload::Start(start) => {
                let start = start.clone();
                node.push_frame(frame, direction).await;
                if let Err(e) = self.state.start(node, &start).await {
                    error!(error = %e, "failed to start output transport");
                    node.push_frame(Frame::new(FramePayload::Cancel), FrameDirection::Downstream)
                        .await;
                }
            }
            FramePayload::Cancel => {
                self.state.cancel(node).await;
                node.push_frame(frame, direction).await;
            }
            FramePayload::StartInterruption | FramePayload::StopInterruption => {
                node.push_frame(frame.clone(), direction).await;
                self.state.route(node, frame).await;
            }
            FramePayload::TransportMessageUrgent(_) => {
                if let Err(e) = self.state.device.send_message(frame).await {
                    warn!(error = %e, "failed to send urgent transport message");
                }
            }
            // Keep pushing End downstream so the rest of the pipeline stops
            // nicely once the senders have drained.
            FramePayload::End => {
                self.state.stop(node, &frame).await;
                node.push_frame(frame, direction).await;
            }
            FramePayload::OutputAudioRaw(_) | FramePayload::TtsAudioRaw(_) => {
                self.state.route(node, frame).await;
            }
            _ if frame.is_system() => node.push_frame(frame, direction).await,
            _ if frame.pts.is_some() => self.state.route(node, frame).await,
            _ if direction == FrameDirection::Upstream => {
                node.push_frame(frame, direction).await;
            }
            _ => self.state.route(node, frame).await,
        }
        Ok(())
    }
}

/// Entry in the timed-frame queue, ordered by `(pts, id)` so equal
/// timestamps release in construction order.
struct TimedEntry {
    pts: u64,
    id: u64,
    frame: Frame,
}

impl PartialEq for TimedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.pts == other.pts && self.id == other.id
    }
}

impl Eq for TimedEntry {}

impl PartialOrd for TimedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.pts, self.id).cmp(&(other.pts, other.id))
    }
}

struct SenderInner {
    /// Partial-chunk bytes awaiting the next audio frame.
    audio_buffer: Vec<u8>,
    bot_speaking: bool,
    audio_tx: Option<mpsc::UnboundedSender<Frame>>,
    clock_tx: Option<mpsc::UnboundedSender<TimedEntry>>,
    audio_task: Option<TaskHandle>,
    clock_task: Option<TaskHandle>,
}

/// Per-destination paced writer.
struct MediaSender {
    destination: Option<String>,
    sample_rate: u32,
    audio_chunk_size: usize,
    params: TransportParams,
    device: Arc<dyn OutputDevice>,
    clock: Arc<dyn Clock>,
    resampler: Box<dyn AudioResampler>,
    inner: Mutex<SenderInner>,
}

impl MediaSender {
    fn new(
        destination: Option<String>,
        sample_rate: u32,
        audio_chunk_size: usize,
        params: TransportParams,
        device: Arc<dyn OutputDevice>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            destination,
            sample_rate,
            audio_chunk_size,
            params,
            device,
            clock,
            resampler: create_default_resampler(),
            inner: Mutex::new(SenderInner {
                audio_buffer: Vec::new(),
                bot_speaking: false,
                audio_tx: None,
                clock_tx: None,
                audio_task: None,
                clock_task: None,
            }),
        })
    }

    fn start(self: &Arc<Self>, node: &Arc<ProcessorNode>) {
        self.inner.lock().audio_buffer.clear();
        self.create_clock_task(node);
        self.create_audio_task(node);
    }

    /// Drain both workers: the `End` sentinels let them finish everything
    /// already queued, then we join on normal completion.
    async fn stop(&self, node: &Arc<ProcessorNode>, frame: &Frame) {
        let (audio_task, clock_task) = {
            let mut inner = self.inner.lock();
            if let Some(tx) = &inner.clock_tx {
                let _ = tx.send(TimedEntry {
                    pts: u64::MAX,
                    id: frame.id,
                    frame: frame.clone(),
                });
            }
            if let Some(tx) = &inner.audio_tx {
                let _ = tx.send(frame.clone());
            }
            (inner.audio_task.take(), inner.clock_task.take())
        };
        if let Some(task) = audio_task {
            node.wait_for_task(task).await;
        }
        if let Some(task) = clock_task {
            node.wait_for_task(task).await;
        }
    }

    /// Abort both workers without draining.
    async fn cancel(&self, node: &Arc<ProcessorNode>) {
        let (audio_task, clock_task) = {
            let mut inner = self.inner.lock();
            inner.audio_tx.take();
            inner.clock_tx.take();
            (inner.audio_task.take(), inner.clock_task.take())
        };
        if let Some(task) = audio_task {
            node.cancel_task(task).await;
        }
        if let Some(task) = clock_task {
            node.cancel_task(task).await;
        }
    }

    /// Cancel and respawn both workers with fresh queues, silencing the bot
    /// and discarding any partial chunk.
    async fn handle_interruptions(self: &Arc<Self>, node: &Arc<ProcessorNode>) {
        if !node.interruptions_allowed() {
            return;
        }

        let (audio_task, clock_task) = {
            let mut inner = self.inner.lock();
            inner.audio_tx.take();
            inner.clock_tx.take();
            (inner.audio_task.take(), inner.clock_task.take())
        };
        if let Some(task) = audio_task {
            node.cancel_task(task).await;
        }
        if let Some(task) = clock_task {
            node.cancel_task(task).await;
        }

        self.create_clock_task(node);
        self.create_audio_task(node);

        self.bot_stopped_speaking(node).await;
        self.inner.lock().audio_buffer.clear();
    }

    /// Resample, buffer, and enqueue full chunks of the same concrete
    /// variant as the incoming frame.
    fn handle_audio_frame(&self, frame: Frame) {
        if !self.params.audio_out_enabled {
            return;
        }
        let Some(data) = frame.output_audio() else {
            return;
        };

        let resampled =
            match self
                .resampler
                .resample(&data.audio, data.sample_rate, self.sample_rate)
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(frame = %frame, error = %e, "failed to resample output audio");
                    return;
                }
            };

        let mut inner = self.inner.lock();
        inner.audio_buffer.extend_from_slice(&resampled);
        while inner.audio_buffer.len() >= self.audio_chunk_size {
            let chunk: Vec<u8> = inner.audio_buffer.drain(..self.audio_chunk_size).collect();
            let chunk_data = AudioFrameData::new(chunk, self.sample_rate, data.num_channels);
            if let Some(chunk_frame) = frame.same_audio_variant(chunk_data) {
                if let Some(tx) = &inner.audio_tx {
                    let _ = tx.send(chunk_frame);
                }
            }
        }
    }

    fn handle_timed_frame(&self, frame: Frame) {
        let Some(pts) = frame.pts else {
            warn!(frame = %frame, "timed frame without pts");
            return;
        };
        let inner = self.inner.lock();
        if let Some(tx) = &inner.clock_tx {
            let _ = tx.send(TimedEntry {
                pts,
                id: frame.id,
                frame,
            });
        }
    }

    fn handle_sync_frame(&self, frame: Frame) {
        let inner = self.inner.lock();
        if let Some(tx) = &inner.audio_tx {
            let _ = tx.send(frame);
        }
    }

    fn create_audio_task(self: &Arc<Self>, node: &Arc<ProcessorNode>) {
        let mut inner = self.inner.lock();
        if inner.audio_task.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.audio_tx = Some(tx);
        let task = node.create_task(
            "audio-sender",
            audio_worker(Arc::clone(self), Arc::downgrade(node), rx),
        );
        inner.audio_task = Some(task);
    }

    fn create_clock_task(self: &Arc<Self>, node: &Arc<ProcessorNode>) {
        let mut inner = self.inner.lock();
        if inner.clock_task.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.clock_tx = Some(tx);
        let task = node.create_task(
            "clock-sender",
            clock_worker(Arc::clone(self), Arc::downgrade(node), rx),
        );
        inner.clock_task = Some(task);
    }

    async fn bot_started_speaking(&self, node: &Arc<ProcessorNode>) {
        {
            let mut inner = self.inner.lock();
            if inner.bot_speaking {
                return;
            }
            inner.bot_speaking = true;
        }
        debug!(destination = ?self.destination, "bot started speaking");

        let mut downstream = Frame::new(FramePayload::BotStartedSpeaking);
        downstream.transport_destination = self.destination.clone();
        let mut upstream = Frame::new(FramePayload::BotStartedSpeaking);
        upstream.transport_destination = self.destination.clone();
        node.push_frame(downstream, FrameDirection::Downstream).await;
        node.push_frame(upstream, FrameDirection::Upstream).await;
    }

    async fn bot_stopped_speaking(&self, node: &Arc<ProcessorNode>) {
        {
            let mut inner = self.inner.lock();
            if !inner.bot_speaking {
                return;
            }
            inner.bot_speaking = false;
            // Residual sub-chunk bytes never make it to the wire.
            inner.audio_buffer.clear();
        }
        debug!(destination = ?self.destination, "bot stopped speaking");

        let mut downstream = Frame::new(FramePayload::BotStoppedSpeaking);
        downstream.transport_destination = self.destination.clone();
        let mut upstream = Frame::new(FramePayload::BotStoppedSpeaking);
        upstream.transport_destination = self.destination.clone();
        node.push_frame(downstream, FrameDirection::Downstream).await;
        node.push_frame(upstream, FrameDirection::Upstream).await;
    }

    /// Non-media frames riding the audio queue; transport messages go out
    /// through the device.
    async fn handle_queued_frame(&self, frame: &Frame) {
        if let FramePayload::TransportMessage(_) = &frame.payload {
            if let Err(e) = self.device.send_message(frame.clone()).await {
                warn!(error = %e, "failed to send transport message");
            }
        }
    }
}

/// Consume the audio queue: bot lifecycle, heartbeat cadence, wire writes.
async fn audio_worker(
    sender: Arc<MediaSender>,
    node: Weak<ProcessorNode>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    // Push BotSpeaking roughly every 200 ms of audio; if chunks are larger
    // than that, push on every chunk.
    let total_chunk_ms = (sender.params.audio_out_10ms_chunks * 10).max(1);
    let speaking_period = (BOT_SPEAKING_INTERVAL_MS / total_chunk_ms).max(1) as u64;
    let mut speaking_counter: u64 = 0;

    loop {
        match tokio::time::timeout(BOT_VAD_STOP, rx.recv()).await {
            // Queue ran dry: the bot finished talking.
            Err(_) => {
                let Some(node) = node.upgrade() else { break };
                sender.bot_stopped_speaking(&node).await;
            }
            Ok(None) => break,
            Ok(Some(frame)) => {
                let Some(node) = node.upgrade() else { break };

                if matches!(frame.payload, FramePayload::TtsAudioRaw(_)) {
                    sender.bot_started_speaking(&node).await;
                    if speaking_counter % speaking_period == 0 {
                        node.push_frame(
                            Frame::new(FramePayload::BotSpeaking),
                            FrameDirection::Downstream,
                        )
                        .await;
                        node.push_frame(
                            Frame::new(FramePayload::BotSpeaking),
                            FrameDirection::Upstream,
                        )
                        .await;
                        speaking_counter = 0;
                    }
                    speaking_counter += 1;
                }

                // End is pushed downstream by the transport itself.
                if matches!(frame.payload, FramePayload::End) {
                    break;
                }

                sender.handle_queued_frame(&frame).await;

                let audio = frame.output_audio().map(|a| a.audio.clone());
                node.push_frame(frame, FrameDirection::Downstream).await;

                if let Some(bytes) = audio {
                    if let Err(e) = sender
                        .device
                        .write_raw_audio_frames(&bytes, sender.destination.as_deref())
                        .await
                    {
                        // Losing the wire is fatal for the stream.
                        error!(destination = ?sender.destination, error = %e, "failed to write audio to transport");
                        node.push_frame(Frame::new(FramePayload::Cancel), FrameDirection::Downstream)
                            .await;
                    }
                }
            }
        }
    }
}

/// Release timed frames in `(pts, id)` order, sleeping until each frame's
/// presentation time.
async fn clock_worker(
    sender: Arc<MediaSender>,
    node: Weak<ProcessorNode>,
    mut rx: mpsc::UnboundedReceiver<TimedEntry>,
) {
    let mut heap: BinaryHeap<Reverse<TimedEntry>> = BinaryHeap::new();
    loop {
        if heap.is_empty() {
            match rx.recv().await {
                Some(entry) => heap.push(Reverse(entry)),
                None => break,
            }
        }
        // Anything else already queued competes on (pts, id).
        while let Ok(entry) = rx.try_recv() {
            heap.push(Reverse(entry));
        }

        let Some(Reverse(entry)) = heap.pop() else { continue };
        if matches!(entry.frame.payload, FramePayload::End) {
            break;
        }

        let now = sender.clock.get_time();
        if entry.pts > now {
            tokio::time::sleep(Duration::from_nanos(entry.pts - now)).await;
        }

        let Some(node) = node.upgrade() else { break };
        node.push_frame(entry.frame, FrameDirection::Downstream).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::ParlanceError;
    use std::sync::atomic::AtomicBool;

    struct RecordingDevice {
        writes: Mutex<Vec<(Vec<u8>, Option<String>)>>,
        messages: Mutex<Vec<Frame>>,
        registered: Mutex<Vec<String>>,
        write_delay: Duration,
        fail_writes: AtomicBool,
    }

    impl RecordingDevice {
        fn new() -> Arc<Self> {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(write_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
                messages: Mutex::new(Vec::new()),
                registered: Mutex::new(Vec::new()),
                write_delay,
                fail_writes: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl OutputDevice for RecordingDevice {
        async fn register_audio_destination(&self, destination: &str) -> Result<()> {
            self.registered.lock().push(destination.to_string());
            Ok(())
        }

        async fn write_raw_audio_frames(
            &self,
            audio: &[u8],
            destination: Option<&str>,
        ) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(ParlanceError::Transport("wire closed".into()));
            }
            if !self.write_delay.is_zero() {
                tokio::time::sleep(self.write_delay).await;
            }
            self.writes
                .lock()
                .push((audio.to_vec(), destination.map(String::from)));
            Ok(())
        }

        async fn send_message(&self, frame: Frame) -> Result<()> {
            self.messages.lock().push(frame);
            Ok(())
        }
    }

    type Seen = (Frame, FrameDirection, u64);

    struct Collector {
        seen: Arc<Mutex<Vec<Seen>>>,
    }

    #[async_trait]
    impl FrameHandler for Collector {
        async fn handle_frame(
            &self,
            node: &Arc<ProcessorNode>,
            frame: Frame,
            direction: FrameDirection,
        ) -> Result<()> {
            let at = node.clock().map(|c| c.get_time()).unwrap_or(0);
            self.seen.lock().push((frame, direction, at));
            Ok(())
        }
    }

    struct Rig {
        transport: OutputTransport,
        device: Arc<RecordingDevice>,
        clock: Arc<SystemClock>,
        // Keep the neighbors alive: the transport's links are weak upstream.
        _up_node: Arc<ProcessorNode>,
        _down_node: Arc<ProcessorNode>,
        up: Arc<Mutex<Vec<Seen>>>,
        down: Arc<Mutex<Vec<Seen>>>,
    }

    async fn rig(params: TransportParams, allow_interruptions: bool) -> Rig {
        rig_with_device(params, allow_interruptions, RecordingDevice::new()).await
    }

    async fn rig_with_device(
        params: TransportParams,
        allow_interruptions: bool,
        device: Arc<RecordingDevice>,
    ) -> Rig {
        let transport = OutputTransport::new(params, device.clone());

        let up = Arc::new(Mutex::new(Vec::new()));
        let down = Arc::new(Mutex::new(Vec::new()));
        let up_node = ProcessorNode::new("up", Box::new(Collector { seen: Arc::clone(&up) }));
        let down_node = ProcessorNode::new("down", Box::new(Collector { seen: Arc::clone(&down) }));
        up_node.link(&transport.node());
        transport.node().link(&down_node);

        let clock = SystemClock::new();
        clock.start();
        let start = Frame::new(FramePayload::Start(StartData {
            audio_in_sample_rate: 16_000,
            audio_out_sample_rate: 16_000,
            allow_interruptions,
            clock: clock.clone(),
        }));
        transport
            .node()
            .process_frame(start, FrameDirection::Downstream)
            .await;

        Rig {
            transport,
            device,
            clock,
            _up_node: up_node,
            _down_node: down_node,
            up,
            down,
        }
    }

    fn out_params() -> TransportParams {
        TransportParams {
            audio_out_enabled: true,
            ..Default::default()
        }
    }

    fn output_audio(bytes: Vec<u8>) -> Frame {
        Frame::new(FramePayload::OutputAudioRaw(AudioFrameData::new(
            bytes, 16_000, 1,
        )))
    }

    fn tts_audio(bytes: Vec<u8>) -> Frame {
        Frame::new(FramePayload::TtsAudioRaw(AudioFrameData::new(
            bytes, 16_000, 1,
        )))
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    fn count(seen: &[Seen], pred: impl Fn(&FramePayload) -> bool) -> usize {
        seen.iter().filter(|(f, _, _)| pred(&f.payload)).count()
    }

    fn default_sender(rig: &Rig) -> Arc<MediaSender> {
        rig.transport
            .state
            .senders
            .lock()
            .get(&None)
            .cloned()
            .expect("default sender")
    }

    #[tokio::test]
    async fn chunking_splits_audio_and_retains_the_remainder() {
        let rig = rig(out_params(), false).await;
        assert_eq!(rig.transport.audio_chunk_size(), 1280);

        let pattern: Vec<u8> = (0..3200u32).map(|i| (i % 251) as u8).collect();
        rig.transport
            .node()
            .process_frame(output_audio(pattern.clone()), FrameDirection::Downstream)
            .await;

        wait_for(|| rig.device.writes.lock().len() == 2).await;
        let writes = rig.device.writes.lock();
        assert_eq!(writes[0].0, pattern[..1280]);
        assert_eq!(writes[1].0, pattern[1280..2560]);

        let sender = default_sender(&rig);
        let buffered = sender.inner.lock().audio_buffer.clone();
        assert_eq!(buffered, pattern[2560..]);

        drop(writes);
        assert_eq!(
            count(&rig.down.lock(), |p| matches!(p, FramePayload::OutputAudioRaw(_))),
            2
        );
    }

    #[tokio::test]
    async fn tts_audio_drives_speaking_lifecycle_and_cadence() {
        let rig = rig(out_params(), false).await;

        // 10 chunks of 40 ms: heartbeat every 5 chunks.
        rig.transport
            .node()
            .process_frame(tts_audio(vec![0u8; 12_800]), FrameDirection::Downstream)
            .await;

        wait_for(|| rig.device.writes.lock().len() == 10).await;
        wait_for(|| count(&rig.down.lock(), |p| matches!(p, FramePayload::TtsAudioRaw(_))) == 10)
            .await;
        {
            let down = rig.down.lock();
            assert_eq!(count(&down, |p| matches!(p, FramePayload::BotStartedSpeaking)), 1);
            assert_eq!(count(&down, |p| matches!(p, FramePayload::BotSpeaking)), 2);
            let up = rig.up.lock();
            assert_eq!(count(&up, |p| matches!(p, FramePayload::BotStartedSpeaking)), 1);
            assert_eq!(count(&up, |p| matches!(p, FramePayload::BotSpeaking)), 2);
        }

        // Queue silence flips the bot back to stopped.
        wait_for(|| count(&rig.down.lock(), |p| matches!(p, FramePayload::BotStoppedSpeaking)) == 1)
            .await;
        let down = rig.down.lock();
        let lifecycle: Vec<&'static str> = down
            .iter()
            .filter_map(|(f, _, _)| match f.payload {
                FramePayload::BotStartedSpeaking => Some("started"),
                FramePayload::BotStoppedSpeaking => Some("stopped"),
                _ => None,
            })
            .collect();
        assert_eq!(lifecycle, vec!["started", "stopped"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_frames_release_in_pts_order() {
        let rig = rig(TransportParams::default(), false).await;

        // Created first (smaller id), but scheduled later.
        let frame_a = Frame::new(FramePayload::Text("A".into())).with_pts(100_000_000);
        let frame_b = Frame::new(FramePayload::Text("B".into())).with_pts(50_000_000);
        rig.transport
            .node()
            .process_frame(frame_a, FrameDirection::Downstream)
            .await;
        rig.transport
            .node()
            .process_frame(frame_b, FrameDirection::Downstream)
            .await;

        wait_for(|| count(&rig.down.lock(), |p| matches!(p, FramePayload::Text(_))) == 2).await;
        let down = rig.down.lock();
        let texts: Vec<(String, u64)> = down
            .iter()
            .filter_map(|(f, _, at)| match &f.payload {
                FramePayload::Text(t) => Some((t.clone(), *at)),
                _ => None,
            })
            .collect();
        assert_eq!(texts[0].0, "B");
        assert_eq!(texts[1].0, "A");
        assert!(texts[0].1 >= 50_000_000, "B released at {}", texts[0].1);
        assert!(texts[1].1 >= 100_000_000, "A released at {}", texts[1].1);
        assert!(texts[0].1 <= texts[1].1);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_pts_release_in_id_order() {
        let rig = rig(TransportParams::default(), false).await;

        let first = Frame::new(FramePayload::Text("first".into())).with_pts(20_000_000);
        let second = Frame::new(FramePayload::Text("second".into())).with_pts(20_000_000);
        rig.transport
            .node()
            .process_frame(second.clone(), FrameDirection::Downstream)
            .await;
        rig.transport
            .node()
            .process_frame(first.clone(), FrameDirection::Downstream)
            .await;

        wait_for(|| count(&rig.down.lock(), |p| matches!(p, FramePayload::Text(_))) == 2).await;
        let down = rig.down.lock();
        let texts: Vec<String> = down
            .iter()
            .filter_map(|(f, _, _)| match &f.payload {
                FramePayload::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn interruption_flushes_the_partial_chunk_buffer() {
        let rig = rig(out_params(), true).await;

        rig.transport
            .node()
            .process_frame(output_audio(vec![0xAA; 500]), FrameDirection::Downstream)
            .await;
        assert_eq!(default_sender(&rig).inner.lock().audio_buffer.len(), 500);

        rig.transport
            .node()
            .process_frame(
                Frame::new(FramePayload::StartInterruption),
                FrameDirection::Downstream,
            )
            .await;
        assert!(default_sender(&rig).inner.lock().audio_buffer.is_empty());

        // The next frame starts a fresh chunk from its own bytes alone.
        rig.transport
            .node()
            .process_frame(output_audio(vec![0xBB; 1280]), FrameDirection::Downstream)
            .await;
        wait_for(|| !rig.device.writes.lock().is_empty()).await;
        let writes = rig.device.writes.lock();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].0.iter().all(|b| *b == 0xBB));
    }

    #[tokio::test]
    async fn interruption_discards_chunks_still_in_the_queue() {
        let device = RecordingDevice::with_delay(Duration::from_millis(20));
        let rig = rig_with_device(out_params(), true, device).await;

        // Five chunks hit the queue; the slow device writes one every 20 ms.
        rig.transport
            .node()
            .process_frame(output_audio(vec![0x11; 6400]), FrameDirection::Downstream)
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        rig.transport
            .node()
            .process_frame(
                Frame::new(FramePayload::StartInterruption),
                FrameDirection::Downstream,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let written = rig.device.writes.lock().len();
        assert!(written < 5, "interruption should stop pending chunks, wrote {written}");
    }

    #[tokio::test]
    async fn disabled_output_drops_audio() {
        let rig = rig(TransportParams::default(), false).await;

        rig.transport
            .node()
            .process_frame(output_audio(vec![0u8; 3200]), FrameDirection::Downstream)
            .await;
        // A sync marker behind the audio proves it was dropped, not delayed.
        rig.transport
            .node()
            .process_frame(
                Frame::new(FramePayload::Text("marker".into())),
                FrameDirection::Downstream,
            )
            .await;

        wait_for(|| count(&rig.down.lock(), |p| matches!(p, FramePayload::Text(_))) == 1).await;
        assert!(rig.device.writes.lock().is_empty());
        assert_eq!(
            count(&rig.down.lock(), |p| matches!(p, FramePayload::OutputAudioRaw(_))),
            0
        );
    }

    #[tokio::test]
    async fn unknown_destination_drops_the_frame() {
        let rig = rig(out_params(), false).await;

        rig.transport
            .node()
            .process_frame(
                output_audio(vec![0u8; 1280]).with_destination("nowhere"),
                FrameDirection::Downstream,
            )
            .await;
        rig.transport
            .node()
            .process_frame(
                Frame::new(FramePayload::Text("marker".into())),
                FrameDirection::Downstream,
            )
            .await;

        wait_for(|| count(&rig.down.lock(), |p| matches!(p, FramePayload::Text(_))) == 1).await;
        assert!(rig.device.writes.lock().is_empty());
    }

    #[tokio::test]
    async fn urgent_messages_bypass_the_queues() {
        let rig = rig(out_params(), false).await;

        rig.transport
            .node()
            .process_frame(
                Frame::new(FramePayload::TransportMessageUrgent(serde_json::json!({"k": 1}))),
                FrameDirection::Downstream,
            )
            .await;

        // Delivered synchronously, and not forwarded downstream.
        assert_eq!(rig.device.messages.lock().len(), 1);
        assert_eq!(
            count(&rig.down.lock(), |p| matches!(p, FramePayload::TransportMessageUrgent(_))),
            0
        );
    }

    #[tokio::test]
    async fn sync_messages_ride_the_audio_queue() {
        let rig = rig(out_params(), false).await;

        rig.transport
            .node()
            .process_frame(
                Frame::new(FramePayload::TransportMessage(serde_json::json!({"k": 2}))),
                FrameDirection::Downstream,
            )
            .await;

        wait_for(|| rig.device.messages.lock().len() == 1).await;
        wait_for(|| count(&rig.down.lock(), |p| matches!(p, FramePayload::TransportMessage(_))) == 1)
            .await;
    }

    #[tokio::test]
    async fn end_drains_queued_audio_before_returning() {
        let rig = rig(out_params(), false).await;

        rig.transport
            .node()
            .process_frame(output_audio(vec![0x42; 2560]), FrameDirection::Downstream)
            .await;
        rig.transport
            .node()
            .process_frame(Frame::new(FramePayload::End), FrameDirection::Downstream)
            .await;

        // stop() joined both workers, so the writes are already on the wire.
        assert_eq!(rig.device.writes.lock().len(), 2);
        assert_eq!(count(&rig.down.lock(), |p| matches!(p, FramePayload::End)), 1);
    }

    #[tokio::test]
    async fn upstream_frames_pass_through_unchanged() {
        let rig = rig(out_params(), false).await;

        rig.transport
            .node()
            .process_frame(
                Frame::new(FramePayload::Text("upward".into())),
                FrameDirection::Upstream,
            )
            .await;

        wait_for(|| count(&rig.up.lock(), |p| matches!(p, FramePayload::Text(_))) == 1).await;
        assert!(rig.device.writes.lock().is_empty());
    }

    #[tokio::test]
    async fn destinations_get_their_own_senders() {
        let params = TransportParams {
            audio_out_enabled: true,
            audio_out_destinations: vec!["alt".into(), "alt".into()],
            ..Default::default()
        };
        let rig = rig(params, false).await;

        assert!(rig.device.registered.lock().contains(&"alt".to_string()));
        assert_eq!(rig.transport.state.senders.lock().len(), 2);

        rig.transport
            .node()
            .process_frame(
                output_audio(vec![0x01; 1280]).with_destination("alt"),
                FrameDirection::Downstream,
            )
            .await;
        rig.transport
            .node()
            .process_frame(output_audio(vec![0x02; 1280]), FrameDirection::Downstream)
            .await;

        wait_for(|| rig.device.writes.lock().len() == 2).await;
        let writes = rig.device.writes.lock();
        assert!(writes
            .iter()
            .any(|(bytes, dest)| dest.as_deref() == Some("alt") && bytes[0] == 0x01));
        assert!(writes.iter().any(|(bytes, dest)| dest.is_none() && bytes[0] == 0x02));
    }

    #[tokio::test]
    async fn write_failure_synthesizes_cancel() {
        let rig = rig(out_params(), false).await;
        rig.device.fail_writes.store(true, Ordering::SeqCst);

        rig.transport
            .node()
            .process_frame(output_audio(vec![0u8; 1280]), FrameDirection::Downstream)
            .await;

        wait_for(|| count(&rig.down.lock(), |p| matches!(p, FramePayload::Cancel)) >= 1).await;
    }

    #[tokio::test]
    async fn clock_is_available_from_start() {
        let rig = rig(TransportParams::default(), false).await;
        assert!(rig.transport.node().clock().is_some());
        assert!(rig.clock.get_time() < 10_000_000_000);
    }
}
