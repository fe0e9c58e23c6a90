//! Pipeline execution.
//!
//! `PipelineTask` drives a pipeline through its lifecycle: it starts the
//! shared clock, injects `Start` with the negotiated sample rates, flushes
//! frames queued before the run, then waits until an `End` or `Cancel`
//! reaches the far end of the chain. `PipelineRunner` adds the process-level
//! concern of turning SIGINT into a pipeline cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::frames::{Frame, FramePayload, StartData};
use crate::processors::{FrameDirection, FrameHandler, ProcessorNode};

/// Start parameters for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub audio_in_sample_rate: u32,
    pub audio_out_sample_rate: u32,
    pub allow_interruptions: bool,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            audio_in_sample_rate: 16_000,
            audio_out_sample_rate: 16_000,
            allow_interruptions: false,
        }
    }
}

/// Feeds embedder frames into the pipeline; upstream frames that travel all
/// the way out terminate here.
struct TaskSource;

#[async_trait]
impl FrameHandler for TaskSource {
    async fn handle_frame(
        &self,
        node: &Arc<ProcessorNode>,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        match direction {
            FrameDirection::Downstream => node.push_frame(frame, direction).await,
            FrameDirection::Upstream => {
                trace!(frame = %frame, "frame reached the task source, dropping")
            }
        }
        Ok(())
    }
}

/// Observes the downstream end of the chain and resolves the run when the
/// terminal frame arrives.
struct TaskSink {
    finished_tx: watch::Sender<bool>,
}

#[async_trait]
impl FrameHandler for TaskSink {
    async fn handle_frame(
        &self,
        node: &Arc<ProcessorNode>,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        match direction {
            FrameDirection::Downstream => match frame.payload {
                FramePayload::End => {
                    debug!("pipeline reached end of stream");
                    let _ = self.finished_tx.send(true);
                }
                FramePayload::Cancel => {
                    debug!("pipeline cancelled");
                    let _ = self.finished_tx.send(true);
                }
                _ => trace!(frame = %frame, "frame reached the task sink, dropping"),
            },
            FrameDirection::Upstream => node.push_frame(frame, direction).await,
        }
        Ok(())
    }
}

/// Drives one pipeline run.
pub struct PipelineTask {
    source: Arc<ProcessorNode>,
    sink: Arc<ProcessorNode>,
    pipeline: Arc<ProcessorNode>,
    params: PipelineParams,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    /// Frames queued before `run()`; delivered right after `Start`.
    pending: Mutex<Vec<Frame>>,
    finished_rx: watch::Receiver<bool>,
}

impl PipelineTask {
    pub fn new(pipeline: Arc<ProcessorNode>, params: PipelineParams) -> Self {
        Self::with_clock(pipeline, params, SystemClock::new())
    }

    /// Build a task around an externally supplied clock (tests inject a
    /// virtual one).
    pub fn with_clock(
        pipeline: Arc<ProcessorNode>,
        params: PipelineParams,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (finished_tx, finished_rx) = watch::channel(false);
        let source = ProcessorNode::new("PipelineTaskSource", Box::new(TaskSource));
        let sink = ProcessorNode::new("PipelineTaskSink", Box::new(TaskSink { finished_tx }));

        source.link(&pipeline);
        pipeline.link(&sink);

        Self {
            source,
            sink,
            pipeline,
            params,
            clock,
            running: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            finished_rx,
        }
    }

    /// The clock every processor receives on `Start`.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Queue a frame for downstream delivery. Frames queued before `run()`
    /// are buffered and injected right after `Start`.
    pub async fn queue_frame(&self, frame: Frame) {
        if self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.source.queue_frame(frame, FrameDirection::Downstream).await {
                warn!(error = %e, "failed to queue frame on running task");
            }
        } else {
            self.pending.lock().push(frame);
        }
    }

    pub async fn queue_frames(&self, frames: Vec<Frame>) {
        for frame in frames {
            self.queue_frame(frame).await;
        }
    }

    /// Queue a graceful end of stream; in-flight media drains before the
    /// run resolves.
    pub async fn stop_when_done(&self) {
        self.queue_frame(Frame::new(FramePayload::End)).await;
    }

    /// Abort the run: `Cancel` propagates out-of-band and nothing drains.
    pub async fn cancel(&self) {
        info!("cancelling pipeline task");
        self.source
            .process_frame(Frame::new(FramePayload::Cancel), FrameDirection::Downstream)
            .await;
    }

    /// Run the pipeline to completion: start the clock, inject `Start`,
    /// flush pre-queued frames, then wait for `End`/`Cancel` to reach the
    /// sink. Cleans up every processor before returning.
    pub async fn run(&self) -> Result<()> {
        self.clock.start();

        let start = Frame::new(FramePayload::Start(StartData {
            audio_in_sample_rate: self.params.audio_in_sample_rate,
            audio_out_sample_rate: self.params.audio_out_sample_rate,
            allow_interruptions: self.params.allow_interruptions,
            clock: Arc::clone(&self.clock),
        }));
        self.source
            .process_frame(start, FrameDirection::Downstream)
            .await;

        self.running.store(true, Ordering::SeqCst);
        let pending: Vec<Frame> = std::mem::take(&mut *self.pending.lock());
        for frame in pending {
            if let Err(e) = self.source.queue_frame(frame, FrameDirection::Downstream).await {
                warn!(error = %e, "failed to queue pending frame");
            }
        }

        let mut finished = self.finished_rx.clone();
        while !*finished.borrow() {
            if finished.changed().await.is_err() {
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.source.cleanup().await;
        self.pipeline.cleanup().await;
        self.sink.cleanup().await;
        info!("pipeline task finished");
        Ok(())
    }
}

/// Runs a pipeline task, optionally converting SIGINT into `Cancel`.
pub struct PipelineRunner {
    handle_sigint: bool,
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRunner {
    pub fn new() -> Self {
        Self { handle_sigint: true }
    }

    pub fn without_signal_handler() -> Self {
        Self {
            handle_sigint: false,
        }
    }

    pub async fn run(&self, task: &PipelineTask) -> Result<()> {
        if !self.handle_sigint {
            return task.run().await;
        }
        tokio::select! {
            result = task.run() => result,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received, cancelling pipeline");
                task.cancel().await;
                Ok(())
            }
        }
    }
}
