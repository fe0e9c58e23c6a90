//! The pipeline node abstraction.
//!
//! ## Delivery model
//!
//! ```text
//! ordered:  push_frame ─► neighbor FIFO ─► worker ─► process_frame
//! system:   push_frame ──────────────────────────► process_frame
//! ```
//!
//! Every node owns one FIFO consumer task. Ordered frames (data and control)
//! are enqueued on the *receiving* node's FIFO and delivered in enqueue
//! order per direction. System frames skip the queue entirely and are
//! delivered by direct invocation, which is how interruptions overtake
//! buffered work.
//!
//! Node behavior lives in a [`FrameHandler`] object; the node itself only
//! implements linking, queueing, task lifecycle, and the base dispatch
//! (recording `Start` state, discarding the queue on `StartInterruption`).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::error::{ParlanceError, Result};
use crate::frames::{Frame, FramePayload};

/// Direction a frame travels in: toward the egress or toward the ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Downstream,
    Upstream,
}

/// Per-node behavior, attached to a [`ProcessorNode`].
///
/// Handlers receive every frame the node's base dispatch accepts, in
/// delivery order for ordered frames. A handler that wants a frame to
/// continue traveling must push it onward itself; the base never forwards.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_frame(
        &self,
        node: &Arc<ProcessorNode>,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()>;

    /// Release handler-owned resources. Called once from [`ProcessorNode::cleanup`].
    async fn cleanup(&self, _node: &Arc<ProcessorNode>) {}
}

/// Handler that forwards every frame in its incoming direction.
pub struct Passthrough;

#[async_trait]
impl FrameHandler for Passthrough {
    async fn handle_frame(
        &self,
        node: &Arc<ProcessorNode>,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        node.push_frame(frame, direction).await;
        Ok(())
    }
}

/// Handle to a task spawned through [`ProcessorNode::create_task`].
///
/// The owning node keeps an abort handle so `cleanup` can release every
/// outstanding task even if the holder forgot to.
pub struct TaskHandle {
    id: u64,
    name: String,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

type QueuedFrame = (Frame, FrameDirection);

/// A pipeline node: bidirectional links, one FIFO consumer task, scoped
/// task lifecycle, and base dispatch of system frames.
///
/// Nodes are reference-counted; the pipeline owns its processors, neighbor
/// back-references are weak. Construction spawns the FIFO worker, so a
/// tokio runtime must be current.
pub struct ProcessorNode {
    name: String,
    handler: Box<dyn FrameHandler>,
    weak_self: Weak<ProcessorNode>,

    prev: Mutex<Option<Weak<ProcessorNode>>>,
    next: Mutex<Option<Arc<ProcessorNode>>>,
    parent: Mutex<Option<Weak<ProcessorNode>>>,

    queue_tx: Mutex<Option<mpsc::UnboundedSender<QueuedFrame>>>,
    queue_worker: Mutex<Option<TaskHandle>>,

    started: AtomicBool,
    interruptions_allowed: AtomicBool,
    clock: Mutex<Option<Arc<dyn Clock>>>,

    tasks: Mutex<HashMap<u64, AbortHandle>>,
    next_task_id: AtomicU64,
}

impl ProcessorNode {
    pub fn new(name: impl Into<String>, handler: Box<dyn FrameHandler>) -> Arc<Self> {
        let node = Arc::new_cyclic(|weak| Self {
            name: name.into(),
            handler,
            weak_self: weak.clone(),
            prev: Mutex::new(None),
            next: Mutex::new(None),
            parent: Mutex::new(None),
            queue_tx: Mutex::new(None),
            queue_worker: Mutex::new(None),
            started: AtomicBool::new(false),
            interruptions_allowed: AtomicBool::new(false),
            clock: Mutex::new(None),
            tasks: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(0),
        });
        let stale = node.spawn_queue_worker();
        debug_assert!(stale.is_none());
        node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `Start` allowed interruptions for this run.
    pub fn interruptions_allowed(&self) -> bool {
        self.interruptions_allowed.load(Ordering::SeqCst)
    }

    /// The shared pipeline clock, available after `Start`.
    pub fn clock(&self) -> Option<Arc<dyn Clock>> {
        self.clock.lock().clone()
    }

    /// Link `self -> next`; sets the reciprocal upstream back-reference.
    pub fn link(self: &Arc<Self>, next: &Arc<ProcessorNode>) {
        debug!(from = %self.name, to = %next.name, "linking processors");
        *self.next.lock() = Some(Arc::clone(next));
        *next.prev.lock() = Some(Arc::downgrade(self));
    }

    pub fn set_parent(&self, parent: &Arc<ProcessorNode>) {
        *self.parent.lock() = Some(Arc::downgrade(parent));
    }

    pub fn parent(&self) -> Option<Arc<ProcessorNode>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    fn neighbor(&self, direction: FrameDirection) -> Option<Arc<ProcessorNode>> {
        match direction {
            FrameDirection::Downstream => self.next.lock().clone(),
            FrameDirection::Upstream => self.prev.lock().as_ref().and_then(Weak::upgrade),
        }
    }

    /// Enqueue a frame on this node's FIFO; the worker task delivers it to
    /// `process_frame` in order. System frames never wait behind the queue:
    /// they are processed inline.
    pub async fn queue_frame(self: &Arc<Self>, frame: Frame, direction: FrameDirection) -> Result<()> {
        if frame.is_system() {
            self.process_frame(frame, direction).await;
            return Ok(());
        }
        let tx = self.queue_tx.lock().clone();
        match tx {
            Some(tx) => tx
                .send((frame, direction))
                .map_err(|_| ParlanceError::NotRunning),
            None => Err(ParlanceError::NotRunning),
        }
    }

    /// Route a frame to the neighbor in `direction`: ordered frames through
    /// the neighbor's FIFO, system frames by direct invocation.
    pub async fn push_frame(self: &Arc<Self>, frame: Frame, direction: FrameDirection) {
        let Some(neighbor) = self.neighbor(direction) else {
            trace!(processor = %self.name, frame = %frame, ?direction, "no neighbor, dropping frame");
            return;
        };

        if frame.is_system() {
            neighbor.process_frame(frame, direction).await;
        } else if let Err(e) = neighbor.queue_frame(frame, direction).await {
            warn!(processor = %self.name, to = %neighbor.name, error = %e, "failed to enqueue frame");
        }
    }

    /// Deliver one frame to this node: base dispatch, then the handler.
    ///
    /// Handler failures are logged and the frame is discarded; they never
    /// propagate to the caller.
    pub async fn process_frame(self: &Arc<Self>, frame: Frame, direction: FrameDirection) {
        match &frame.payload {
            FramePayload::Start(start) => {
                self.interruptions_allowed
                    .store(start.allow_interruptions, Ordering::SeqCst);
                *self.clock.lock() = Some(Arc::clone(&start.clock));
                self.started.store(true, Ordering::SeqCst);
            }
            FramePayload::StartInterruption => {
                self.start_interruption().await;
            }
            _ => {
                if !self.started.load(Ordering::SeqCst) && !frame.is_system() {
                    warn!(processor = %self.name, frame = %frame, "frame observed before Start");
                }
            }
        }

        let frame_name = frame.name.clone();
        if let Err(e) = self.handler.handle_frame(self, frame, direction).await {
            warn!(processor = %self.name, frame = %frame_name, error = %e, "error handling frame, dropping it");
        }
    }

    /// Discard every queued frame and replace the FIFO worker with a fresh
    /// one. Base behavior for `StartInterruption`; the input transport also
    /// calls it when it originates an interruption.
    pub(crate) async fn start_interruption(&self) {
        trace!(processor = %self.name, "interruption: discarding queued frames");
        if let Some(old) = self.spawn_queue_worker() {
            old.handle.abort();
            // Reaped off-path: a worker that delivered this very frame must
            // not join on itself.
            tokio::spawn(async move {
                let _ = old.handle.await;
            });
        }
    }

    /// Install a fresh FIFO channel and consumer task, returning the
    /// previous worker (still running on the old, now-orphaned channel).
    fn spawn_queue_worker(&self) -> Option<TaskHandle> {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedFrame>();
        *self.queue_tx.lock() = Some(tx);

        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            while let Some((frame, direction)) = rx.recv().await {
                let Some(node) = weak.upgrade() else { break };
                node.process_frame(frame, direction).await;
            }
        });

        let task = TaskHandle {
            id: self.next_task_id.fetch_add(1, Ordering::Relaxed),
            name: format!("{}::queue", self.name),
            handle,
        };
        self.queue_worker.lock().replace(task)
    }

    /// Spawn a task owned by this node; it is aborted on `cleanup` if still
    /// running.
    pub fn create_task<F>(&self, name: &str, fut: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(fut);
        self.tasks.lock().insert(id, handle.abort_handle());
        TaskHandle {
            id,
            name: format!("{}::{name}", self.name),
            handle,
        }
    }

    /// Request cooperative cancellation and await termination.
    pub async fn cancel_task(&self, task: TaskHandle) {
        self.tasks.lock().remove(&task.id);
        task.handle.abort();
        match task.handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => trace!(task = %task.name, "task cancelled"),
            Err(e) => warn!(task = %task.name, error = %e, "cancelled task ended abnormally"),
        }
    }

    /// Await normal completion of a task.
    pub async fn wait_for_task(&self, task: TaskHandle) {
        self.tasks.lock().remove(&task.id);
        if let Err(e) = task.handle.await {
            if e.is_cancelled() {
                trace!(task = %task.name, "task cancelled while awaited");
            } else {
                warn!(task = %task.name, error = %e, "task panicked");
            }
        }
    }

    /// Release the FIFO worker and every registered task, then let the
    /// handler release its own resources.
    pub async fn cleanup(self: &Arc<Self>) {
        self.handler.cleanup(self).await;

        self.queue_tx.lock().take();
        let worker = self.queue_worker.lock().take();
        if let Some(task) = worker {
            task.handle.abort();
            let _ = task.handle.await;
        }

        let aborts: Vec<AbortHandle> = self.tasks.lock().drain().map(|(_, a)| a).collect();
        for abort in aborts {
            abort.abort();
        }
    }
}

impl std::fmt::Debug for ProcessorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorNode")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
