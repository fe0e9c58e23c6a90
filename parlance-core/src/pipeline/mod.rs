//! Linear pipeline composition.
//!
//! A pipeline wraps an ordered list of processors between a synthetic
//! source and sink so both directions stay visible to the embedder:
//!
//! ```text
//!            ┌────────────────────── Pipeline ──────────────────────┐
//! embedder ─►│ PipelineSource ─► P1 ─► … ─► Pn ─► PipelineSink │─► embedder
//!            └──────────────────────────────────────────────────────┘
//! ```
//!
//! Downstream frames entering the pipeline are enqueued on the source;
//! upstream frames on the sink. Frames leaving either end are forwarded
//! through the pipeline node's own neighbors, so pipelines nest like any
//! other processor.

pub mod task;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::frames::Frame;
use crate::processors::{FrameDirection, FrameHandler, ProcessorNode};

/// Boundary node at the upstream end of a pipeline.
struct PipelineSource;

#[async_trait]
impl FrameHandler for PipelineSource {
    async fn handle_frame(
        &self,
        node: &Arc<ProcessorNode>,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        match direction {
            // Into the chain.
            FrameDirection::Downstream => node.push_frame(frame, direction).await,
            // Out of the pipeline, through the pipeline node's own links.
            FrameDirection::Upstream => {
                if let Some(parent) = node.parent() {
                    parent.push_frame(frame, direction).await;
                }
            }
        }
        Ok(())
    }
}

/// Boundary node at the downstream end of a pipeline.
struct PipelineSink;

#[async_trait]
impl FrameHandler for PipelineSink {
    async fn handle_frame(
        &self,
        node: &Arc<ProcessorNode>,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        match direction {
            FrameDirection::Upstream => node.push_frame(frame, direction).await,
            FrameDirection::Downstream => {
                if let Some(parent) = node.parent() {
                    parent.push_frame(frame, direction).await;
                }
            }
        }
        Ok(())
    }
}

struct PipelineBody {
    source: Arc<ProcessorNode>,
    sink: Arc<ProcessorNode>,
    children: Vec<Arc<ProcessorNode>>,
}

#[async_trait]
impl FrameHandler for PipelineBody {
    async fn handle_frame(
        &self,
        _node: &Arc<ProcessorNode>,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        match direction {
            FrameDirection::Downstream => self.source.queue_frame(frame, direction).await,
            FrameDirection::Upstream => self.sink.queue_frame(frame, direction).await,
        }
    }

    async fn cleanup(&self, _node: &Arc<ProcessorNode>) {
        for child in &self.children {
            child.cleanup().await;
        }
    }
}

/// Builder for a linear chain of processors.
pub struct Pipeline;

impl Pipeline {
    /// Compose `processors` into a pipeline node. Adjacent processors are
    /// linked in order; every child's parent is the returned node.
    pub fn new(processors: Vec<Arc<ProcessorNode>>) -> Arc<ProcessorNode> {
        let source = ProcessorNode::new("PipelineSource", Box::new(PipelineSource));
        let sink = ProcessorNode::new("PipelineSink", Box::new(PipelineSink));

        let mut children = Vec::with_capacity(processors.len() + 2);
        children.push(Arc::clone(&source));
        children.extend(processors);
        children.push(Arc::clone(&sink));

        let pipeline = ProcessorNode::new(
            "Pipeline",
            Box::new(PipelineBody {
                source,
                sink,
                children: children.clone(),
            }),
        );

        for pair in children.windows(2) {
            pair[0].link(&pair[1]);
        }
        for child in &children {
            child.set_parent(&pipeline);
        }
        debug!(processors = children.len(), "pipeline linked");

        pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::frames::{FramePayload, StartData};
    use crate::processors::Passthrough;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Collector {
        seen: Arc<Mutex<Vec<(Frame, FrameDirection)>>>,
    }

    #[async_trait]
    impl FrameHandler for Collector {
        async fn handle_frame(
            &self,
            _node: &Arc<ProcessorNode>,
            frame: Frame,
            direction: FrameDirection,
        ) -> Result<()> {
            self.seen.lock().push((frame, direction));
            Ok(())
        }
    }

    fn collector(name: &str) -> (Arc<ProcessorNode>, Arc<Mutex<Vec<(Frame, FrameDirection)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let node = ProcessorNode::new(name, Box::new(Collector { seen: Arc::clone(&seen) }));
        (node, seen)
    }

    fn start_frame() -> Frame {
        Frame::new(FramePayload::Start(StartData {
            audio_in_sample_rate: 16_000,
            audio_out_sample_rate: 16_000,
            allow_interruptions: false,
            clock: SystemClock::new(),
        }))
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

    #[tokio::test]
    async fn downstream_frames_traverse_the_chain() {
        let inner = vec![
            ProcessorNode::new("p1", Box::new(Passthrough)),
            ProcessorNode::new("p2", Box::new(Passthrough)),
        ];
        let pipeline = Pipeline::new(inner);
        let (tail, seen) = collector("tail");
        pipeline.link(&tail);

        pipeline.process_frame(start_frame(), FrameDirection::Downstream).await;
        for i in 0..10 {
            pipeline
                .queue_frame(
                    Frame::new(FramePayload::Text(format!("t{i}"))),
                    FrameDirection::Downstream,
                )
                .await
                .unwrap();
        }

        wait_for(|| seen.lock().len() == 11).await;
        let seen = seen.lock();
        assert!(matches!(seen[0].0.payload, FramePayload::Start(_)));
        for (i, (frame, direction)) in seen.iter().skip(1).enumerate() {
            assert_eq!(*direction, FrameDirection::Downstream);
            match &frame.payload {
                FramePayload::Text(t) => assert_eq!(t, &format!("t{i}")),
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn upstream_frames_exit_through_the_source() {
        let (head, seen) = collector("head");
        let pipeline = Pipeline::new(vec![ProcessorNode::new("p1", Box::new(Passthrough))]);
        head.link(&pipeline);

        pipeline.process_frame(start_frame(), FrameDirection::Downstream).await;
        pipeline
            .queue_frame(
                Frame::new(FramePayload::BotInterruption),
                FrameDirection::Upstream,
            )
            .await
            .unwrap();

        wait_for(|| {
            seen.lock()
                .iter()
                .any(|(f, d)| {
                    matches!(f.payload, FramePayload::BotInterruption)
                        && *d == FrameDirection::Upstream
                })
        })
        .await;
    }

    #[tokio::test]
    async fn cleanup_reaches_every_child() {
        let p1 = ProcessorNode::new("p1", Box::new(Passthrough));
        let pipeline = Pipeline::new(vec![Arc::clone(&p1)]);
        pipeline.cleanup().await;

        let err = p1
            .queue_frame(
                Frame::new(FramePayload::Text("late".into())),
                FrameDirection::Downstream,
            )
            .await;
        assert!(err.is_err());
    }
}
