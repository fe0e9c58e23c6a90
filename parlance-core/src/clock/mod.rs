//! Pipeline time source.
//!
//! Timed frames carry presentation timestamps in nanoseconds; the output
//! stage releases them against a shared clock. The clock is process-wide,
//! started once by the pipeline task, and read-only afterwards.
//!
//! `SystemClock` is backed by `tokio::time::Instant`, so tests running under
//! a paused tokio runtime can advance it deterministically together with
//! every pending sleep.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

/// A startable, monotonic nanosecond time source.
///
/// `get_time()` returns `0` until `start()` is called and is monotonic
/// afterwards. The value is *not* wall time; only differences within one
/// clock domain are meaningful.
pub trait Clock: Send + Sync {
    fn start(&self);

    /// Nanoseconds elapsed since `start()`.
    fn get_time(&self) -> u64;
}

/// Monotonic clock based on the tokio instant source.
#[derive(Default)]
pub struct SystemClock {
    started_at: Mutex<Option<Instant>>,
}

impl SystemClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Clock for SystemClock {
    fn start(&self) {
        let mut started = self.started_at.lock();
        if started.is_none() {
            *started = Some(Instant::now());
        }
    }

    fn get_time(&self) -> u64 {
        match *self.started_at.lock() {
            Some(t0) => t0.elapsed().as_nanos() as u64,
            None => 0,
        }
    }
}
