pub mod checkpoint;
pub mod orchestrator;
pub mod signature;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use self::checkpoint::{JobCheckpoint, JobMode, JobState};
pub use self::orchestrator::{JobReport, ResolutionEngine, RunSummary};

/// Cooperative cancellation shared by a job and its bucket tasks. Work stops
/// between units; committed clusters and the checkpoint stay consistent.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
