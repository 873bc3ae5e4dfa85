// src/lib.rs
//! Rule-driven entity resolution: block, score and classify record pairs,
//! cluster the matches and merge each cluster into a golden record.

pub mod clustering;
pub mod error;
pub mod job;
pub mod matching;
pub mod merging;
pub mod models;
pub mod plugins;
pub mod store;
pub mod utils;

pub use error::{ResolutionError, Result};
pub use job::{CancelFlag, JobMode, JobReport, JobState, ResolutionEngine, RunSummary};
pub use merging::{CommitOutcome, MergeService};
pub use plugins::{CustomMergeFunction, ExternalScorer, PluginRegistry};
pub use store::{InMemoryResolutionStore, PostgresResolutionStore, ResolutionStore};
