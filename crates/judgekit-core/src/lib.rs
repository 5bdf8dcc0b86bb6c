//! judgekit-core: judging pipeline and evaluation statistics.
//!
//! This crate defines the data model, the verdict normalizer, the batch
//! orchestrator and per-item adapter, the resumable judging engine, and the
//! statistics (group summaries, paired deltas, win/loss, inter-rater
//! reliability) computed from the scored items.

pub mod adapter;
pub mod aggregate;
pub mod batch;
pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod model;
pub mod normalize;
pub mod paired;
pub mod prompts;
pub mod reliability;
pub mod report;
pub mod statistics;
pub mod traits;
