//! Leak Analysis Engine: deterministic memory-diagnostic pipeline.
//!
//! Parses Valgrind memcheck XML and sanitizer text logs, normalizes them into
//! one leak model, removes system-library noise and duplicates, scores each
//! leak, and compares each session against an append-only trend history.
//!
//! No network, no rendering; pure computation plus a local file store.

pub mod cleanup;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod normalize;
pub mod parse;
pub mod patterns;
pub mod score;
pub mod session;
pub mod stats;
pub mod trend;
pub mod types;

pub use config::{BaselineSelector, Config};
pub use engine::{AnalysisInput, BatchOutcome, CancelToken, Engine, InputSource, RunOptions};
pub use error::{EngineError, StoreError};
pub use parse::{FormatHint, FormatKind, LogParser};
pub use trend::{
  JsonlTrendStore, MemoryTrendStore, RegressionPolicy, TrendHistory, TrendQuery, TrendStore,
};
pub use types::{AnalysisSession, Category, Direction, LeakKind, LeakRecord, TrendVerdict};
