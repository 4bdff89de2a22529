//! Trend history: the append-only store, baseline selection, comparison.

pub mod compare;
pub mod store;

use chrono::{DateTime, Utc};

use crate::config::BaselineSelector;
use crate::error::StoreError;
use crate::types::TrendEntry;

pub use compare::{compare, HistorySummary, RegressionPolicy, TrendHistory};
pub use store::{JsonlTrendStore, MemoryTrendStore};

/// Filter for `TrendStore::query`. All bounds are inclusive; `None` is open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrendQuery {
  pub since: Option<DateTime<Utc>>,
  pub until: Option<DateTime<Utc>>,
  pub version_label: Option<String>,
}

impl TrendQuery {
  pub fn all() -> Self {
    Self::default()
  }

  pub fn version(label: impl Into<String>) -> Self {
    Self {
      version_label: Some(label.into()),
      ..Self::default()
    }
  }

  pub fn matches(&self, entry: &TrendEntry) -> bool {
    self.since.map_or(true, |t| entry.timestamp >= t)
      && self.until.map_or(true, |t| entry.timestamp <= t)
      && self
        .version_label
        .as_ref()
        .map_or(true, |v| entry.version_label.as_ref() == Some(v))
  }
}

/// Append-only history of session summaries.
///
/// Implementations must make `append` atomic with respect to concurrent
/// readers, and must return entries ascending by timestamp then session id.
pub trait TrendStore: Send + Sync {
  /// Record an entry. `Ok(false)` when the session id is already present.
  fn append(&self, entry: &TrendEntry) -> Result<bool, StoreError>;

  fn query(&self, query: &TrendQuery) -> Result<Vec<TrendEntry>, StoreError>;
}

/// Canonical history order: timestamp ascending, then session id.
pub fn sort_entries(entries: &mut [TrendEntry]) {
  entries.sort_by(|a, b| {
    a.timestamp
      .cmp(&b.timestamp)
      .then_with(|| a.session_id.cmp(&b.session_id))
  });
}

/// Pick the entry `current` is compared against. Never `current` itself.
/// `history` must be in canonical order.
pub fn select_baseline<'a>(
  history: &'a [TrendEntry],
  current: &TrendEntry,
  selector: &BaselineSelector,
) -> Option<&'a TrendEntry> {
  let mut others = history
    .iter()
    .filter(|e| e.session_id != current.session_id);
  match selector {
    BaselineSelector::Latest => others.filter(|e| e.timestamp <= current.timestamp).last(),
    BaselineSelector::Session(id) => others.find(|e| &e.session_id == id),
    BaselineSelector::Version(label) => others
      .filter(|e| e.version_label.as_ref() == Some(label))
      .last(),
  }
}
