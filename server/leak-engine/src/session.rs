//! Views over a finished AnalysisSession: report rows, trend entry, regression gate.

use crate::trend::RegressionPolicy;
use crate::types::{AnalysisSession, LeakRow, RegressionCheck, TrendEntry};

impl AnalysisSession {
  /// One row per leak, in ranked order.
  pub fn rows(&self) -> Vec<LeakRow> {
    let verdict = self.trend_verdict.as_ref();
    self
      .leaks
      .iter()
      .map(|scored| {
        let leak = &scored.leak;
        LeakRow {
          signature: leak.signature.0.clone(),
          kind: leak.kind.label().to_string(),
          severity: leak.severity,
          size_bytes: leak.size_bytes,
          occurrence_count: leak.occurrence_count,
          primary_location: leak.primary_location_label(),
          score: scored.impact.score,
          category: scored.impact.category,
          stack_frames: leak.stack_frames.iter().map(|f| f.to_string()).collect(),
          trend_direction: verdict.map(|v| v.direction),
          is_new: verdict.map(|v| v.new_signatures.contains(&leak.signature)),
        }
      })
      .collect()
  }

  /// The history record this session contributes to the trend store.
  pub fn trend_entry(&self) -> TrendEntry {
    TrendEntry {
      session_id: self.session_id.clone(),
      timestamp: self.timestamp,
      version_label: self.version_label.clone(),
      summary: self.summary.clone(),
      leak_signatures: self.leaks.iter().map(|s| s.leak.signature.clone()).collect(),
    }
  }

  /// Evaluate `policy` against the verdict. A session without a verdict
  /// (first run, or the store was unavailable) never counts as regressed.
  pub fn check_regression(&self, policy: &RegressionPolicy) -> RegressionCheck {
    match &self.trend_verdict {
      Some(verdict) => policy.evaluate(verdict),
      None => RegressionCheck::default(),
    }
  }
}
