//! Session-vs-baseline comparison, regression policy, and history summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CategoryDeltas, Direction, RegressionCheck, TrendEntry, TrendVerdict};

fn signed_delta(current: u64, baseline: u64) -> i64 {
  (current as i128 - baseline as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Direction of a percentage change given the noise band.
pub fn direction(delta_pct: f64, noise_threshold_pct: f64) -> Direction {
  if delta_pct == 0.0 || delta_pct.abs() < noise_threshold_pct {
    Direction::Stable
  } else if delta_pct > 0.0 {
    Direction::Regressing
  } else {
    Direction::Improving
  }
}

/// Compare `current` against `baseline`.
///
/// Deltas are `current - baseline`, so swapping the arguments negates every
/// delta and swaps new/resolved signatures.
pub fn compare(current: &TrendEntry, baseline: &TrendEntry, noise_threshold_pct: f64) -> TrendVerdict {
  let cur = &current.summary;
  let base = &baseline.summary;

  let delta_bytes = signed_delta(cur.total_bytes, base.total_bytes);
  let delta_count = signed_delta(cur.total_leaks, base.total_leaks);
  let delta_pct = delta_bytes as f64 / base.total_bytes.max(1) as f64 * 100.0;

  let category_deltas = CategoryDeltas {
    high: signed_delta(cur.by_category.high, base.by_category.high),
    medium: signed_delta(cur.by_category.medium, base.by_category.medium),
    low: signed_delta(cur.by_category.low, base.by_category.low),
  };

  // Weighted leak-count ratio, byte ratio and HIGH-count delta.
  let regression_score = if base.total_leaks == 0 {
    0.0
  } else {
    let leak_ratio = delta_count as f64 / base.total_leaks as f64;
    let bytes_ratio = delta_bytes as f64 / base.total_bytes.max(1) as f64;
    leak_ratio * 0.4 + bytes_ratio * 0.3 + category_deltas.high as f64 * 0.3
  };

  TrendVerdict {
    baseline_session_id: baseline.session_id.clone(),
    baseline_version: baseline.version_label.clone(),
    baseline_timestamp: baseline.timestamp,
    direction: direction(delta_pct, noise_threshold_pct),
    delta_bytes,
    delta_count,
    delta_pct,
    category_deltas,
    new_signatures: current
      .leak_signatures
      .difference(&baseline.leak_signatures)
      .cloned()
      .collect(),
    resolved_signatures: baseline
      .leak_signatures
      .difference(&current.leak_signatures)
      .cloned()
      .collect(),
    regression_score,
  }
}

/// Which verdict facts count as a regression. Every check is opt-in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionPolicy {
  pub fail_on_regressing_direction: bool,
  pub fail_on_high_increase: bool,
  pub max_new_signatures: Option<usize>,
  pub max_delta_bytes: Option<i64>,
  pub max_regression_score: Option<f64>,
}

impl RegressionPolicy {
  /// Fails on a regressing direction or any new HIGH leak.
  pub fn strict() -> Self {
    Self {
      fail_on_regressing_direction: true,
      fail_on_high_increase: true,
      ..Self::default()
    }
  }

  pub fn evaluate(&self, verdict: &TrendVerdict) -> RegressionCheck {
    let mut reasons = Vec::new();

    if self.fail_on_regressing_direction && verdict.direction == Direction::Regressing {
      reasons.push(format!(
        "leaked bytes regressed by {:+.1}% ({:+} bytes) against {}",
        verdict.delta_pct, verdict.delta_bytes, verdict.baseline_session_id
      ));
    }
    if self.fail_on_high_increase && verdict.category_deltas.high > 0 {
      reasons.push(format!(
        "{} more HIGH-impact leak(s)",
        verdict.category_deltas.high
      ));
    }
    if let Some(max) = self.max_new_signatures {
      if verdict.new_signatures.len() > max {
        reasons.push(format!(
          "{} new leak signature(s), limit {}",
          verdict.new_signatures.len(),
          max
        ));
      }
    }
    if let Some(max) = self.max_delta_bytes {
      if verdict.delta_bytes > max {
        reasons.push(format!("{:+} bytes exceeds limit {}", verdict.delta_bytes, max));
      }
    }
    if let Some(max) = self.max_regression_score {
      if verdict.regression_score > max {
        reasons.push(format!(
          "regression score {:.3} exceeds limit {:.3}",
          verdict.regression_score, max
        ));
      }
    }

    RegressionCheck {
      regressed: !reasons.is_empty(),
      reasons,
    }
  }
}

/// Aggregate view of a stretch of history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
  pub analysis_count: usize,
  /// Sign of the leak-count change from first to last entry.
  pub direction: Direction,
  pub total_change: i64,
  pub bytes_change: i64,
  pub avg_daily_change: f64,
  pub peak_leaks: u64,
  pub min_leaks: u64,
  pub first_timestamp: DateTime<Utc>,
  pub latest_timestamp: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub latest_version: Option<String>,
}

pub struct TrendHistory;

impl TrendHistory {
  /// Summarize entries in canonical order. `None` for an empty history.
  pub fn summarize(entries: &[TrendEntry]) -> Option<HistorySummary> {
    let first = entries.first()?;
    let last = entries.last()?;

    let total_change = signed_delta(last.summary.total_leaks, first.summary.total_leaks);
    let bytes_change = signed_delta(last.summary.total_bytes, first.summary.total_bytes);
    let avg_daily_change = if entries.len() > 1 {
      let days = (last.timestamp - first.timestamp).num_days().max(1);
      total_change as f64 / days as f64
    } else {
      0.0
    };
    let direction = match total_change {
      n if n > 0 => Direction::Regressing,
      n if n < 0 => Direction::Improving,
      _ => Direction::Stable,
    };

    Some(HistorySummary {
      analysis_count: entries.len(),
      direction,
      total_change,
      bytes_change,
      avg_daily_change,
      peak_leaks: entries.iter().map(|e| e.summary.total_leaks).max().unwrap_or(0),
      min_leaks: entries.iter().map(|e| e.summary.total_leaks).min().unwrap_or(0),
      first_timestamp: first.timestamp,
      latest_timestamp: last.timestamp,
      latest_version: last.version_label.clone(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::trend::tests::entry;
  use crate::types::Signature;
  use chrono::Duration;

  fn with(
    id: &str,
    hour: u32,
    leaks: u64,
    bytes: u64,
    high: u64,
    sigs: &[&str],
  ) -> TrendEntry {
    let mut e = entry(id, hour, None);
    e.summary.total_leaks = leaks;
    e.summary.total_bytes = bytes;
    e.summary.by_category.high = high;
    e.leak_signatures = sigs.iter().map(|s| Signature(s.to_string())).collect();
    e
  }

  #[test]
  fn new_and_resolved_signatures() {
    let base = with("base", 1, 3, 300, 1, &["a", "b", "c"]);
    let cur = with("cur", 2, 3, 300, 1, &["b", "c", "d"]);
    let v = compare(&cur, &base, 5.0);
    assert_eq!(v.new_signatures.len(), 1);
    assert!(v.new_signatures.contains(&Signature("d".into())));
    assert!(v.resolved_signatures.contains(&Signature("a".into())));
    assert_eq!(v.direction, Direction::Stable);
    assert_eq!(v.delta_count, 0);
  }

  #[test]
  fn delta_is_antisymmetric() {
    let a = with("a", 1, 4, 1000, 2, &["x", "y"]);
    let b = with("b", 2, 1, 250, 0, &["y", "z"]);
    let ab = compare(&a, &b, 5.0);
    let ba = compare(&b, &a, 5.0);
    assert_eq!(ab.delta_bytes, -ba.delta_bytes);
    assert_eq!(ab.delta_count, -ba.delta_count);
    assert_eq!(ab.category_deltas.high, -ba.category_deltas.high);
    assert_eq!(ab.new_signatures, ba.resolved_signatures);
    assert_eq!(ab.direction, Direction::Regressing);
    assert_eq!(ba.direction, Direction::Improving);
  }

  #[test]
  fn noise_band_and_zero_baseline() {
    assert_eq!(direction(4.9, 5.0), Direction::Stable);
    assert_eq!(direction(-5.0, 5.0), Direction::Improving);
    assert_eq!(direction(0.0, 0.0), Direction::Stable);

    let empty = with("base", 1, 0, 0, 0, &[]);
    let cur = with("cur", 2, 1, 64, 1, &["s"]);
    let v = compare(&cur, &empty, 5.0);
    assert!((v.delta_pct - 6400.0).abs() < 1e-9);
    assert_eq!(v.direction, Direction::Regressing);
    assert_eq!(v.regression_score, 0.0);
  }

  #[test]
  fn regression_score_weights() {
    let base = with("base", 1, 10, 1000, 1, &[]);
    let cur = with("cur", 2, 15, 1500, 3, &[]);
    let v = compare(&cur, &base, 5.0);
    // 0.5 * 0.4 + 0.5 * 0.3 + 2 * 0.3
    assert!((v.regression_score - 0.95).abs() < 1e-9);
  }

  #[test]
  fn policy_reasons() {
    let base = with("base", 1, 1, 100, 0, &["a"]);
    let cur = with("cur", 2, 3, 400, 2, &["a", "b", "c"]);
    let v = compare(&cur, &base, 5.0);

    assert!(!RegressionPolicy::default().evaluate(&v).regressed);

    let check = RegressionPolicy::strict().evaluate(&v);
    assert!(check.regressed);
    assert_eq!(check.reasons.len(), 2);

    let limits = RegressionPolicy {
      max_new_signatures: Some(2),
      max_delta_bytes: Some(1000),
      max_regression_score: Some(10.0),
      ..RegressionPolicy::default()
    };
    assert!(!limits.evaluate(&v).regressed);
    let tight = RegressionPolicy {
      max_new_signatures: Some(1),
      ..RegressionPolicy::default()
    };
    assert!(tight.evaluate(&v).reasons[0].contains("2 new leak signature"));
  }

  #[test]
  fn history_summary() {
    assert!(TrendHistory::summarize(&[]).is_none());

    let mut first = with("a", 0, 10, 100, 0, &[]);
    let mut last = with("b", 0, 4, 40, 0, &[]);
    let peak = with("p", 1, 12, 120, 0, &[]);
    last.timestamp = first.timestamp + Duration::days(3);
    last.version_label = Some("v3".into());
    first.version_label = Some("v1".into());

    let s = TrendHistory::summarize(&[first, peak, last]).unwrap();
    assert_eq!(s.analysis_count, 3);
    assert_eq!(s.direction, Direction::Improving);
    assert_eq!(s.total_change, -6);
    assert_eq!(s.bytes_change, -60);
    assert!((s.avg_daily_change + 2.0).abs() < 1e-9);
    assert_eq!(s.peak_leaks, 12);
    assert_eq!(s.min_leaks, 4);
    assert_eq!(s.latest_version.as_deref(), Some("v3"));
  }
}
