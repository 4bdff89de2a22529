//! Impact scoring: five normalized factors, a weighted sum, a category.
//!
//! Scoring is a pure function of one record and the config, so a leak set
//! can be scored in any order (or in parallel) with the same result.

use rayon::prelude::*;

use crate::config::{Config, SizeThresholds};
use crate::patterns::{FramePatterns, LocationClass};
use crate::types::*;

pub fn severity_factor(severity: Severity) -> f64 {
  match severity {
    Severity::High => 1.0,
    Severity::MediumHigh => 0.66,
    Severity::Medium => 0.33,
    Severity::Low => 0.1,
  }
}

pub fn kind_factor(kind: &LeakKind) -> f64 {
  match kind {
    LeakKind::BufferOverflow | LeakKind::UseAfterFree | LeakKind::DoubleFree => 1.0,
    LeakKind::UninitializedRead => 0.7,
    LeakKind::DefinitelyLost => 0.6,
    LeakKind::PossiblyLost => 0.4,
    LeakKind::IndirectlyLost => 0.35,
    LeakKind::Other(_) => 0.3,
    LeakKind::StillReachable => 0.1,
  }
}

fn lerp(lo: f64, hi: f64, pos: u64, start: u64, end: u64) -> f64 {
  let span = end.saturating_sub(start).max(1) as f64;
  lo + (hi - lo) * (pos.saturating_sub(start) as f64 / span)
}

/// Piecewise-linear in bytes, saturating at `large`.
pub fn size_factor(bytes: u64, t: &SizeThresholds) -> f64 {
  if bytes == 0 {
    0.0
  } else if bytes < t.small {
    lerp(0.0, 0.33, bytes, 0, t.small)
  } else if bytes < t.medium {
    lerp(0.33, 0.66, bytes, t.small, t.medium)
  } else if bytes < t.large {
    lerp(0.66, 1.0, bytes, t.medium, t.large)
  } else {
    1.0
  }
}

/// Logarithmic in occurrences; reaches 1.0 at `saturation`.
pub fn frequency_factor(occurrences: u64, saturation: u64) -> f64 {
  let value = (1.0 + occurrences as f64).ln() / (1.0 + saturation.max(1) as f64).ln();
  value.clamp(0.0, 1.0)
}

fn category_for(score: f64, config: &Config) -> Category {
  let t = &config.category_thresholds;
  if score >= t.high {
    Category::High
  } else if score >= t.medium {
    Category::Medium
  } else {
    Category::Low
  }
}

/// Scores records against one config and its compiled patterns.
#[derive(Debug, Clone, Copy)]
pub struct Scorer<'a> {
  config: &'a Config,
  patterns: &'a FramePatterns,
}

impl<'a> Scorer<'a> {
  pub fn new(config: &'a Config, patterns: &'a FramePatterns) -> Self {
    Self { config, patterns }
  }

  fn location(&self, record: &LeakRecord) -> (f64, LocationClass) {
    let scores = &self.config.location_scores;
    let class = record
      .primary_location
      .as_ref()
      .map(|f| self.patterns.classify_location(f))
      .unwrap_or(LocationClass::Uncategorized);
    let value = match class {
      LocationClass::Core => scores.core,
      LocationClass::Peripheral => scores.peripheral,
      LocationClass::Uncategorized => scores.default,
    };
    (value, class)
  }

  pub fn score(&self, record: &LeakRecord) -> ImpactScore {
    let w = &self.config.scoring_weights;
    let (location_value, class) = self.location(record);

    let breakdown = ScoreBreakdown {
      severity: FactorScore::new(severity_factor(record.severity), w.severity),
      size: FactorScore::new(
        size_factor(record.size_bytes, &self.config.size_thresholds),
        w.size,
      ),
      frequency: FactorScore::new(
        frequency_factor(record.occurrence_count, self.config.frequency_saturation),
        w.frequency,
      ),
      location: FactorScore::new(location_value, w.location),
      kind: FactorScore::new(kind_factor(&record.kind), w.kind),
    };

    let score = (breakdown.severity.contribution
      + breakdown.size.contribution
      + breakdown.frequency.contribution
      + breakdown.location.contribution
      + breakdown.kind.contribution)
      .clamp(0.0, 1.0);

    ImpactScore {
      score,
      category: category_for(score, self.config),
      reasons: self.reasons(record, class),
      breakdown,
    }
  }

  fn reasons(&self, record: &LeakRecord, class: LocationClass) -> Vec<String> {
    let mut reasons = Vec::new();
    if record.kind.is_memory_safety() {
      reasons.push(format!("memory-safety violation ({})", record.kind));
    } else if record.severity >= Severity::MediumHigh {
      reasons.push(format!("high-severity defect ({})", record.kind));
    }

    let t = &self.config.size_thresholds;
    if record.size_bytes >= t.large {
      reasons.push(format!("large allocation: {} bytes", record.size_bytes));
    } else if record.size_bytes >= t.medium {
      reasons.push(format!("sizeable allocation: {} bytes", record.size_bytes));
    }

    if record.occurrence_count >= self.config.frequency_saturation {
      reasons.push(format!("pervasive: seen {} times", record.occurrence_count));
    } else if record.occurrence_count > 1 {
      reasons.push(format!("recurring: seen {} times", record.occurrence_count));
    }

    match class {
      LocationClass::Core => reasons.push(format!(
        "in core code: {}",
        record.primary_location_label()
      )),
      LocationClass::Peripheral => reasons.push("in test or peripheral code".to_string()),
      LocationClass::Uncategorized => {}
    }
    reasons
  }

  /// Score every record on the current rayon pool. Output order matches input.
  pub fn score_all(&self, records: Vec<LeakRecord>) -> Vec<ScoredLeak> {
    records
      .into_par_iter()
      .map(|leak| {
        let impact = self.score(&leak);
        ScoredLeak { leak, impact }
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fingerprint;

  fn record(kind: LeakKind, size: u64, count: u64, file: &str) -> LeakRecord {
    let frames = vec![StackFrame {
      function: "f".into(),
      file: Some(file.into()),
      line: Some(3),
      module: None,
      address: None,
    }];
    LeakRecord {
      severity: kind.severity(),
      signature: fingerprint::compute(&kind, &frames, 5),
      kind,
      size_bytes: size,
      block_count: 1,
      occurrence_count: count,
      primary_location: frames.first().cloned(),
      stack_frames: frames,
      source_format: SourceFormat::Sanitizer,
      raw_message: String::new(),
      source_file: None,
    }
  }

  fn with_scorer<T>(f: impl FnOnce(Scorer<'_>) -> T) -> T {
    let config = Config::default();
    let patterns = FramePatterns::compile(&config).unwrap();
    f(Scorer::new(&config, &patterns))
  }

  #[test]
  fn size_factor_is_piecewise_and_saturates() {
    let t = SizeThresholds::default();
    assert_eq!(size_factor(0, &t), 0.0);
    assert!((size_factor(256, &t) - 0.33).abs() < 1e-9);
    assert!((size_factor(4096, &t) - 0.66).abs() < 1e-9);
    assert_eq!(size_factor(65_536, &t), 1.0);
    assert_eq!(size_factor(u64::MAX, &t), 1.0);
    assert!(size_factor(128, &t) < size_factor(129, &t));
  }

  #[test]
  fn frequency_factor_saturates() {
    assert!((frequency_factor(50, 50) - 1.0).abs() < 1e-9);
    assert_eq!(frequency_factor(500, 50), 1.0);
    assert!(frequency_factor(1, 50) < frequency_factor(2, 50));
  }

  #[test]
  fn repeated_overflow_in_core_code_is_high() {
    with_scorer(|s| {
      let impact = s.score(&record(LeakKind::BufferOverflow, 64, 20, "src/core/table.c"));
      assert!(impact.score > 0.75 && impact.score < 0.8, "{}", impact.score);
      assert_eq!(impact.category, Category::High);
      assert!(impact.reasons.iter().any(|r| r.contains("memory-safety")));
      assert!(impact.reasons.iter().any(|r| r.contains("core code")));
    });
  }

  #[test]
  fn still_reachable_in_tests_is_low() {
    with_scorer(|s| {
      let impact = s.score(&record(LeakKind::StillReachable, 32, 1, "tests/fixture.c"));
      assert_eq!(impact.category, Category::Low);
      assert!((impact.breakdown.location.value - 0.2).abs() < 1e-9);
    });
  }

  #[test]
  fn breakdown_sums_to_score() {
    with_scorer(|s| {
      let impact = s.score(&record(LeakKind::PossiblyLost, 1000, 3, "src/net/io.c"));
      let b = impact.breakdown;
      let sum = b.severity.contribution
        + b.size.contribution
        + b.frequency.contribution
        + b.location.contribution
        + b.kind.contribution;
      assert!((sum - impact.score).abs() < 1e-9);
      assert!((b.location.value - 0.5).abs() < 1e-9);
    });
  }

  #[test]
  fn monotonic_in_size_and_count() {
    with_scorer(|s| {
      for kind in [LeakKind::DefinitelyLost, LeakKind::UseAfterFree, LeakKind::StillReachable] {
        let mut prev = 0.0;
        for size in [0, 1, 255, 256, 1000, 4096, 20_000, 65_536, 1 << 30] {
          let score = s.score(&record(kind.clone(), size, 1, "src/a.c")).score;
          assert!(score >= prev);
          prev = score;
        }
        let mut prev = 0.0;
        for count in [1, 2, 5, 10, 50, 1000] {
          let score = s.score(&record(kind.clone(), 64, count, "src/a.c")).score;
          assert!(score >= prev);
          prev = score;
        }
      }
    });
  }

  #[test]
  fn score_all_preserves_order_and_is_order_independent() {
    with_scorer(|s| {
      let records = vec![
        record(LeakKind::DefinitelyLost, 10, 1, "src/a.c"),
        record(LeakKind::UseAfterFree, 64, 4, "src/core/b.c"),
        record(LeakKind::IndirectlyLost, 5000, 2, "tests/c.c"),
      ];
      let forward = s.score_all(records.clone());
      let mut reversed_input = records.clone();
      reversed_input.reverse();
      let mut backward = s.score_all(reversed_input);
      backward.reverse();
      for (i, scored) in forward.iter().enumerate() {
        assert_eq!(scored.leak, records[i]);
      }
      assert_eq!(forward, backward);
    });
  }
}
