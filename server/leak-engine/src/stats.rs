//! Session summary aggregation: totals, per-category and per-kind counts, hot locations.

use std::collections::HashMap;

use crate::types::{Category, LocationCount, ScoredLeak, SessionSummary};

/// Locations kept in `SessionSummary::top_locations`.
pub const TOP_LOCATIONS: usize = 10;

pub fn summarize(leaks: &[ScoredLeak]) -> SessionSummary {
  let mut summary = SessionSummary::default();
  let mut locations: HashMap<String, u64> = HashMap::new();

  for scored in leaks {
    let leak = &scored.leak;
    summary.total_leaks += 1;
    // Byte and occurrence totals saturate rather than wrap.
    summary.total_occurrences = summary.total_occurrences.saturating_add(leak.occurrence_count);
    summary.total_bytes = summary.total_bytes.saturating_add(leak.size_bytes);

    match scored.impact.category {
      Category::High => summary.by_category.high += 1,
      Category::Medium => summary.by_category.medium += 1,
      Category::Low => summary.by_category.low += 1,
    }

    let kind = summary.by_kind.entry(leak.kind.label().to_string()).or_default();
    kind.count += 1;
    kind.bytes = kind.bytes.saturating_add(leak.size_bytes);

    if leak.primary_location.is_some() {
      let seen = locations.entry(leak.primary_location_label()).or_insert(0);
      *seen = seen.saturating_add(leak.occurrence_count);
    }
  }

  let mut top: Vec<LocationCount> = locations
    .into_iter()
    .map(|(location, occurrences)| LocationCount {
      location,
      occurrences,
    })
    .collect();
  // Ties broken by label so the summary is deterministic.
  top.sort_by(|a, b| {
    b.occurrences
      .cmp(&a.occurrences)
      .then_with(|| a.location.cmp(&b.location))
  });
  top.truncate(TOP_LOCATIONS);
  summary.top_locations = top;

  summary
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::*;

  fn scored(kind: LeakKind, size: u64, count: u64, category: Category, func: &str) -> ScoredLeak {
    let frame = StackFrame {
      function: func.into(),
      file: Some("src/a.c".into()),
      line: Some(1),
      module: None,
      address: None,
    };
    let factor = FactorScore::new(0.5, 0.2);
    ScoredLeak {
      leak: LeakRecord {
        severity: kind.severity(),
        kind,
        size_bytes: size,
        block_count: 1,
        occurrence_count: count,
        stack_frames: vec![frame.clone()],
        primary_location: Some(frame),
        signature: Signature(format!("{}-{}", func, size)),
        source_format: SourceFormat::Valgrind,
        raw_message: String::new(),
        source_file: None,
      },
      impact: ImpactScore {
        score: 0.5,
        category,
        breakdown: ScoreBreakdown {
          severity: factor,
          size: factor,
          frequency: factor,
          location: factor,
          kind: factor,
        },
        reasons: vec![],
      },
    }
  }

  #[test]
  fn totals_and_breakdowns() {
    let leaks = vec![
      scored(LeakKind::DefinitelyLost, 100, 2, Category::High, "a"),
      scored(LeakKind::DefinitelyLost, 50, 1, Category::Medium, "b"),
      scored(LeakKind::StillReachable, 10, 5, Category::Low, "c"),
    ];
    let s = summarize(&leaks);
    assert_eq!(s.total_leaks, 3);
    assert_eq!(s.total_occurrences, 8);
    assert_eq!(s.total_bytes, 160);
    assert_eq!(s.by_category.get(Category::High), 1);
    assert_eq!(s.by_category.get(Category::Low), 1);
    assert_eq!(s.by_kind["definitely_lost"], KindStats { count: 2, bytes: 150 });
    assert!(!s.by_kind.contains_key("double_free"));
    assert_eq!(s.top_locations[0].location, "c (src/a.c:1)");
    assert_eq!(s.top_locations[0].occurrences, 5);
  }

  #[test]
  fn top_locations_capped() {
    let leaks: Vec<_> = (0..15)
      .map(|i| scored(LeakKind::PossiblyLost, 8, 1, Category::Low, &format!("f{:02}", i)))
      .collect();
    let s = summarize(&leaks);
    assert_eq!(s.top_locations.len(), TOP_LOCATIONS);
    assert_eq!(s.top_locations[0].location, "f00 (src/a.c:1)");
  }

  #[test]
  fn huge_sizes_saturate() {
    let leaks = vec![
      scored(LeakKind::DefinitelyLost, u64::MAX, u64::MAX, Category::High, "a"),
      scored(LeakKind::DefinitelyLost, u64::MAX, 1, Category::High, "a"),
    ];
    let s = summarize(&leaks);
    assert_eq!(s.total_bytes, u64::MAX);
    assert_eq!(s.total_occurrences, u64::MAX);
    assert_eq!(s.by_kind["definitely_lost"].bytes, u64::MAX);
    assert_eq!(s.top_locations[0].occurrences, u64::MAX);
  }

  #[test]
  fn empty_summary() {
    assert_eq!(summarize(&[]), SessionSummary::default());
  }
}
