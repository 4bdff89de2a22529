//! Noise filtering and signature-based deduplication.

use std::collections::HashMap;

use tracing::debug;

use crate::config::CleanupOptions;
use crate::patterns::FramePatterns;
use crate::types::{CleanupStats, LeakKind, LeakRecord, Signature};

/// A cleaned leak set plus what happened to the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOutcome {
  /// Unique by signature; ordered by severity desc, size desc, signature asc.
  pub leaks: Vec<LeakRecord>,
  pub stats: CleanupStats,
}

fn dropped_by_filters(record: &LeakRecord, options: &CleanupOptions) -> bool {
  (options.min_leak_size > 0 && record.size_bytes < options.min_leak_size)
    || (options.drop_still_reachable && record.kind == LeakKind::StillReachable)
    || (options.drop_empty_stacks && record.stack_frames.is_empty())
}

/// Fold `other` into `into`: counts add up, the richer stack wins.
fn absorb(into: &mut LeakRecord, other: LeakRecord) {
  into.occurrence_count = into.occurrence_count.saturating_add(other.occurrence_count);
  into.block_count = into.block_count.saturating_add(other.block_count);
  if other.stack_frames.len() > into.stack_frames.len() {
    into.stack_frames = other.stack_frames;
    into.primary_location = other.primary_location;
  }
}

fn total_bytes<'a>(records: impl IntoIterator<Item = &'a LeakRecord>) -> u64 {
  records
    .into_iter()
    .fold(0u64, |acc, r| acc.saturating_add(r.size_bytes))
}

/// Remove all-system records, apply the optional filters, merge by signature
/// and sort. Applying it to its own output changes nothing.
pub fn cleanup(
  records: Vec<LeakRecord>,
  patterns: &FramePatterns,
  options: &CleanupOptions,
) -> CleanupOutcome {
  let mut stats = CleanupStats {
    input_records: records.len(),
    input_bytes: total_bytes(&records),
    ..CleanupStats::default()
  };

  let mut merged: Vec<LeakRecord> = Vec::new();
  let mut index: HashMap<Signature, usize> = HashMap::new();

  for record in records {
    if patterns.is_all_system(&record.stack_frames) {
      stats.noise_removed += 1;
      continue;
    }
    if dropped_by_filters(&record, options) {
      stats.filtered_removed += 1;
      continue;
    }
    match index.get(&record.signature) {
      Some(&at) => {
        absorb(&mut merged[at], record);
        stats.merged_away += 1;
      }
      None => {
        index.insert(record.signature.clone(), merged.len());
        merged.push(record);
      }
    }
  }

  merged.sort_by(|a, b| {
    b.severity
      .cmp(&a.severity)
      .then_with(|| b.size_bytes.cmp(&a.size_bytes))
      .then_with(|| a.signature.cmp(&b.signature))
  });

  stats.output_records = merged.len();
  stats.output_bytes = total_bytes(&merged);
  debug!(
    input = stats.input_records,
    noise = stats.noise_removed,
    filtered = stats.filtered_removed,
    merged = stats.merged_away,
    output = stats.output_records,
    "cleanup done"
  );

  CleanupOutcome {
    leaks: merged,
    stats,
  }
}
