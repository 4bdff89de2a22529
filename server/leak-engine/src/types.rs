//! Core types for the leak engine (raw parser shapes, canonical records, output contracts).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ---------------------------------------------------------------------------
// Source formats
// ---------------------------------------------------------------------------

/// Which tool dialect a record was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
  Valgrind,
  Sanitizer,
}

// ---------------------------------------------------------------------------
// Leak kind + severity (normalized)
// ---------------------------------------------------------------------------

/// Defect kind. `Other` keeps the tool's own label so the tag stays open.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LeakKind {
  DefinitelyLost,
  IndirectlyLost,
  PossiblyLost,
  StillReachable,
  BufferOverflow,
  UseAfterFree,
  DoubleFree,
  UninitializedRead,
  Other(String),
}

impl LeakKind {
  /// Stable snake_case label (used in signatures and serialized output).
  pub fn label(&self) -> &str {
    match self {
      Self::DefinitelyLost => "definitely_lost",
      Self::IndirectlyLost => "indirectly_lost",
      Self::PossiblyLost => "possibly_lost",
      Self::StillReachable => "still_reachable",
      Self::BufferOverflow => "buffer_overflow",
      Self::UseAfterFree => "use_after_free",
      Self::DoubleFree => "double_free",
      Self::UninitializedRead => "uninitialized_read",
      Self::Other(label) if label.is_empty() => "other",
      Self::Other(label) => label,
    }
  }

  pub fn from_label(s: &str) -> Self {
    match s {
      "definitely_lost" => Self::DefinitelyLost,
      "indirectly_lost" => Self::IndirectlyLost,
      "possibly_lost" => Self::PossiblyLost,
      "still_reachable" => Self::StillReachable,
      "buffer_overflow" => Self::BufferOverflow,
      "use_after_free" => Self::UseAfterFree,
      "double_free" => Self::DoubleFree,
      "uninitialized_read" => Self::UninitializedRead,
      "other" => Self::Other(String::new()),
      other => Self::Other(other.to_string()),
    }
  }

  /// Memory-safety violations, as opposed to unreachable-memory leaks.
  pub fn is_memory_safety(&self) -> bool {
    matches!(self, Self::BufferOverflow | Self::UseAfterFree | Self::DoubleFree)
  }

  pub fn severity(&self) -> Severity {
    match self {
      Self::DefinitelyLost | Self::BufferOverflow | Self::UseAfterFree | Self::DoubleFree => {
        Severity::High
      }
      Self::UninitializedRead => Severity::MediumHigh,
      Self::PossiblyLost => Severity::Medium,
      Self::IndirectlyLost | Self::StillReachable | Self::Other(_) => Severity::Low,
    }
  }
}

impl fmt::Display for LeakKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.label())
  }
}

impl Serialize for LeakKind {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.label())
  }
}

impl<'de> Deserialize<'de> for LeakKind {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    Ok(Self::from_label(&s))
  }
}

/// Ordinal severity derived from the kind. Declaration order is the ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
  Low,
  Medium,
  MediumHigh,
  High,
}

// ---------------------------------------------------------------------------
// Raw parser output (format-specific shapes)
// ---------------------------------------------------------------------------

/// One frame exactly as the tool printed it, before path normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame {
  pub function: Option<String>,
  pub file: Option<String>,
  pub line: Option<u32>,
  pub module: Option<String>,
  pub address: Option<String>,
}

/// One `<error>` node from a Valgrind XML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValgrindError {
  /// Valgrind's `<unique>` id (hex string), when present.
  pub unique: Option<String>,
  /// Raw `<kind>` text, e.g. `Leak_DefinitelyLost`.
  pub kind_label: String,
  pub kind: LeakKind,
  pub message: String,
  pub leaked_bytes: u64,
  pub leaked_blocks: u64,
  pub frames: Vec<RawFrame>,
}

/// One defect block from a sanitizer text log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizerReport {
  /// The header line, trimmed.
  pub header: String,
  /// Bug type as printed, e.g. `heap-buffer-overflow` or `Direct leak`.
  pub bug_type: String,
  pub kind: LeakKind,
  pub address: Option<String>,
  /// Bytes from `N byte(s)` (leaks) or `READ|WRITE of size N` (errors).
  pub size: Option<u64>,
  /// Size of the affected region from `... of N-byte region`.
  pub region_size: Option<u64>,
  pub objects: Option<u64>,
  pub frames: Vec<RawFrame>,
  /// 1-based line number of the header.
  pub line: usize,
}

/// A raw entry in the shape of the dialect it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEntry {
  Valgrind(ValgrindError),
  Sanitizer(SanitizerReport),
}

/// Non-fatal parse problem (skipped entry, unknown kind, unparseable frame).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub line: Option<usize>,
  pub message: String,
}

impl ParseWarning {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      line: None,
      message: message.into(),
    }
  }

  pub fn at_line(line: usize, message: impl Into<String>) -> Self {
    Self {
      line: Some(line),
      message: message.into(),
    }
  }
}

/// Counters a parser keeps alongside its entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
  /// Defect blocks/nodes seen (emitted + skipped).
  pub seen: usize,
  /// Entries dropped because they were malformed.
  pub skipped: usize,
  /// Non-leak nodes or preamble/summary lines recognized and excluded.
  pub ignored: usize,
  /// Valgrind errors carrying a `<suppression>` block that were dropped.
  pub suppressed: usize,
}

// ---------------------------------------------------------------------------
// Canonical leak records
// ---------------------------------------------------------------------------

/// Normalized frame. Frames keep the order the tool reported them in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
  pub function: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub file: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub line: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub module: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
}

impl fmt::Display for StackFrame {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let function = if self.function.is_empty() {
      "???"
    } else {
      self.function.as_str()
    };
    match (&self.file, self.line, &self.module) {
      (Some(file), Some(line), _) => write!(f, "{} ({}:{})", function, file, line),
      (Some(file), None, _) => write!(f, "{} ({})", function, file),
      (None, _, Some(module)) => write!(f, "{} ({})", function, module),
      (None, _, None) => f.write_str(function),
    }
  }
}

/// A stable hex string identifying one logical leak.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Signature(pub String);

impl fmt::Display for Signature {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Canonical leak record after normalization (and, after cleanup, merging).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakRecord {
  pub kind: LeakKind,
  pub severity: Severity,
  pub size_bytes: u64,
  pub block_count: u64,
  pub occurrence_count: u64,
  pub stack_frames: Vec<StackFrame>,
  pub primary_location: Option<StackFrame>,
  pub signature: Signature,
  pub source_format: SourceFormat,
  pub raw_message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source_file: Option<String>,
}

impl LeakRecord {
  pub fn primary_location_label(&self) -> String {
    self
      .primary_location
      .as_ref()
      .map(|f| f.to_string())
      .unwrap_or_else(|| "Unknown".to_string())
  }
}

// ---------------------------------------------------------------------------
// Cleanup
// ---------------------------------------------------------------------------

/// What cleanup removed and merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
  pub input_records: usize,
  pub input_bytes: u64,
  /// Records whose every frame is a system frame.
  pub noise_removed: usize,
  /// Records dropped by the optional size/kind/empty-stack filters.
  pub filtered_removed: usize,
  /// Records folded into an earlier record with the same signature.
  pub merged_away: usize,
  pub output_records: usize,
  pub output_bytes: u64,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
  Low,
  Medium,
  High,
}

/// One factor's normalized value, its weight, and the weighted contribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
  pub value: f64,
  pub weight: f64,
  pub contribution: f64,
}

impl FactorScore {
  pub fn new(value: f64, weight: f64) -> Self {
    Self {
      value,
      weight,
      contribution: value * weight,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
  pub severity: FactorScore,
  pub size: FactorScore,
  pub frequency: FactorScore,
  pub location: FactorScore,
  pub kind: FactorScore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactScore {
  pub score: f64,
  pub category: Category,
  pub breakdown: ScoreBreakdown,
  pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredLeak {
  pub leak: LeakRecord,
  pub impact: ImpactScore,
}

// ---------------------------------------------------------------------------
// Session summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
  pub high: u64,
  pub medium: u64,
  pub low: u64,
}

impl CategoryCounts {
  pub fn get(&self, category: Category) -> u64 {
    match category {
      Category::High => self.high,
      Category::Medium => self.medium,
      Category::Low => self.low,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStats {
  pub count: u64,
  pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationCount {
  pub location: String,
  pub occurrences: u64,
}

/// Per-session aggregate; the same shape is persisted in the trend store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
  pub total_leaks: u64,
  pub total_occurrences: u64,
  pub total_bytes: u64,
  pub by_category: CategoryCounts,
  #[serde(default)]
  pub by_kind: BTreeMap<String, KindStats>,
  #[serde(default)]
  pub top_locations: Vec<LocationCount>,
}

// ---------------------------------------------------------------------------
// Trend store + verdict
// ---------------------------------------------------------------------------

/// One append-only historical record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendEntry {
  pub session_id: String,
  pub timestamp: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version_label: Option<String>,
  pub summary: SessionSummary,
  pub leak_signatures: BTreeSet<Signature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
  Improving,
  Stable,
  Regressing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDeltas {
  pub high: i64,
  pub medium: i64,
  pub low: i64,
}

/// Comparison of one session against a baseline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendVerdict {
  pub baseline_session_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub baseline_version: Option<String>,
  pub baseline_timestamp: DateTime<Utc>,
  pub direction: Direction,
  pub delta_bytes: i64,
  pub delta_count: i64,
  pub delta_pct: f64,
  pub category_deltas: CategoryDeltas,
  pub new_signatures: BTreeSet<Signature>,
  pub resolved_signatures: BTreeSet<Signature>,
  pub regression_score: f64,
}

/// Pass/fail facts for the orchestration layer. The engine never exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegressionCheck {
  pub regressed: bool,
  pub reasons: Vec<String>,
}

// ---------------------------------------------------------------------------
// Session output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
  Parse,
  Storage,
  /// Trend history was not recorded or had no usable baseline.
  Trend,
}

/// Non-fatal problem surfaced on the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWarning {
  pub kind: WarningKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub line: Option<usize>,
  pub message: String,
}

/// Result of one engine run; what the reporting layer consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSession {
  pub session_id: String,
  pub timestamp: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version_label: Option<String>,
  pub source_files: Vec<String>,
  /// Ranked by score descending, then signature ascending.
  pub leaks: Vec<ScoredLeak>,
  pub summary: SessionSummary,
  pub cleanup: CleanupStats,
  pub warnings: Vec<SessionWarning>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub trend_verdict: Option<TrendVerdict>,
}

/// Row-per-leak shape the HTML/CSV generators depend on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakRow {
  pub signature: String,
  pub kind: String,
  pub severity: Severity,
  pub size_bytes: u64,
  pub occurrence_count: u64,
  pub primary_location: String,
  pub score: f64,
  pub category: Category,
  pub stack_frames: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub trend_direction: Option<Direction>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub is_new: Option<bool>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn severity_by_kind() {
    let cases = [
      (LeakKind::DefinitelyLost, Severity::High),
      (LeakKind::BufferOverflow, Severity::High),
      (LeakKind::UseAfterFree, Severity::High),
      (LeakKind::DoubleFree, Severity::High),
      (LeakKind::UninitializedRead, Severity::MediumHigh),
      (LeakKind::PossiblyLost, Severity::Medium),
      (LeakKind::IndirectlyLost, Severity::Low),
      (LeakKind::StillReachable, Severity::Low),
      (LeakKind::Other("SEGV".into()), Severity::Low),
    ];
    for (kind, expected) in cases {
      assert_eq!(kind.severity(), expected, "{}", kind);
    }
  }
}
