//! Engine configuration with sane defaults, TOML loading and one-shot validation.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Default system/runtime frame patterns: C runtime, loader, allocator
/// internals, and the profilers' own instrumentation.
pub const DEFAULT_SYSTEM_LIBRARY_PATTERNS: &[&str] = &[
  r"^/lib(32|64)?/",
  r"^/usr/lib(32|64)?/",
  r"^/usr/libexec/valgrind/",
  r"(^|/)libc[.-]",
  r"(^|/)ld-linux",
  r"(^|/)ld\.so",
  r"(^|/)libpthread",
  r"(^|/)libdl[.-]",
  r"(^|/)libm[.-]",
  r"(^|/)libgcc_s",
  r"(^|/)libstdc\+\+",
  r"(^|/)glibc-[^/]+/",
  r"(^|/)sysdeps/",
  r"(^|/)csu/",
  r"(^|/)dl-[a-z-]+\.c$",
  r"(^|/)vg_replace_malloc\.c$",
  r"(^|/)vgpreload_",
  r"(^|/)valgrind/",
  r"(^|/)lib(a|l|m|t|ub)san[.-]",
  r"(^|/)libclang_rt\.",
  r"(^|/)compiler-rt/",
  r"(^|/)sanitizer_common/",
  r"(^|/)asan_[a-z_]+\.(c|cc|cpp)$",
  r"^/System/Library/",
  r"^/usr/lib/system/",
  r"(^|/)libsystem_",
  r"(^|/)libobjc\.",
  r"(^|/)CoreFoundation",
  r"(^|/)libX11\.so",
  r"(^|/)libGL\.so",
];

/// Default function-name patterns for C runtime entry points, which often
/// carry no usable file or module.
pub const DEFAULT_SYSTEM_FUNCTION_PATTERNS: &[&str] = &[
  r"^__libc_start",
  r"^_start$",
  r"^_dl_(start|init)",
];

/// Widely used third-party libraries whose internal allocations are not
/// the application's to fix. Dropped as noise unless `cleanup.keep_third_party`.
pub const DEFAULT_THIRD_PARTY_PATTERNS: &[&str] = &[
  r"(^|/)libssl\.so",
  r"(^|/)libcrypto\.so",
  r"(^|/)libcurl\.so",
  r"(^|/)libpng[0-9]*\.so",
  r"(^|/)libjpeg\.so",
  r"(^|/)libz\.so",
  r"(^|/)libffi\.so",
  r"(^|/)libglib",
  r"(^|/)libgtk",
  r"Qt5",
  r"(^|/)libboost",
];

pub const DEFAULT_CORE_CODE_PATTERNS: &[&str] = &[
  r"(^|/)core/",
  r"(^|/)(main|server|client|engine|service|manager|controller)\.[a-z+]+$",
];

pub const DEFAULT_PERIPHERAL_CODE_PATTERNS: &[&str] = &[
  r"(^|/)tests?/",
  r"(^|/)test_[^/]*$",
  r"_test\.[a-z+]+$",
  r"(^|/)examples?/",
  r"(^|/)(demo|samples?|bench(es)?)/",
];

fn owned(patterns: &[&str]) -> Vec<String> {
  patterns.iter().map(|p| p.to_string()).collect()
}

/// Byte thresholds for the size factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeThresholds {
  pub small: u64,
  pub medium: u64,
  /// Saturation point: leaks at or above this size score 1.0.
  pub large: u64,
}

impl Default for SizeThresholds {
  fn default() -> Self {
    Self {
      small: 256,
      medium: 4 * 1024,
      large: 64 * 1024,
    }
  }
}

/// Factor weights; must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
  pub severity: f64,
  pub size: f64,
  pub frequency: f64,
  pub location: f64,
  pub kind: f64,
}

impl Default for ScoringWeights {
  fn default() -> Self {
    Self {
      severity: 0.30,
      size: 0.20,
      frequency: 0.15,
      location: 0.15,
      kind: 0.20,
    }
  }
}

impl ScoringWeights {
  pub fn sum(&self) -> f64 {
    self.severity + self.size + self.frequency + self.location + self.kind
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryThresholds {
  pub high: f64,
  pub medium: f64,
}

impl Default for CategoryThresholds {
  fn default() -> Self {
    Self {
      high: 0.7,
      medium: 0.4,
    }
  }
}

/// Location factor values per code class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationScores {
  pub core: f64,
  pub default: f64,
  pub peripheral: f64,
}

impl Default for LocationScores {
  fn default() -> Self {
    Self {
      core: 1.0,
      default: 0.5,
      peripheral: 0.2,
    }
  }
}

/// Optional filters applied after the noise filter. All off by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupOptions {
  /// Drop records smaller than this many bytes (0 disables).
  pub min_leak_size: u64,
  pub drop_still_reachable: bool,
  pub drop_empty_stacks: bool,
  /// Treat `third_party_patterns` frames as application code.
  pub keep_third_party: bool,
}

/// Which trend entry a new session is compared against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineSelector {
  /// Most recent entry recorded before the current session.
  #[default]
  Latest,
  /// An explicit session id.
  Session(String),
  /// Most recent entry carrying this version label.
  Version(String),
}

impl fmt::Display for BaselineSelector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BaselineSelector::Latest => f.write_str("latest"),
      BaselineSelector::Session(id) => write!(f, "session:{}", id),
      BaselineSelector::Version(label) => write!(f, "version:{}", label),
    }
  }
}

/// Tunable patterns, thresholds and weights. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Regexes (case-insensitive) over frame file/module marking runtime frames.
  pub system_library_patterns: Vec<String>,
  /// Regexes over the frame's function name marking runtime entry points.
  pub system_function_patterns: Vec<String>,
  /// Regexes over frame file/module for third-party libraries.
  pub third_party_patterns: Vec<String>,
  /// Regexes that override `system_library_patterns` (never system).
  pub application_patterns: Vec<String>,
  pub core_code_patterns: Vec<String>,
  pub peripheral_code_patterns: Vec<String>,
  pub size_thresholds: SizeThresholds,
  pub scoring_weights: ScoringWeights,
  pub category_thresholds: CategoryThresholds,
  pub location_scores: LocationScores,
  /// Occurrence count at which the frequency factor saturates.
  pub frequency_saturation: u64,
  /// Max stack frames to include in the signature.
  pub signature_depth: usize,
  /// Byte-delta percentage under which a trend counts as stable.
  pub trend_noise_threshold_pct: f64,
  pub baseline_selector: BaselineSelector,
  /// Drop Valgrind errors that carry a `<suppression>` block.
  pub skip_suppressed: bool,
  pub cleanup: CleanupOptions,
  /// How long a trend store append waits for the writer lock.
  pub store_lock_timeout_ms: u64,
  /// Worker threads for batch parsing/scoring (None = rayon default).
  pub parallelism: Option<usize>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      system_library_patterns: owned(DEFAULT_SYSTEM_LIBRARY_PATTERNS),
      system_function_patterns: owned(DEFAULT_SYSTEM_FUNCTION_PATTERNS),
      third_party_patterns: owned(DEFAULT_THIRD_PARTY_PATTERNS),
      application_patterns: Vec::new(),
      core_code_patterns: owned(DEFAULT_CORE_CODE_PATTERNS),
      peripheral_code_patterns: owned(DEFAULT_PERIPHERAL_CODE_PATTERNS),
      size_thresholds: SizeThresholds::default(),
      scoring_weights: ScoringWeights::default(),
      category_thresholds: CategoryThresholds::default(),
      location_scores: LocationScores::default(),
      frequency_saturation: 50,
      signature_depth: 5,
      trend_noise_threshold_pct: 5.0,
      baseline_selector: BaselineSelector::Latest,
      skip_suppressed: true,
      cleanup: CleanupOptions::default(),
      store_lock_timeout_ms: 5_000,
      parallelism: None,
    }
  }
}

const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

fn unit_interval(field: &str, value: f64) -> Result<(), EngineError> {
  if !(0.0..=1.0).contains(&value) {
    return Err(EngineError::config(
      field,
      format!("{} is outside [0, 1]", value),
    ));
  }
  Ok(())
}

impl Config {
  /// Parse a TOML document; missing keys keep their defaults.
  pub fn from_toml_str(raw: &str) -> Result<Self, EngineError> {
    toml::from_str(raw).map_err(|e| EngineError::config("toml", e.to_string()))
  }

  pub fn load(path: &Path) -> Result<Self, EngineError> {
    let raw = std::fs::read_to_string(path)
      .map_err(|e| EngineError::io(path.display().to_string(), e))?;
    Self::from_toml_str(&raw)
  }

  /// Check numeric ranges. Pattern syntax is checked when patterns compile.
  pub fn validate(&self) -> Result<(), EngineError> {
    let w = &self.scoring_weights;
    for (field, value) in [
      ("scoring_weights.severity", w.severity),
      ("scoring_weights.size", w.size),
      ("scoring_weights.frequency", w.frequency),
      ("scoring_weights.location", w.location),
      ("scoring_weights.kind", w.kind),
    ] {
      unit_interval(field, value)?;
    }
    if (w.sum() - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
      return Err(EngineError::config(
        "scoring_weights",
        format!("weights sum to {:.3}, expected 1.0", w.sum()),
      ));
    }

    let t = &self.category_thresholds;
    unit_interval("category_thresholds.high", t.high)?;
    unit_interval("category_thresholds.medium", t.medium)?;
    if t.high < t.medium {
      return Err(EngineError::config(
        "category_thresholds",
        "high must be >= medium",
      ));
    }

    let l = &self.location_scores;
    unit_interval("location_scores.core", l.core)?;
    unit_interval("location_scores.default", l.default)?;
    unit_interval("location_scores.peripheral", l.peripheral)?;

    let s = &self.size_thresholds;
    if !(s.small > 0 && s.small < s.medium && s.medium < s.large) {
      return Err(EngineError::config(
        "size_thresholds",
        "expected 0 < small < medium < large",
      ));
    }

    if self.frequency_saturation == 0 {
      return Err(EngineError::config("frequency_saturation", "must be >= 1"));
    }
    if self.signature_depth < 3 {
      return Err(EngineError::config("signature_depth", "must be >= 3"));
    }
    let noise = self.trend_noise_threshold_pct;
    if noise.is_nan() || noise < 0.0 {
      return Err(EngineError::config(
        "trend_noise_threshold_pct",
        "must be >= 0",
      ));
    }
    if self.parallelism == Some(0) {
      return Err(EngineError::config("parallelism", "must be >= 1"));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    assert!(Config::default().validate().is_ok());
    assert!((ScoringWeights::default().sum() - 1.0).abs() < 1e-9);
  }

  #[test]
  fn weights_must_sum_to_one() {
    let config = Config {
      scoring_weights: ScoringWeights {
        severity: 0.5,
        ..ScoringWeights::default()
      },
      ..Config::default()
    };
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("scoring_weights"));
  }

  #[test]
  fn thresholds_out_of_range_rejected() {
    let config = Config {
      category_thresholds: CategoryThresholds {
        high: 1.5,
        medium: 0.4,
      },
      ..Config::default()
    };
    assert!(config.validate().is_err());

    let inverted = Config {
      category_thresholds: CategoryThresholds {
        high: 0.3,
        medium: 0.6,
      },
      ..Config::default()
    };
    assert!(inverted.validate().is_err());
  }

  #[test]
  fn shallow_signature_rejected() {
    let config = Config {
      signature_depth: 2,
      ..Config::default()
    };
    assert!(config.validate().unwrap_err().to_string().contains("signature_depth"));
  }

  #[test]
  fn toml_overrides_keep_other_defaults() {
    let raw = r#"
      core_code_patterns = ["^src/net/"]
      trend_noise_threshold_pct = 10.0
      baseline_selector = { version = "v1.2.0" }

      [size_thresholds]
      small = 128

      [cleanup]
      min_leak_size = 8
    "#;
    let config = Config::from_toml_str(raw).unwrap();
    assert_eq!(config.core_code_patterns, vec!["^src/net/".to_string()]);
    assert_eq!(config.size_thresholds.small, 128);
    assert_eq!(config.size_thresholds.medium, 4096);
    assert_eq!(config.cleanup.min_leak_size, 8);
    assert_eq!(
      config.baseline_selector,
      BaselineSelector::Version("v1.2.0".into())
    );
    assert_eq!(config.signature_depth, 5);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn toml_syntax_error_is_config_error() {
    let err = Config::from_toml_str("signature_depth = [").unwrap_err();
    assert!(matches!(err, EngineError::Config { .. }));
  }
}
