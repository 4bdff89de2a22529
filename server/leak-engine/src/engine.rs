//! Core engine: parses inputs, cleans and scores leaks, records trend history.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cleanup;
use crate::config::{BaselineSelector, Config};
use crate::error::EngineError;
use crate::normalize;
use crate::parse::valgrind::ValgrindOptions;
use crate::parse::{FormatHint, LogParser, ParseOutput};
use crate::patterns::FramePatterns;
use crate::score::Scorer;
use crate::stats;
use crate::trend::{self, TrendQuery, TrendStore};
use crate::types::*;

/// Where an input's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
  Path(PathBuf),
  Bytes { name: String, data: Vec<u8> },
}

/// One log to analyze.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisInput {
  pub source: InputSource,
  pub format: FormatHint,
}

impl AnalysisInput {
  pub fn path(path: impl Into<PathBuf>, format: FormatHint) -> Self {
    Self {
      source: InputSource::Path(path.into()),
      format,
    }
  }

  pub fn bytes(name: impl Into<String>, data: impl Into<Vec<u8>>, format: FormatHint) -> Self {
    Self {
      source: InputSource::Bytes {
        name: name.into(),
        data: data.into(),
      },
      format,
    }
  }

  /// Display name used in warnings, errors and `source_files`.
  pub fn name(&self) -> String {
    match &self.source {
      InputSource::Path(p) => p.display().to_string(),
      InputSource::Bytes { name, .. } => name.clone(),
    }
  }
}

/// Per-run overrides. Unset fields fall back to generated values or config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
  pub session_id: Option<String>,
  pub timestamp: Option<DateTime<Utc>>,
  pub version_label: Option<String>,
  pub baseline: Option<BaselineSelector>,
}

/// Cooperative cancellation for batch runs. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// An input that could not be analyzed.
#[derive(Debug)]
pub struct FileFailure {
  pub source: String,
  pub error: EngineError,
}

/// Result of a batch: one session over every parsed file, plus the files
/// that failed or were never started.
#[derive(Debug)]
pub struct BatchOutcome {
  pub session: AnalysisSession,
  pub failures: Vec<FileFailure>,
  pub cancelled: Vec<String>,
}

enum FileResult {
  Parsed(String, ParseOutput),
  Failed(FileFailure),
  Cancelled(String),
}

/// The leak analysis engine. Immutable after construction apart from the
/// trend store, whose writes go through `writer`.
pub struct Engine {
  config: Config,
  patterns: FramePatterns,
  parser: LogParser,
  pool: ThreadPool,
  store: Option<Arc<dyn TrendStore>>,
  writer: Mutex<()>,
}

impl Engine {
  /// Validate the config and compile its patterns. Fails before any input
  /// is touched.
  pub fn new(config: Config) -> Result<Self, EngineError> {
    config.validate()?;
    let patterns = FramePatterns::compile(&config)?;
    let parser = LogParser::new()?.with_valgrind_options(ValgrindOptions {
      skip_suppressed: config.skip_suppressed,
    });
    let pool = ThreadPoolBuilder::new()
      .num_threads(config.parallelism.unwrap_or(0))
      .thread_name(|i| format!("leak-engine-{}", i))
      .build()
      .map_err(|e| EngineError::config("parallelism", e.to_string()))?;
    Ok(Self {
      config,
      patterns,
      parser,
      pool,
      store: None,
      writer: Mutex::new(()),
    })
  }

  pub fn with_defaults() -> Result<Self, EngineError> {
    Self::new(Config::default())
  }

  /// Attach a trend store. Without one, sessions never carry a verdict.
  pub fn with_store(mut self, store: Arc<dyn TrendStore>) -> Self {
    self.store = Some(store);
    self
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn patterns(&self) -> &FramePatterns {
    &self.patterns
  }

  /// Analyze one input. A malformed input is an error here; use
  /// [`Engine::analyze_batch`] to isolate failures per file.
  pub fn analyze(
    &self,
    input: &AnalysisInput,
    options: &RunOptions,
  ) -> Result<AnalysisSession, EngineError> {
    let parsed = self.parse_input(input)?;
    Ok(self.build_session(vec![parsed], Vec::new(), options, None))
  }

  /// Parse a set of inputs in parallel and analyze them as one session.
  ///
  /// Failed files are reported and skipped. Files not started before
  /// `cancel` fires are listed as cancelled. A batch that was cancelled or
  /// had any failed input still returns its completed results but records
  /// no trend entry.
  pub fn analyze_batch(
    &self,
    inputs: &[AnalysisInput],
    options: &RunOptions,
    cancel: &CancelToken,
  ) -> BatchOutcome {
    let results: Vec<FileResult> = self.pool.install(|| {
      inputs
        .par_iter()
        .map(|input| {
          if cancel.is_cancelled() {
            return FileResult::Cancelled(input.name());
          }
          match self.parse_input(input) {
            Ok((name, output)) => FileResult::Parsed(name, output),
            Err(error) => FileResult::Failed(FileFailure {
              source: input.name(),
              error,
            }),
          }
        })
        .collect()
    });

    let mut parsed = Vec::new();
    let mut failures = Vec::new();
    let mut cancelled = Vec::new();
    for result in results {
      match result {
        FileResult::Parsed(name, output) => parsed.push((name, output)),
        FileResult::Failed(failure) => {
          warn!(source = %failure.source, error = %failure.error, "input failed");
          failures.push(failure);
        }
        FileResult::Cancelled(name) => cancelled.push(name),
      }
    }

    let extra_warnings = failures
      .iter()
      .map(|f| SessionWarning {
        kind: WarningKind::Parse,
        source: Some(f.source.clone()),
        line: None,
        message: f.error.to_string(),
      })
      .collect();
    let skip_trend = if !cancelled.is_empty() || cancel.is_cancelled() {
      Some(format!(
        "batch cancelled with {} input(s) not analyzed; trend not recorded",
        cancelled.len()
      ))
    } else if parsed.is_empty() {
      Some("no input could be analyzed; trend not recorded".to_string())
    } else if !failures.is_empty() {
      Some(format!(
        "{} input(s) failed; partial session not recorded in trend history",
        failures.len()
      ))
    } else {
      None
    };
    if let Some(reason) = &skip_trend {
      info!(reason = %reason, "trend not recorded");
    }
    let session = self.build_session(parsed, extra_warnings, options, skip_trend);

    BatchOutcome {
      session,
      failures,
      cancelled,
    }
  }

  /// Read the trend history, if a store is attached.
  pub fn history(&self, query: &TrendQuery) -> Result<Vec<TrendEntry>, EngineError> {
    match &self.store {
      Some(store) => Ok(store.query(query)?),
      None => Ok(Vec::new()),
    }
  }

  fn parse_input(&self, input: &AnalysisInput) -> Result<(String, ParseOutput), EngineError> {
    let name = input.name();
    let output = match &input.source {
      InputSource::Path(path) => self.parser.parse_file(path, input.format)?,
      InputSource::Bytes { data, .. } => self.parser.parse_bytes(data, input.format, &name)?,
    };
    Ok((name, output))
  }

  fn build_session(
    &self,
    parsed: Vec<(String, ParseOutput)>,
    mut warnings: Vec<SessionWarning>,
    options: &RunOptions,
    skip_trend: Option<String>,
  ) -> AnalysisSession {
    let mut records = Vec::new();
    let mut source_files = Vec::with_capacity(parsed.len());
    for (name, output) in &parsed {
      records.extend(normalize::normalize_all(
        &output.entries,
        &self.patterns,
        self.config.signature_depth,
        Some(name.as_str()),
      ));
      warnings.extend(output.warnings.iter().map(|w| SessionWarning {
        kind: WarningKind::Parse,
        source: Some(name.clone()),
        line: w.line,
        message: w.message.clone(),
      }));
      source_files.push(name.clone());
    }

    let cleaned = cleanup::cleanup(records, &self.patterns, &self.config.cleanup);
    let scorer = Scorer::new(&self.config, &self.patterns);
    let mut leaks = self.pool.install(|| scorer.score_all(cleaned.leaks));
    leaks.sort_by(|a, b| {
      b.impact
        .score
        .total_cmp(&a.impact.score)
        .then_with(|| a.leak.signature.cmp(&b.leak.signature))
    });
    let summary = stats::summarize(&leaks);

    let mut session = AnalysisSession {
      session_id: options
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string()),
      timestamp: options.timestamp.unwrap_or_else(Utc::now),
      version_label: options.version_label.clone(),
      source_files,
      leaks,
      summary,
      cleanup: cleaned.stats,
      warnings,
      trend_verdict: None,
    };

    match skip_trend {
      None => self.record_trend(&mut session, options),
      Some(reason) if self.store.is_some() => session.warnings.push(SessionWarning {
        kind: WarningKind::Trend,
        source: None,
        line: None,
        message: reason,
      }),
      Some(_) => {}
    }

    info!(
      session_id = %session.session_id,
      leaks = session.summary.total_leaks,
      bytes = session.summary.total_bytes,
      high = session.summary.by_category.high,
      warnings = session.warnings.len(),
      direction = ?session.trend_verdict.as_ref().map(|v| v.direction),
      "analysis complete"
    );
    session
  }

  /// Append the session and compare it against the selected baseline.
  /// Store failures become a Storage warning and a missing explicit
  /// baseline a Trend warning; the session stays valid.
  fn record_trend(&self, session: &mut AnalysisSession, options: &RunOptions) {
    let Some(store) = &self.store else {
      return;
    };
    let entry = session.trend_entry();
    let selector = options
      .baseline
      .clone()
      .unwrap_or_else(|| self.config.baseline_selector.clone());

    let history = {
      let _writer = self.writer.lock();
      store
        .append(&entry)
        .and_then(|_| store.query(&TrendQuery::all()))
    };

    match history {
      Ok(history) => match trend::select_baseline(&history, &entry, &selector) {
        Some(baseline) => {
          let verdict = trend::compare(&entry, baseline, self.config.trend_noise_threshold_pct);
          debug!(
            baseline = %verdict.baseline_session_id,
            delta_bytes = verdict.delta_bytes,
            new = verdict.new_signatures.len(),
            resolved = verdict.resolved_signatures.len(),
            "trend compared"
          );
          session.trend_verdict = Some(verdict);
        }
        None => {
          if selector != BaselineSelector::Latest {
            warn!(selector = %selector, "requested baseline not found in trend history");
            session.warnings.push(SessionWarning {
              kind: WarningKind::Trend,
              source: None,
              line: None,
              message: format!("baseline {} not found in trend history", selector),
            });
          }
        }
      },
      Err(e) => {
        warn!(error = %e, "trend store unavailable; session has no verdict");
        session.warnings.push(SessionWarning {
          kind: WarningKind::Storage,
          source: None,
          line: None,
          message: e.to_string(),
        });
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::trend::MemoryTrendStore;

  const LEAK: &str = "\
Direct leak of 32 byte(s) in 1 object(s) allocated from:
    #0 0x4bf2cd in malloc (/usr/lib/x86_64-linux-gnu/libasan.so.8+0x4bf2cd)
    #1 0x4f5a97 in make_node /src/list.c:22:18
";

  #[test]
  fn invalid_config_rejected_before_any_input() {
    let config = Config {
      system_library_patterns: vec!["[".into()],
      ..Config::default()
    };
    let err = Engine::new(config).err().unwrap();
    assert!(matches!(err, EngineError::Config { .. }));
    assert!(err.to_string().contains("system_library_patterns[0]"));
  }

  #[test]
  fn supplied_session_id_and_timestamp_are_used() {
    let engine = Engine::with_defaults().unwrap();
    let ts = Utc::now();
    let options = RunOptions {
      session_id: Some("run-1".into()),
      timestamp: Some(ts),
      ..RunOptions::default()
    };
    let input = AnalysisInput::bytes("leak.log", LEAK, FormatHint::Auto);
    let session = engine.analyze(&input, &options).unwrap();
    assert_eq!(session.session_id, "run-1");
    assert_eq!(session.timestamp, ts);
    assert_eq!(session.source_files, vec!["leak.log".to_string()]);
    assert_eq!(session.leaks.len(), 1);
  }

  #[test]
  fn generated_session_id_is_uuid() {
    let engine = Engine::with_defaults().unwrap();
    let input = AnalysisInput::bytes("leak.log", LEAK, FormatHint::SanitizerLog);
    let session = engine.analyze(&input, &RunOptions::default()).unwrap();
    assert!(Uuid::parse_str(&session.session_id).is_ok());
  }

  #[test]
  fn cancelled_batch_records_nothing() {
    let store = Arc::new(MemoryTrendStore::new());
    let engine = Engine::with_defaults().unwrap().with_store(store.clone());
    let cancel = CancelToken::new();
    cancel.cancel();
    let inputs = vec![
      AnalysisInput::bytes("a.log", LEAK, FormatHint::Auto),
      AnalysisInput::bytes("b.log", LEAK, FormatHint::Auto),
    ];
    let outcome = engine.analyze_batch(&inputs, &RunOptions::default(), &cancel);
    assert_eq!(outcome.cancelled, vec!["a.log".to_string(), "b.log".to_string()]);
    assert!(outcome.session.leaks.is_empty());
    assert!(outcome.session.trend_verdict.is_none());
    assert!(store.is_empty());
    assert_eq!(outcome.session.warnings[0].kind, WarningKind::Trend);
  }

  #[test]
  fn failed_batch_is_not_recorded() {
    let store = Arc::new(MemoryTrendStore::new());
    let engine = Engine::with_defaults().unwrap().with_store(store.clone());
    let first = engine
      .analyze(&AnalysisInput::bytes("a.log", LEAK, FormatHint::Auto), &RunOptions::default())
      .unwrap();
    assert!(first.warnings.is_empty());
    assert_eq!(store.len(), 1);

    let inputs = vec![AnalysisInput::bytes(
      "bad.xml",
      "<valgrindoutput><x>",
      FormatHint::Auto,
    )];
    let outcome = engine.analyze_batch(&inputs, &RunOptions::default(), &CancelToken::new());
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(store.len(), 1);
    assert!(outcome.session.trend_verdict.is_none());
    assert!(outcome
      .session
      .warnings
      .iter()
      .any(|w| w.kind == WarningKind::Trend && w.message.contains("no input")));
  }

  #[test]
  fn partially_failed_batch_is_not_recorded() {
    let store = Arc::new(MemoryTrendStore::new());
    let engine = Engine::with_defaults().unwrap().with_store(store.clone());
    let inputs = vec![
      AnalysisInput::bytes("a.log", LEAK, FormatHint::Auto),
      AnalysisInput::bytes("bad.xml", "<valgrindoutput><x>", FormatHint::Auto),
    ];
    let outcome = engine.analyze_batch(&inputs, &RunOptions::default(), &CancelToken::new());
    assert_eq!(outcome.session.leaks.len(), 1);
    assert!(store.is_empty());
    assert!(outcome
      .session
      .warnings
      .iter()
      .any(|w| w.kind == WarningKind::Trend));
  }

  #[test]
  fn missing_explicit_baseline_is_reported() {
    let store = Arc::new(MemoryTrendStore::new());
    let engine = Engine::with_defaults().unwrap().with_store(store.clone());
    let options = RunOptions {
      baseline: Some(BaselineSelector::Session("nope".into())),
      ..RunOptions::default()
    };
    let session = engine
      .analyze(&AnalysisInput::bytes("a.log", LEAK, FormatHint::Auto), &options)
      .unwrap();
    assert!(session.trend_verdict.is_none());
    assert_eq!(session.warnings.len(), 1);
    assert_eq!(session.warnings[0].kind, WarningKind::Trend);
    assert!(session.warnings[0].message.contains("session:nope"));
    // The session itself is still recorded.
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn first_run_with_latest_baseline_has_no_warning() {
    let store = Arc::new(MemoryTrendStore::new());
    let engine = Engine::with_defaults().unwrap().with_store(store);
    let session = engine
      .analyze(&AnalysisInput::bytes("a.log", LEAK, FormatHint::Auto), &RunOptions::default())
      .unwrap();
    assert!(session.trend_verdict.is_none());
    assert!(session.warnings.is_empty());
  }

  #[test]
  fn no_store_no_verdict() {
    let engine = Engine::with_defaults().unwrap();
    let input = AnalysisInput::bytes("leak.log", LEAK, FormatHint::Auto);
    let session = engine.analyze(&input, &RunOptions::default()).unwrap();
    assert!(session.trend_verdict.is_none());
    assert!(session.warnings.is_empty());
  }
}
