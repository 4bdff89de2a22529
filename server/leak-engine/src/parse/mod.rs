//! Format parsers: raw log bytes -> raw leak entries + non-fatal warnings.
//!
//! Two closed dialects sit behind [`LogParser::parse`]: Valgrind memcheck XML
//! and sanitizer text logs. Both read from a `BufRead` and never need the whole
//! input in memory.

pub mod sanitizer;
pub mod valgrind;

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::types::{ParseStats, ParseWarning, RawEntry};

use self::sanitizer::SanitizerGrammar;
use self::valgrind::ValgrindOptions;

/// The two supported log dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatKind {
  ValgrindXml,
  SanitizerLog,
}

/// What the caller declared about an input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatHint {
  ValgrindXml,
  #[serde(alias = "asan-log")]
  SanitizerLog,
  #[default]
  #[serde(alias = "auto-detect")]
  Auto,
}

impl FromStr for FormatHint {
  type Err = EngineError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "valgrind-xml" | "valgrind" | "xml" => Ok(Self::ValgrindXml),
      "asan-log" | "asan" | "sanitizer" | "sanitizer-log" => Ok(Self::SanitizerLog),
      "auto-detect" | "auto" => Ok(Self::Auto),
      other => Err(EngineError::config(
        "format",
        format!("unknown format `{}` (expected valgrind-xml|asan-log|auto-detect)", other),
      )),
    }
  }
}

impl fmt::Display for FormatKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::ValgrindXml => f.write_str("valgrind-xml"),
      Self::SanitizerLog => f.write_str("asan-log"),
    }
  }
}

/// Bytes sniffed by auto-detection.
pub const SNIFF_BYTES: usize = 4096;

/// Sniff the head of an input: a markup start selects XML, anything else
/// (including empty input) goes to the noise-tolerant text parser.
pub fn detect(head: &[u8]) -> FormatKind {
  let head = &head[..head.len().min(SNIFF_BYTES)];
  let head = head.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(head);
  match head.iter().find(|b| !b.is_ascii_whitespace()) {
    Some(b'<') => FormatKind::ValgrindXml,
    _ => FormatKind::SanitizerLog,
  }
}

/// Everything one parse produced. `entries` is a plain `Vec`, so it can be
/// iterated any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutput {
  pub format: FormatKind,
  pub entries: Vec<RawEntry>,
  pub warnings: Vec<ParseWarning>,
  pub stats: ParseStats,
}

impl ParseOutput {
  pub fn empty(format: FormatKind) -> Self {
    Self {
      format,
      entries: Vec::new(),
      warnings: Vec::new(),
      stats: ParseStats::default(),
    }
  }
}

/// Dispatches to the dialect parser. Holds the compiled sanitizer grammar.
#[derive(Debug, Clone)]
pub struct LogParser {
  sanitizer: SanitizerGrammar,
  valgrind: ValgrindOptions,
}

impl LogParser {
  pub fn new() -> Result<Self, EngineError> {
    Ok(Self {
      sanitizer: SanitizerGrammar::new()?,
      valgrind: ValgrindOptions::default(),
    })
  }

  pub fn with_valgrind_options(mut self, options: ValgrindOptions) -> Self {
    self.valgrind = options;
    self
  }

  /// Parse one input. `source` names it in errors and warnings.
  pub fn parse<R: BufRead>(
    &self,
    mut reader: R,
    hint: FormatHint,
    source: &str,
  ) -> Result<ParseOutput, EngineError> {
    let format = match hint {
      FormatHint::ValgrindXml => FormatKind::ValgrindXml,
      FormatHint::SanitizerLog => FormatKind::SanitizerLog,
      FormatHint::Auto => {
        let head = reader
          .fill_buf()
          .map_err(|e| EngineError::io(source, e))?;
        detect(head)
      }
    };

    let output = match format {
      FormatKind::ValgrindXml => valgrind::parse(reader, source, &self.valgrind)?,
      FormatKind::SanitizerLog => self.sanitizer.parse(reader, source)?,
    };
    debug!(
      source = source,
      format = %format,
      entries = output.entries.len(),
      warnings = output.warnings.len(),
      ignored = output.stats.ignored,
      suppressed = output.stats.suppressed,
      "parsed input"
    );
    Ok(output)
  }

  pub fn parse_bytes(
    &self,
    bytes: &[u8],
    hint: FormatHint,
    source: &str,
  ) -> Result<ParseOutput, EngineError> {
    self.parse(bytes, hint, source)
  }

  pub fn parse_file(&self, path: &Path, hint: FormatHint) -> Result<ParseOutput, EngineError> {
    let source = path.display().to_string();
    let file = File::open(path).map_err(|e| EngineError::io(&source, e))?;
    self.parse(BufReader::new(file), hint, &source)
  }
}
