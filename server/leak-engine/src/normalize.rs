//! Normalize raw parser entries into canonical LeakRecords.

use crate::fingerprint;
use crate::patterns::FramePatterns;
use crate::types::*;

/// Normalize one raw entry. Infallible: the parsers already rejected
/// anything that cannot become a record.
pub fn normalize(
  raw: &RawEntry,
  patterns: &FramePatterns,
  signature_depth: usize,
  source_file: Option<&str>,
) -> LeakRecord {
  let (kind, size_bytes, block_count, frames, message, source_format) = match raw {
    RawEntry::Valgrind(e) => (
      e.kind.clone(),
      e.leaked_bytes,
      e.leaked_blocks,
      &e.frames,
      e.message.clone(),
      SourceFormat::Valgrind,
    ),
    RawEntry::Sanitizer(r) => (
      r.kind.clone(),
      // Errors report the access and the region; the larger one is the size.
      r.size.into_iter().chain(r.region_size).max().unwrap_or(0),
      r.objects.unwrap_or(1),
      &r.frames,
      r.header.clone(),
      SourceFormat::Sanitizer,
    ),
  };

  let stack_frames: Vec<StackFrame> = frames.iter().map(normalize_frame).collect();
  let signature = fingerprint::compute(&kind, &stack_frames, signature_depth);
  let primary_location = primary_location(&stack_frames, patterns).cloned();

  LeakRecord {
    severity: kind.severity(),
    kind,
    size_bytes,
    block_count,
    occurrence_count: 1,
    stack_frames,
    primary_location,
    signature,
    source_format,
    raw_message: message,
    source_file: source_file.map(str::to_string),
  }
}

/// Normalize every entry, in order.
pub fn normalize_all(
  entries: &[RawEntry],
  patterns: &FramePatterns,
  signature_depth: usize,
  source_file: Option<&str>,
) -> Vec<LeakRecord> {
  entries
    .iter()
    .map(|e| normalize(e, patterns, signature_depth, source_file))
    .collect()
}

pub fn normalize_frame(raw: &RawFrame) -> StackFrame {
  let function = match raw.function.as_deref().map(str::trim) {
    None | Some("???") => String::new(),
    Some(f) => f.to_string(),
  };
  StackFrame {
    function,
    file: raw.file.as_deref().filter(|f| !f.is_empty()).map(normalize_path),
    line: raw.line,
    module: raw.module.as_deref().filter(|m| !m.is_empty()).map(normalize_path),
    address: raw.address.clone(),
  }
}

/// First application frame; else first frame with a function name; else
/// the first frame. `None` only for an empty stack.
pub fn primary_location<'a>(
  frames: &'a [StackFrame],
  patterns: &FramePatterns,
) -> Option<&'a StackFrame> {
  frames
    .iter()
    .find(|f| !patterns.is_system_frame(f))
    .or_else(|| frames.iter().find(|f| !f.function.is_empty()))
    .or_else(|| frames.first())
}

/// Normalize a file path for stable comparison:
/// - backslash -> forward slash
/// - collapse repeated slashes
/// - strip leading ./
///
/// Case is preserved; C/C++ paths are case-sensitive.
pub fn normalize_path(p: &str) -> String {
  let s = p.trim().replace('\\', "/");
  let mut out = String::with_capacity(s.len());
  let mut prev_slash = false;
  for ch in s.chars() {
    if ch == '/' {
      if !prev_slash {
        out.push('/');
      }
      prev_slash = true;
    } else {
      prev_slash = false;
      out.push(ch);
    }
  }
  match out.strip_prefix("./") {
    Some(rest) => rest.to_string(),
    None => out,
  }
}
