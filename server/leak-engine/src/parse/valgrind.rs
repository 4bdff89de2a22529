//! Valgrind memcheck XML (`--xml=yes`) parser.
//!
//! Streams events with quick-xml. Each `<error>` whose `<kind>` is a
//! `Leak_*` kind becomes one entry; other error kinds are counted and
//! ignored. Frames come from the first `<stack>` in document order.
//! Errors that carry a `<suppression>` block are dropped by default.

use std::io::BufRead;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tracing::warn;

use crate::error::EngineError;
use crate::parse::{FormatKind, ParseOutput};
use crate::types::{LeakKind, ParseWarning, RawEntry, RawFrame, ValgrindError};

const ROOT_ELEMENT: &str = "valgrindoutput";

/// Knobs for the Valgrind dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValgrindOptions {
  /// Drop errors that carry a `<suppression>` block.
  pub skip_suppressed: bool,
}

impl Default for ValgrindOptions {
  fn default() -> Self {
    Self {
      skip_suppressed: true,
    }
  }
}

/// Map a Valgrind `<kind>` to a leak kind. `None` for non-leak error kinds.
pub fn leak_kind(label: &str) -> Option<LeakKind> {
  let kind = match label {
    "Leak_DefinitelyLost" => LeakKind::DefinitelyLost,
    "Leak_IndirectlyLost" => LeakKind::IndirectlyLost,
    "Leak_PossiblyLost" => LeakKind::PossiblyLost,
    "Leak_StillReachable" => LeakKind::StillReachable,
    other if other.starts_with("Leak_") => LeakKind::Other(other.to_string()),
    _ => return None,
  };
  Some(kind)
}

#[derive(Debug, Default)]
struct FrameBuilder {
  raw: RawFrame,
  dir: Option<String>,
}

impl FrameBuilder {
  fn finish(self) -> RawFrame {
    let mut raw = self.raw;
    if let (Some(dir), Some(file)) = (self.dir, raw.file.as_ref()) {
      if !file.starts_with('/') {
        raw.file = Some(format!("{}/{}", dir.trim_end_matches('/'), file));
      }
    }
    raw
  }
}

/// Fields of one `<error>` collected while its subtree streams past.
#[derive(Debug, Default)]
struct ErrorBuilder {
  ordinal: usize,
  unique: Option<String>,
  kind: Option<String>,
  what: Option<String>,
  xwhat_text: Option<String>,
  leaked_bytes: Option<String>,
  leaked_blocks: Option<String>,
  frames: Vec<RawFrame>,
  frame: Option<FrameBuilder>,
  stacks_seen: usize,
  suppressed: bool,
  malformed: Option<String>,
}

impl ErrorBuilder {
  fn label(&self) -> String {
    match &self.unique {
      Some(unique) => format!("error #{} (unique {})", self.ordinal, unique),
      None => format!("error #{}", self.ordinal),
    }
  }

  fn mark_malformed(&mut self, reason: String) {
    if self.malformed.is_none() {
      self.malformed = Some(reason);
    }
  }

  /// Apply the text of a closing element whose parent is `parent`.
  fn apply(&mut self, name: &str, parent: &str, text: &str) {
    match (parent, name) {
      ("error", "kind") => self.kind = Some(text.to_string()),
      ("error", "what") => self.what = Some(text.to_string()),
      ("error", "unique") => self.unique = Some(text.to_string()),
      ("xwhat", "text") => self.xwhat_text = Some(text.to_string()),
      ("xwhat", "leakedbytes") => self.leaked_bytes = Some(text.to_string()),
      ("xwhat", "leakedblocks") => self.leaked_blocks = Some(text.to_string()),
      ("stack", "frame") => {
        if let Some(frame) = self.frame.take() {
          self.frames.push(frame.finish());
        }
      }
      ("frame", field) => {
        let Some(frame) = self.frame.as_mut() else {
          return;
        };
        let value = (!text.is_empty()).then(|| text.to_string());
        match field {
          "ip" => frame.raw.address = value,
          "obj" => frame.raw.module = value,
          "fn" => frame.raw.function = value,
          "dir" => frame.dir = value,
          "file" => frame.raw.file = value,
          "line" => match text.parse::<u32>() {
            Ok(line) => frame.raw.line = Some(line),
            Err(_) => {
              let reason = format!("frame line `{}` is not a number", text);
              self.mark_malformed(reason);
            }
          },
          _ => {}
        }
      }
      _ => {}
    }
  }
}

fn parse_count(field: &str, value: Option<&str>, default: u64) -> Result<u64, String> {
  match value {
    None => Ok(default),
    Some(raw) => raw
      .trim()
      .parse::<u64>()
      .map_err(|_| format!("<{}> `{}` is not a non-negative integer", field, raw)),
  }
}

/// Turn a finished `<error>` into an entry, a warning, or nothing.
fn finish_error(builder: ErrorBuilder, options: &ValgrindOptions, out: &mut ParseOutput) {
  out.stats.seen += 1;
  let label = builder.label();

  if builder.suppressed && options.skip_suppressed {
    out.stats.suppressed += 1;
    return;
  }

  if let Some(reason) = &builder.malformed {
    out.stats.skipped += 1;
    out.warnings.push(ParseWarning::new(format!("{}: skipped: {}", label, reason)));
    return;
  }
  let Some(kind_label) = builder.kind.clone() else {
    out.stats.skipped += 1;
    out.warnings.push(ParseWarning::new(format!("{}: skipped: missing <kind>", label)));
    return;
  };
  let Some(kind) = leak_kind(&kind_label) else {
    out.stats.ignored += 1;
    return;
  };
  if let LeakKind::Other(_) = kind {
    out.warnings.push(ParseWarning::new(format!(
      "{}: unknown leak kind `{}`",
      label, kind_label
    )));
  }

  let counts = parse_count("leakedbytes", builder.leaked_bytes.as_deref(), 0).and_then(|bytes| {
    parse_count("leakedblocks", builder.leaked_blocks.as_deref(), 1).map(|blocks| (bytes, blocks))
  });
  let (leaked_bytes, leaked_blocks) = match counts {
    Ok(counts) => counts,
    Err(reason) => {
      out.stats.skipped += 1;
      out.warnings.push(ParseWarning::new(format!("{}: skipped: {}", label, reason)));
      return;
    }
  };

  if builder.stacks_seen == 0 {
    out.warnings.push(ParseWarning::new(format!("{}: no <stack>", label)));
  }

  out.entries.push(RawEntry::Valgrind(ValgrindError {
    unique: builder.unique,
    kind_label,
    kind,
    message: builder.xwhat_text.or(builder.what).unwrap_or_default(),
    leaked_bytes,
    leaked_blocks,
    frames: builder.frames,
  }));
}

/// Parse a Valgrind XML stream.
///
/// Fatal only for documents that are not well-formed XML (syntax errors,
/// mismatched or unclosed elements, text outside the root element).
pub fn parse<R: BufRead>(
  input: R,
  source: &str,
  options: &ValgrindOptions,
) -> Result<ParseOutput, EngineError> {
  let mut reader = Reader::from_reader(input);
  reader.config_mut().trim_text(true);

  let mut out = ParseOutput::empty(FormatKind::ValgrindXml);
  let mut buf = Vec::new();
  let mut path: Vec<String> = Vec::new();
  let mut text = String::new();
  let mut current: Option<ErrorBuilder> = None;
  let mut errors_opened = 0usize;

  loop {
    let event = reader
      .read_event_into(&mut buf)
      .map_err(|e| EngineError::format(source, format!("invalid XML: {}", e)))?;

    match event {
      Event::Start(e) => {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        open_element(&name, &mut path, &mut current, &mut errors_opened, &mut out);
        text.clear();
      }
      Event::Empty(e) => {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        open_element(&name, &mut path, &mut current, &mut errors_opened, &mut out);
        close_element(&mut path, "", &mut current, options, &mut out);
        text.clear();
      }
      Event::Text(t) => {
        let chunk = t
          .unescape()
          .map_err(|e| EngineError::format(source, format!("invalid XML text: {}", e)))?;
        if path.is_empty() {
          return Err(EngineError::format(
            source,
            "text outside the root element; not a Valgrind XML document",
          ));
        }
        text.push_str(&chunk);
      }
      Event::CData(t) => {
        if path.is_empty() {
          return Err(EngineError::format(source, "CDATA outside the root element"));
        }
        text.push_str(&String::from_utf8_lossy(&t));
      }
      Event::End(_) => {
        let value = std::mem::take(&mut text);
        close_element(&mut path, value.trim(), &mut current, options, &mut out);
      }
      Event::Eof => break,
      _ => {}
    }
    buf.clear();
  }

  if let Some(open) = path.last() {
    return Err(EngineError::format(
      source,
      format!("document truncated inside <{}>", open),
    ));
  }

  for warning in &out.warnings {
    warn!(source = source, "{}", warning.message);
  }
  Ok(out)
}

fn open_element(
  name: &str,
  path: &mut Vec<String>,
  current: &mut Option<ErrorBuilder>,
  errors_opened: &mut usize,
  out: &mut ParseOutput,
) {
  if path.is_empty() && name != ROOT_ELEMENT {
    out.warnings.push(ParseWarning::new(format!(
      "unexpected root element <{}> (expected <{}>)",
      name, ROOT_ELEMENT
    )));
  }
  match name {
    "error" if current.is_none() => {
      *errors_opened += 1;
      *current = Some(ErrorBuilder {
        ordinal: *errors_opened,
        ..ErrorBuilder::default()
      });
    }
    "stack" => {
      if let Some(builder) = current.as_mut() {
        builder.stacks_seen += 1;
      }
    }
    "suppression" if path.last().map(String::as_str) == Some("error") => {
      if let Some(builder) = current.as_mut() {
        builder.suppressed = true;
      }
    }
    "frame" => {
      if let Some(builder) = current.as_mut() {
        // Only the first stack is the allocation/fault stack.
        let parent_is_stack = path.last().map(String::as_str) == Some("stack");
        if builder.stacks_seen == 1 && parent_is_stack {
          builder.frame = Some(FrameBuilder::default());
        }
      }
    }
    _ => {}
  }
  path.push(name.to_string());
}

fn close_element(
  path: &mut Vec<String>,
  text: &str,
  current: &mut Option<ErrorBuilder>,
  options: &ValgrindOptions,
  out: &mut ParseOutput,
) {
  let Some(name) = path.pop() else {
    return;
  };
  let parent = path.last().map(String::as_str).unwrap_or("");

  if name == "error" {
    if let Some(builder) = current.take() {
      finish_error(builder, options, out);
    }
    return;
  }
  if let Some(builder) = current.as_mut() {
    builder.apply(&name, parent, text);
  }
}
