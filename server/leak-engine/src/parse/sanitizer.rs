//! AddressSanitizer / LeakSanitizer / MemorySanitizer text log parser.
//!
//! Line-oriented and noise tolerant: anything that is not a header, a detail
//! line or a `#N` frame is skipped, so sanitizer output interleaved with the
//! program's own stdout still parses.

use std::io::BufRead;

use regex::Regex;
use tracing::warn;

use crate::error::EngineError;
use crate::parse::{FormatKind, ParseOutput};
use crate::types::{LeakKind, ParseWarning, RawEntry, RawFrame, SanitizerReport};

/// Map a sanitizer bug type to a leak kind. `None` for unknown types.
pub fn classify(bug_type: &str) -> Option<LeakKind> {
  let kind = match bug_type {
    "Direct leak" => LeakKind::DefinitelyLost,
    "Indirect leak" => LeakKind::IndirectlyLost,
    "double-free" => LeakKind::DoubleFree,
    "use-of-uninitialized-value" => LeakKind::UninitializedRead,
    "stack-overflow" | "container-overflow" => LeakKind::BufferOverflow,
    "stack-use-after-return" | "stack-use-after-scope" => LeakKind::UseAfterFree,
    t if t.ends_with("buffer-overflow") => LeakKind::BufferOverflow,
    t if t.ends_with("use-after-free") => LeakKind::UseAfterFree,
    _ => return None,
  };
  Some(kind)
}

/// First word of the header text, skipping a leading `attempting`.
fn bug_type_of(rest: &str) -> &str {
  let mut words = rest.split_whitespace();
  match words.next() {
    Some("attempting") => words.next().unwrap_or("attempting"),
    Some(word) => word,
    None => "",
  }
}

fn compile(name: &str, pattern: &str) -> Result<Regex, EngineError> {
  Regex::new(pattern).map_err(|e| EngineError::config(name, format!("`{}`: {}", pattern, e)))
}

/// Compiled line grammar. Built once per engine and shared.
#[derive(Debug, Clone)]
pub struct SanitizerGrammar {
  pid_prefix: Regex,
  report_header: Regex,
  leak_header: Regex,
  frame: Regex,
  build_id: Regex,
  module_location: Regex,
  file_location: Regex,
  access: Regex,
  region: Regex,
  address: Regex,
}

/// The block being collected and the last block emitted.
#[derive(Debug, Default)]
struct BlockState {
  current: Option<SanitizerReport>,
  last_closed: Option<usize>,
}

impl BlockState {
  fn has_frames(&self) -> bool {
    self.current.as_ref().is_some_and(|r| !r.frames.is_empty())
  }

  fn close(&mut self, out: &mut ParseOutput) {
    let Some(report) = self.current.take() else {
      return;
    };
    if report.frames.is_empty() {
      out.warnings.push(ParseWarning::at_line(
        report.line,
        format!("{}: no stack frames", report.bug_type),
      ));
    }
    out.entries.push(RawEntry::Sanitizer(report));
    self.last_closed = Some(out.entries.len() - 1);
  }

  fn open(&mut self, report: SanitizerReport, out: &mut ParseOutput) {
    self.close(out);
    self.last_closed = None;
    out.stats.seen += 1;
    self.current = Some(report);
  }
}

impl SanitizerGrammar {
  pub fn new() -> Result<Self, EngineError> {
    Ok(Self {
      // Anything up to the `==PID==` marker: timestamps, logger tags.
      pid_prefix: compile("pid_prefix", r"^.*?==\d+==\s*")?,
      report_header: compile(
        "report_header",
        r"^(ERROR|WARNING):\s*([A-Za-z]+Sanitizer):\s*(.*)$",
      )?,
      leak_header: compile(
        "leak_header",
        r"^(Direct|Indirect) leak of (\d+) byte\(s\) in (\d+) object\(s\) allocated from",
      )?,
      frame: compile("frame", r"^#(\d+)\s+(0x[0-9a-fA-F]+)(?:\s+(.*))?$")?,
      build_id: compile("build_id", r"\s*\(BuildId: [0-9a-fA-F]+\)$")?,
      module_location: compile("module_location", r"^(.*?)\s*\(([^()]+)\+0x[0-9a-fA-F]+\)$")?,
      file_location: compile("file_location", r"^(.*\S)\s+(\S+?):(\d+)(?::\d+)?$")?,
      access: compile("access", r"^(READ|WRITE) of size (\d+)")?,
      region: compile("region", r"(\d+)-byte region")?,
      address: compile("address", r"\b(0x[0-9a-fA-F]+)\b")?,
    })
  }

  /// Parse a sanitizer log stream. Only read errors are fatal.
  pub fn parse<R: BufRead>(&self, mut reader: R, source: &str) -> Result<ParseOutput, EngineError> {
    let mut out = ParseOutput::empty(FormatKind::SanitizerLog);
    let mut state = BlockState::default();
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
      buf.clear();
      let read = reader
        .read_until(b'\n', &mut buf)
        .map_err(|e| EngineError::io(source, e))?;
      if read == 0 {
        break;
      }
      line_no += 1;
      let text = String::from_utf8_lossy(&buf);
      self.feed(text.trim_end_matches(['\n', '\r']), line_no, &mut state, &mut out);
    }
    state.close(&mut out);

    for warning in &out.warnings {
      warn!(source = source, line = ?warning.line, "{}", warning.message);
    }
    Ok(out)
  }

  fn feed(&self, raw: &str, line_no: usize, state: &mut BlockState, out: &mut ParseOutput) {
    let stripped = self.pid_prefix.replace(raw.trim(), "");
    let line = stripped.trim();

    if line.is_empty() {
      if state.has_frames() {
        state.close(out);
      }
      return;
    }
    if line.starts_with("SUMMARY:") || line.starts_with("ABORTING") {
      state.close(out);
      out.stats.ignored += 1;
      return;
    }

    if let Some(caps) = self.report_header.captures(line) {
      let rest = caps.get(3).map_or("", |m| m.as_str()).trim();
      if rest.starts_with("detected memory leaks") {
        state.close(out);
        state.last_closed = None;
        out.stats.ignored += 1;
        return;
      }
      let bug_type = bug_type_of(rest).to_string();
      let kind = self.kind_for(&bug_type, line_no, out);
      let report = SanitizerReport {
        header: line.to_string(),
        bug_type,
        kind,
        address: self.address.captures(rest).map(|c| c[1].to_string()),
        size: None,
        region_size: None,
        objects: None,
        frames: Vec::new(),
        line: line_no,
      };
      state.open(report, out);
      return;
    }

    if let Some(caps) = self.leak_header.captures(line) {
      let bug_type = format!("{} leak", &caps[1]);
      let (Ok(size), Ok(objects)) = (caps[2].parse::<u64>(), caps[3].parse::<u64>()) else {
        state.close(out);
        state.last_closed = None;
        out.stats.seen += 1;
        out.stats.skipped += 1;
        out.warnings.push(ParseWarning::at_line(
          line_no,
          format!("{}: byte/object count out of range; skipped", bug_type),
        ));
        return;
      };
      let kind = self.kind_for(&bug_type, line_no, out);
      let report = SanitizerReport {
        header: line.to_string(),
        bug_type,
        kind,
        address: None,
        size: Some(size),
        region_size: None,
        objects: Some(objects),
        frames: Vec::new(),
        line: line_no,
      };
      state.open(report, out);
      return;
    }

    if line.starts_with('#') && line[1..].starts_with(|c: char| c.is_ascii_digit()) {
      match self.parse_frame(line) {
        Some((index, frame)) => {
          // A second `#0` is the start of another stack (allocation/free site).
          if index == 0 && state.has_frames() {
            state.close(out);
            return;
          }
          if let Some(report) = state.current.as_mut() {
            report.frames.push(frame);
          }
        }
        None => out.warnings.push(ParseWarning::at_line(
          line_no,
          format!("unparseable frame line `{}`", line),
        )),
      }
      return;
    }

    // "allocated by thread T0 here:" and friends introduce a secondary stack.
    if line.ends_with("here:") && state.has_frames() {
      state.close(out);
      return;
    }

    if let Some(report) = state.current.as_mut() {
      if report.frames.is_empty() {
        if let Some(caps) = self.access.captures(line) {
          report.size = caps[2].parse().ok();
          return;
        }
      }
    }

    if let Some(caps) = self.region.captures(line) {
      let region = caps[1].parse::<u64>().ok();
      if let Some(report) = state.current.as_mut() {
        report.region_size = region;
      } else if let Some(idx) = state.last_closed {
        if let Some(RawEntry::Sanitizer(report)) = out.entries.get_mut(idx) {
          report.region_size = region;
        }
      }
    }
  }

  fn kind_for(&self, bug_type: &str, line_no: usize, out: &mut ParseOutput) -> LeakKind {
    classify(bug_type).unwrap_or_else(|| {
      out.warnings.push(ParseWarning::at_line(
        line_no,
        format!("unknown sanitizer bug type `{}`", bug_type),
      ));
      LeakKind::Other(bug_type.to_string())
    })
  }

  /// Parse `#N 0xADDR [in FUNC] [FILE:LINE[:COL] | (MODULE+0xOFF)]`.
  fn parse_frame(&self, line: &str) -> Option<(usize, RawFrame)> {
    let caps = self.frame.captures(line)?;
    let index = caps[1].parse::<usize>().ok()?;
    let mut frame = RawFrame {
      address: Some(caps[2].to_string()),
      ..RawFrame::default()
    };

    let mut rest = caps.get(3).map_or("", |m| m.as_str()).trim();
    if let Some(m) = self.build_id.find(rest) {
      rest = rest[..m.start()].trim_end();
    }
    let (body, named) = match rest.strip_prefix("in ") {
      Some(body) => (body.trim(), true),
      None => (rest, false),
    };

    if let Some(loc) = self.module_location.captures(body) {
      frame.module = Some(loc[2].to_string());
      let function = loc[1].trim();
      if named && !function.is_empty() {
        frame.function = Some(function.to_string());
      }
    } else if named {
      match self.file_location.captures(body) {
        Some(loc) => {
          frame.function = Some(loc[1].to_string());
          frame.file = Some(loc[2].to_string());
          frame.line = loc[3].parse().ok();
        }
        None => frame.function = Some(body.to_string()),
      }
    } else if !body.is_empty() && body != "(<unknown module>)" {
      frame.module = Some(body.trim_matches(['(', ')']).to_string());
    }
    Some((index, frame))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const ASAN_OVERFLOW: &str = "\
=================================================================
==4242==ERROR: AddressSanitizer: heap-buffer-overflow on address 0x602000000014 at pc 0x0000004f5b2c bp 0x7ffd3d9a7c50 sp 0x7ffd3d9a7c48
WRITE of size 4 at 0x602000000014 thread T0
    #0 0x4f5b2b in fill_table /home/dev/app/src/core/table.c:41:15
    #1 0x4f5d11 in main /home/dev/app/src/main.c:12:3
    #2 0x7f3b1c2a0d8f in __libc_start_call_main csu/../sysdeps/nptl/libc_start_call_main.h:58:16
    #3 0x41c3ad in _start (/home/dev/app/build/app+0x41c3ad) (BuildId: 4f0c1b8a2e)

0x602000000014 is located 0 bytes to the right of 16-byte region [0x602000000010,0x602000000014)
allocated by thread T0 here:
    #0 0x4bf2cd in malloc (/home/dev/app/build/app+0x4bf2cd)
    #1 0x4f5a97 in fill_table /home/dev/app/src/core/table.c:38:20

SUMMARY: AddressSanitizer: heap-buffer-overflow /home/dev/app/src/core/table.c:41:15 in fill_table
==4242==ABORTING
";

  const LSAN: &str = "\
=================================================================
==7==ERROR: LeakSanitizer: detected memory leaks

Direct leak of 40 byte(s) in 1 object(s) allocated from:
    #0 0x4bf2cd in malloc (/app+0x4bf2cd)
    #1 0x4f5a97 in make_node /src/list.c:22:18
    #2 0x4f5b10 in main /src/main.c:9:5

Indirect leak of 24 byte(s) in 3 object(s) allocated from:
    #0 0x4bf2cd in malloc (/app+0x4bf2cd)
    #1 0x4f5a55 in make_payload /src/list.c:14:12

SUMMARY: AddressSanitizer: 64 byte(s) leaked in 4 allocation(s).
";

  fn run(input: &str) -> ParseOutput {
    SanitizerGrammar::new().unwrap().parse(input.as_bytes(), "test.log").unwrap()
  }

  fn reports(out: &ParseOutput) -> Vec<&SanitizerReport> {
    out
      .entries
      .iter()
      .map(|e| match e {
        RawEntry::Sanitizer(r) => r,
        RawEntry::Valgrind(_) => panic!("unexpected valgrind entry"),
      })
      .collect()
  }

  #[test]
  fn overflow_block_with_region_and_secondary_stack() {
    let out = run(ASAN_OVERFLOW);
    let reps = reports(&out);
    assert_eq!(reps.len(), 1);
    assert!(out.warnings.is_empty(), "{:?}", out.warnings);
    assert_eq!(out.stats.ignored, 2);

    let r = reps[0];
    assert_eq!(r.kind, LeakKind::BufferOverflow);
    assert_eq!(r.bug_type, "heap-buffer-overflow");
    assert_eq!(r.address.as_deref(), Some("0x602000000014"));
    assert_eq!(r.size, Some(4));
    assert_eq!(r.region_size, Some(16));
    assert_eq!(r.line, 2);
    // Only the faulting stack; the allocation stack is not merged in.
    assert_eq!(r.frames.len(), 4);
    assert_eq!(r.frames[0].function.as_deref(), Some("fill_table"));
    assert_eq!(r.frames[0].file.as_deref(), Some("/home/dev/app/src/core/table.c"));
    assert_eq!(r.frames[0].line, Some(41));
    assert_eq!(r.frames[3].function.as_deref(), Some("_start"));
    assert_eq!(r.frames[3].module.as_deref(), Some("/home/dev/app/build/app"));
    assert_eq!(r.frames[3].file, None);
  }

  #[test]
  fn leak_blocks_and_preamble() {
    let out = run(LSAN);
    let reps = reports(&out);
    assert_eq!(reps.len(), 2);
    assert_eq!(out.stats.ignored, 2);
    assert_eq!(out.stats.seen, 2);

    assert_eq!(reps[0].kind, LeakKind::DefinitelyLost);
    assert_eq!(reps[0].size, Some(40));
    assert_eq!(reps[0].objects, Some(1));
    assert_eq!(reps[0].frames.len(), 3);
    assert_eq!(reps[0].frames[0].module.as_deref(), Some("/app"));

    assert_eq!(reps[1].kind, LeakKind::IndirectlyLost);
    assert_eq!(reps[1].size, Some(24));
    assert_eq!(reps[1].objects, Some(3));
  }

  #[test]
  fn msan_and_double_free_headers() {
    let input = "\
==99==WARNING: MemorySanitizer: use-of-uninitialized-value
    #0 0x4a1b2c in check /src/check.c:7:9

==100==ERROR: AddressSanitizer: attempting double-free on 0x603000000010 in thread T0:
    #0 0x4bf0ad in free (/app+0x4bf0ad)
    #1 0x4f5a00 in release /src/pool.c:31:5
";
    let out = run(input);
    let reps = reports(&out);
    assert_eq!(reps.len(), 2);
    assert_eq!(reps[0].kind, LeakKind::UninitializedRead);
    assert_eq!(reps[1].kind, LeakKind::DoubleFree);
    assert_eq!(reps[1].bug_type, "double-free");
    assert_eq!(reps[1].address.as_deref(), Some("0x603000000010"));
    assert!(out.warnings.is_empty());
  }

  #[test]
  fn interleaved_program_output_is_ignored() {
    let input = "\
server listening on :8080
[info] accepted connection #12
==5==ERROR: AddressSanitizer: heap-use-after-free on address 0x60b000000040
READ of size 8 at 0x60b000000040 thread T3
request handled in 3ms
    #0 0x4f1000 in handle /src/conn.c:88:3
    #1 0x4f2000 in worker /src/pool.c:10:1
";
    let out = run(input);
    let reps = reports(&out);
    assert_eq!(reps.len(), 1);
    assert_eq!(reps[0].kind, LeakKind::UseAfterFree);
    assert_eq!(reps[0].size, Some(8));
    assert_eq!(reps[0].frames.len(), 2);
    assert!(out.warnings.is_empty());
  }

  #[test]
  fn unknown_bug_type_and_missing_frames_warn() {
    let input = "\
==1==ERROR: AddressSanitizer: SEGV on unknown address 0x000000000000
SUMMARY: AddressSanitizer: SEGV
";
    let out = run(input);
    let reps = reports(&out);
    assert_eq!(reps.len(), 1);
    assert_eq!(reps[0].kind, LeakKind::Other("SEGV".into()));
    assert_eq!(out.warnings.len(), 2);
    assert!(out.warnings[0].message.contains("unknown sanitizer bug type"));
    assert!(out.warnings[1].message.contains("no stack frames"));
    assert_eq!(out.warnings[1].line, Some(1));
  }

  #[test]
  fn log_prefix_before_pid_marker_is_stripped() {
    let input = "\
2024-01-01T00:00:00 ==123==ERROR: AddressSanitizer: heap-use-after-free on address 0x60b000000040
2024-01-01T00:00:00 ==123==READ of size 8 at 0x60b000000040 thread T0
2024-01-01T00:00:00 ==123==    #0 0x4f1000 in handle /src/conn.c:88:3
[worker-2] ==123==    #1 0x4f2000 in worker /src/pool.c:10:1
";
    let out = run(input);
    let reps = reports(&out);
    assert_eq!(reps.len(), 1);
    assert_eq!(reps[0].kind, LeakKind::UseAfterFree);
    assert_eq!(reps[0].size, Some(8));
    assert_eq!(reps[0].frames.len(), 2);
    assert_eq!(reps[0].frames[1].function.as_deref(), Some("worker"));
    assert!(reps[0].header.starts_with("ERROR: AddressSanitizer"));
  }

  #[test]
  fn bad_frame_line_warns_and_is_skipped() {
    let input = "\
Direct leak of 8 byte(s) in 1 object(s) allocated from:
    #0 0x4bf2cd in malloc (/app+0x4bf2cd)
    #1 garbage without address
    #2 0x4f5a97 in make /src/a.c:3:1
";
    let out = run(input);
    let reps = reports(&out);
    assert_eq!(reps[0].frames.len(), 2);
    assert_eq!(out.warnings.len(), 1);
    assert_eq!(out.warnings[0].line, Some(3));
  }

  #[test]
  fn crlf_and_invalid_utf8_tolerated() {
    let mut bytes = b"Direct leak of 8 byte(s) in 2 object(s) allocated from:\r\n".to_vec();
    bytes.extend_from_slice(b"    #0 0x1 in f\xff /src/a.c:1:1\r\n");
    let out = SanitizerGrammar::new().unwrap().parse(&bytes[..], "x").unwrap();
    let reps = reports(&out);
    assert_eq!(reps.len(), 1);
    assert_eq!(reps[0].frames[0].file.as_deref(), Some("/src/a.c"));
  }

  #[test]
  fn empty_input_is_empty() {
    let out = run("");
    assert!(out.entries.is_empty());
    assert!(out.warnings.is_empty());
  }

  #[test]
  fn classify_vocabulary() {
    assert_eq!(classify("stack-buffer-overflow"), Some(LeakKind::BufferOverflow));
    assert_eq!(classify("global-buffer-overflow"), Some(LeakKind::BufferOverflow));
    assert_eq!(classify("container-overflow"), Some(LeakKind::BufferOverflow));
    assert_eq!(classify("heap-use-after-free"), Some(LeakKind::UseAfterFree));
    assert_eq!(classify("stack-use-after-scope"), Some(LeakKind::UseAfterFree));
    assert_eq!(classify("double-free"), Some(LeakKind::DoubleFree));
    assert_eq!(classify("data race"), None);
  }
}
