//! Compiled frame-classification patterns (system, third-party, application, core, peripheral).

use regex::{RegexBuilder, RegexSet, RegexSetBuilder};

use crate::config::Config;
use crate::error::EngineError;
use crate::types::StackFrame;

/// A case-insensitive regex set. An empty set matches nothing.
#[derive(Debug, Clone)]
pub struct PatternSet {
  set: Option<RegexSet>,
}

impl PatternSet {
  pub fn empty() -> Self {
    Self { set: None }
  }

  /// Compile `patterns`, naming the offending entry on failure.
  pub fn compile(field: &str, patterns: &[String]) -> Result<Self, EngineError> {
    if patterns.is_empty() {
      return Ok(Self::empty());
    }
    for (i, pattern) in patterns.iter().enumerate() {
      RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| {
          EngineError::config(&format!("{}[{}]", field, i), format!("`{}`: {}", pattern, e))
        })?;
    }
    let set = RegexSetBuilder::new(patterns)
      .case_insensitive(true)
      .build()
      .map_err(|e| EngineError::config(field, e.to_string()))?;
    Ok(Self { set: Some(set) })
  }

  pub fn is_match(&self, text: &str) -> bool {
    match &self.set {
      Some(set) => set.is_match(text),
      None => false,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.set.is_none()
  }
}

/// How critical the code at a frame is, for the location factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationClass {
  Core,
  Peripheral,
  Uncategorized,
}

/// All frame patterns from the config, compiled once.
#[derive(Debug, Clone)]
pub struct FramePatterns {
  system: PatternSet,
  system_functions: PatternSet,
  /// Empty when third-party frames are kept.
  third_party: PatternSet,
  application: PatternSet,
  core: PatternSet,
  peripheral: PatternSet,
}

/// The frame's file and module, skipping empty values.
fn frame_paths(frame: &StackFrame) -> impl Iterator<Item = &str> {
  [frame.file.as_deref(), frame.module.as_deref()]
    .into_iter()
    .flatten()
    .filter(|s| !s.is_empty())
}

impl FramePatterns {
  pub fn compile(config: &Config) -> Result<Self, EngineError> {
    let third_party = PatternSet::compile("third_party_patterns", &config.third_party_patterns)?;
    Ok(Self {
      system: PatternSet::compile("system_library_patterns", &config.system_library_patterns)?,
      system_functions: PatternSet::compile(
        "system_function_patterns",
        &config.system_function_patterns,
      )?,
      third_party: if config.cleanup.keep_third_party {
        PatternSet::empty()
      } else {
        third_party
      },
      application: PatternSet::compile("application_patterns", &config.application_patterns)?,
      core: PatternSet::compile("core_code_patterns", &config.core_code_patterns)?,
      peripheral: PatternSet::compile(
        "peripheral_code_patterns",
        &config.peripheral_code_patterns,
      )?,
    })
  }

  /// True when the frame is runtime, library or (unless kept) third-party
  /// code: its file or module matches a system or third-party pattern, or its
  /// function is a runtime entry point.
  ///
  /// An application-pattern match on the file or module always wins.
  pub fn is_system_frame(&self, frame: &StackFrame) -> bool {
    let mut system = false;
    for path in frame_paths(frame) {
      if self.application.is_match(path) {
        return false;
      }
      system |= self.system.is_match(path) || self.third_party.is_match(path);
    }
    system || (!frame.function.is_empty() && self.system_functions.is_match(&frame.function))
  }

  /// Every frame is a system frame (and there is at least one frame).
  pub fn is_all_system(&self, frames: &[StackFrame]) -> bool {
    !frames.is_empty() && frames.iter().all(|f| self.is_system_frame(f))
  }

  pub fn classify_location(&self, frame: &StackFrame) -> LocationClass {
    if frame_paths(frame).any(|p| self.core.is_match(p)) {
      LocationClass::Core
    } else if frame_paths(frame).any(|p| self.peripheral.is_match(p)) {
      LocationClass::Peripheral
    } else {
      LocationClass::Uncategorized
    }
  }
}
