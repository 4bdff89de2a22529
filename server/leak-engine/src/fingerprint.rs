//! Leak signatures: the identity key cleanup merges on.

use crate::types::{LeakKind, Signature, StackFrame};

/// Identity of one frame inside a signature. Addresses never take part; a
/// frame without source info falls back to its module.
fn frame_key(frame: &StackFrame) -> String {
  match (&frame.file, frame.line) {
    (Some(file), Some(line)) => format!("{}@{}:{}", frame.function, file, line),
    (Some(file), None) => format!("{}@{}", frame.function, file),
    (None, _) => format!("{}@[{}]", frame.function, frame.module.as_deref().unwrap_or("")),
  }
}

/// Hash the kind label and the first `depth` frame keys.
///
/// Returns 32 lowercase hex chars (the leading 128 bits of a blake3 digest).
pub fn compute(kind: &LeakKind, frames: &[StackFrame], depth: usize) -> Signature {
  let mut hasher = blake3::Hasher::new();
  hasher.update(kind.label().as_bytes());
  for key in frames.iter().take(depth).map(frame_key) {
    hasher.update(b"\n");
    hasher.update(key.as_bytes());
  }
  let hex = hasher.finalize().to_hex();
  Signature(hex[..32].to_string())
}
