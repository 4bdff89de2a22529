//! Structured error types for the leak engine.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("config: {field}: {reason}")]
  Config { field: String, reason: String },

  #[error("format: {path}: {reason}")]
  Format { path: String, reason: String },

  #[error("io: {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("storage: {0}")]
  Storage(#[from] StoreError),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

impl EngineError {
  pub fn config(field: &str, reason: impl Into<String>) -> Self {
    Self::Config {
      field: field.to_string(),
      reason: reason.into(),
    }
  }

  pub fn format(path: impl Into<String>, reason: impl Into<String>) -> Self {
    Self::Format {
      path: path.into(),
      reason: reason.into(),
    }
  }

  pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
    Self::Io {
      path: path.into(),
      source,
    }
  }
}

/// Trend store failures. The engine downgrades these to session warnings.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("{}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("{}: lock not acquired within {waited_ms} ms", path.display())]
  LockTimeout { path: PathBuf, waited_ms: u64 },

  #[error("encode entry: {0}")]
  Json(#[from] serde_json::Error),
}

impl StoreError {
  pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    Self::Io {
      path: path.into(),
      source,
    }
  }
}
