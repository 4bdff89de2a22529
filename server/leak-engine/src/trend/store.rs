//! Trend store backends: a JSON-lines file and an in-memory vector.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::trend::{sort_entries, TrendQuery, TrendStore};
use crate::types::TrendEntry;

const LOCK_POLL: Duration = Duration::from_millis(25);

/// One JSON object per line. Appends add a single line under an exclusive
/// lock on `<path>.lock`; existing lines, readable or not, are never rewritten.
#[derive(Debug, Clone)]
pub struct JsonlTrendStore {
  path: PathBuf,
  lock_timeout: Duration,
}

/// Releases the sidecar lock on drop.
struct StoreLock {
  file: File,
}

impl Drop for StoreLock {
  fn drop(&mut self) {
    let _ = self.file.unlock();
  }
}

fn is_contended(err: &std::io::Error) -> bool {
  err.kind() == ErrorKind::WouldBlock
    || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl JsonlTrendStore {
  pub fn new(path: impl Into<PathBuf>, lock_timeout_ms: u64) -> Self {
    Self {
      path: path.into(),
      lock_timeout: Duration::from_millis(lock_timeout_ms),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn lock_path(&self) -> PathBuf {
    let mut name = self.path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
  }

  fn ensure_parent(&self) -> Result<(), StoreError> {
    match self.path.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))
      }
      _ => Ok(()),
    }
  }

  fn acquire(&self) -> Result<StoreLock, StoreError> {
    self.ensure_parent()?;
    let lock_path = self.lock_path();
    let file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|e| StoreError::io(&lock_path, e))?;

    let started = Instant::now();
    loop {
      match file.try_lock_exclusive() {
        Ok(()) => return Ok(StoreLock { file }),
        Err(e) if is_contended(&e) => {
          if started.elapsed() >= self.lock_timeout {
            return Err(StoreError::LockTimeout {
              path: lock_path,
              waited_ms: started.elapsed().as_millis() as u64,
            });
          }
          thread::sleep(LOCK_POLL);
        }
        Err(e) => return Err(StoreError::io(&lock_path, e)),
      }
    }
  }

  /// Every parseable entry, in file order. Corrupt lines are skipped.
  fn read_all(&self) -> Result<Vec<TrendEntry>, StoreError> {
    let file = match File::open(&self.path) {
      Ok(f) => f,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(StoreError::io(&self.path, e)),
    };

    let mut entries = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
      let line = line.map_err(|e| StoreError::io(&self.path, e))?;
      if line.trim().is_empty() {
        continue;
      }
      match serde_json::from_str::<TrendEntry>(&line) {
        Ok(entry) => entries.push(entry),
        Err(e) => warn!(
          path = %self.path.display(),
          line = i + 1,
          error = %e,
          "skipping unreadable trend entry"
        ),
      }
    }
    Ok(entries)
  }

  fn append_line(&self, line: &str) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
      .create(true)
      .read(true)
      .append(true)
      .open(&self.path)
      .map_err(|e| StoreError::io(&self.path, e))?;

    // A previous writer may have died mid-line.
    let len = file
      .metadata()
      .map_err(|e| StoreError::io(&self.path, e))?
      .len();
    let mut buf = String::with_capacity(line.len() + 2);
    if len > 0 {
      let mut last = [0u8; 1];
      file
        .seek(SeekFrom::End(-1))
        .and_then(|_| file.read_exact(&mut last))
        .map_err(|e| StoreError::io(&self.path, e))?;
      if last[0] != b'\n' {
        buf.push('\n');
      }
    }
    buf.push_str(line);
    buf.push('\n');

    file
      .write_all(buf.as_bytes())
      .and_then(|_| file.sync_data())
      .map_err(|e| StoreError::io(&self.path, e))
  }
}

impl TrendStore for JsonlTrendStore {
  fn append(&self, entry: &TrendEntry) -> Result<bool, StoreError> {
    let _lock = self.acquire()?;
    let entries = self.read_all()?;
    if entries.iter().any(|e| e.session_id == entry.session_id) {
      debug!(session_id = %entry.session_id, "trend entry already recorded");
      return Ok(false);
    }
    let line = serde_json::to_string(entry)?;
    self.append_line(&line)?;
    debug!(
      path = %self.path.display(),
      session_id = %entry.session_id,
      entries = entries.len() + 1,
      "trend entry appended"
    );
    Ok(true)
  }

  fn query(&self, query: &TrendQuery) -> Result<Vec<TrendEntry>, StoreError> {
    let mut entries: Vec<TrendEntry> = self
      .read_all()?
      .into_iter()
      .filter(|e| query.matches(e))
      .collect();
    sort_entries(&mut entries);
    Ok(entries)
  }
}

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryTrendStore {
  entries: RwLock<Vec<TrendEntry>>,
}

impl MemoryTrendStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.read().is_empty()
  }
}

impl TrendStore for MemoryTrendStore {
  fn append(&self, entry: &TrendEntry) -> Result<bool, StoreError> {
    let mut entries = self.entries.write();
    if entries.iter().any(|e| e.session_id == entry.session_id) {
      return Ok(false);
    }
    entries.push(entry.clone());
    Ok(true)
  }

  fn query(&self, query: &TrendQuery) -> Result<Vec<TrendEntry>, StoreError> {
    let mut out: Vec<TrendEntry> = self
      .entries
      .read()
      .iter()
      .filter(|e| query.matches(e))
      .cloned()
      .collect();
    sort_entries(&mut out);
    Ok(out)
  }
}
