//! Append-only console log shared between the supervisor and its readers.
//!
//! The in-memory text is authoritative. Every appended line is also written
//! to an optional mirror file, best effort: mirror failures are logged at
//! `debug` and never reach the caller. The buffer is never compacted, so it
//! grows for the lifetime of the process.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    text: String,
    lines: usize,
}

/// Thread-safe, append-only buffer of child output lines.
#[derive(Debug, Default)]
pub struct LogStore {
    inner: Mutex<Inner>,
    mirror: Option<PathBuf>,
}

impl LogStore {
    /// In-memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory buffer mirrored to `path` (appended, created on demand).
    pub fn with_mirror(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::default(),
            mirror: Some(path.into()),
        }
    }

    pub fn mirror_path(&self) -> Option<&Path> {
        self.mirror.as_deref()
    }

    /// Append one line. Empty input is ignored; trailing CR/LF is stripped.
    pub fn append(&self, text: &str) {
        let line = text.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return;
        }

        let mut inner = self.lock();
        inner.text.push_str(line);
        inner.text.push('\n');
        inner.lines += 1;

        // Written under the lock so the mirror keeps insertion order.
        if let Some(path) = self.mirror.as_deref() {
            if let Err(err) = append_to_file(path, line) {
                tracing::debug!(path = %path.display(), error = %err, "console mirror write failed");
            }
        }
    }

    /// Full copy of the buffer.
    pub fn snapshot(&self) -> String {
        self.lock().text.clone()
    }

    /// Current length in bytes; use as an offset for [`since`](Self::since).
    pub fn len(&self) -> usize {
        self.lock().text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().text.is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.lock().lines
    }

    /// Text appended after `offset`. Offsets past the end yield "".
    pub fn since(&self, offset: usize) -> String {
        let inner = self.lock();
        let mut start = offset.min(inner.text.len());
        while !inner.text.is_char_boundary(start) {
            start += 1;
        }
        inner.text[start..].to_string()
    }

    /// Last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let inner = self.lock();
        let mut lines: Vec<String> = inner.text.lines().rev().take(n).map(str::to_string).collect();
        lines.reverse();
        lines
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn append_to_file(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")
}
