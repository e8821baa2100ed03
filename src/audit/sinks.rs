//! Audit Sinks
//!
//! Pluggable destinations for audit lines. Sinks run on the logger's writer
//! thread, never on the request path, so a slow sink cannot stall a caller.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub trait AuditSink: Send {
    fn name(&self) -> &'static str;

    /// Append one self-describing record line.
    fn write_line(&mut self, line: &str) -> std::io::Result<()>;
}

/// Writes events to stdout, one JSON object per line.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }
}

impl AuditSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{}", line)
    }
}

/// Append-only file sink with size-based rotation.
///
/// When the active file exceeds `max_bytes` it is rotated to `<path>.1`,
/// prior rotations are renumbered upwards, and anything beyond
/// `retained_rotations` is discarded.
pub struct FileSink {
    path: PathBuf,
    max_bytes: u64,
    retained_rotations: usize,
    file: File,
    written: u64,
}

impl FileSink {
    pub fn new(
        path: impl Into<PathBuf>,
        max_bytes: u64,
        retained_rotations: usize,
    ) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            retained_rotations,
            file,
            written,
        })
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush()?;

        let discard = self.rotated_path(self.retained_rotations);
        if discard.exists() {
            std::fs::remove_file(&discard)?;
        }
        for index in (1..self.retained_rotations).rev() {
            let from = self.rotated_path(index);
            if from.exists() {
                std::fs::rename(&from, self.rotated_path(index + 1))?;
            }
        }
        if self.retained_rotations > 0 {
            std::fs::rename(&self.path, self.rotated_path(1))?;
        } else {
            std::fs::remove_file(&self.path)?;
        }

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl AuditSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if self.written + line.len() as u64 + 1 > self.max_bytes && self.written > 0 {
            self.rotate()?;
        }
        writeln!(self.file, "{}", line)?;
        self.written += line.len() as u64 + 1;
        Ok(())
    }
}

/// Keeps events in memory. Used by tests and embedders that want to inspect
/// the stream directly.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the captured lines.
    pub fn lines(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.lines)
    }
}

impl AuditSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.lines
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "poisoned"))?
            .push(line.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_rotates_and_discards_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let mut sink = FileSink::new(&path, 64, 2).unwrap();

        // Each line is ~40 bytes; four writes force several rotations.
        for i in 0..8 {
            sink.write_line(&format!(
                "{{\"event\":{},\"padding\":\"xxxxxxxxxxxxxxxx\"}}",
                i
            ))
            .unwrap();
        }

        assert!(path.exists());
        assert!(dir.path().join("audit.log.1").exists());
        assert!(dir.path().join("audit.log.2").exists());
        assert!(!dir.path().join("audit.log.3").exists());
    }

    #[test]
    fn memory_sink_captures_lines() {
        let sink = MemorySink::new();
        let lines = sink.lines();
        let mut sink = sink;
        sink.write_line("{\"a\":1}").unwrap();
        assert_eq!(lines.lock().unwrap().len(), 1);
    }
}
