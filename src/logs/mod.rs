//! Per-node log files with size-based rotation and tail/follow reads.
//!
//! Writers append line-wise; when a write would push the current file
//! over `max_size` the file is rotated (`.1` newest … `.N` oldest).
//! Everything around the critical rename of the live file to `.1` is
//! best-effort; that rename itself fails the write.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, warn};

use crate::error::Result;

/// Poll interval for follow mode.
const FOLLOW_POLL: Duration = Duration::from_millis(200);

/// In follow mode, a pre-existing tail is only replayed when the file was
/// written within this window; anything older is a stale buffer from a
/// previous run.
const FRESH_TAIL_WINDOW: Duration = Duration::from_secs(2);

/// Options for a log read.
#[derive(Clone, Copy, Debug)]
pub struct LogOptions {
    /// Number of trailing lines to return (or prepend in follow mode)
    pub tail: usize,
    /// Keep streaming new lines until the receiver is dropped
    pub follow: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            tail: 100,
            follow: false,
        }
    }
}

/// Append-only writer with size-based rotation.
pub struct RotatingWriter {
    path: PathBuf,
    max_size: u64,
    max_files: usize,
    file: File,
    size: u64,
}

impl RotatingWriter {
    pub fn open(path: &Path, max_size: u64, max_files: usize) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            max_size,
            max_files,
            file,
            size,
        })
    }

    /// Append one line, rotating first when it would not fit.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let len = line.len() as u64 + 1;
        if self.size + len > self.max_size && self.size > 0 {
            self.rotate()?;
        }
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.size += len;
        Ok(())
    }

    fn rotated(&self, n: usize) -> PathBuf {
        let mut os = self.path.as_os_str().to_os_string();
        os.push(format!(".{n}"));
        PathBuf::from(os)
    }

    /// Shift `.N` → `.N+1` from the oldest down, move the live file to
    /// `.1`, prune anything beyond retention, reopen.
    fn rotate(&mut self) -> Result<()> {
        self.file.flush()?;

        // Shifts are best-effort: a missing or locked intermediate must
        // not lose the live file.
        let oldest = self.max_files.saturating_sub(1);
        if oldest >= 1 {
            let _ = fs::remove_file(self.rotated(oldest));
            for n in (1..oldest).rev() {
                let from = self.rotated(n);
                if from.exists() {
                    if let Err(e) = fs::rename(&from, self.rotated(n + 1)) {
                        warn!(file = %from.display(), "log shift failed: {e}");
                    }
                }
            }
        }

        // The critical rename: losing this would drop the live log.
        fs::rename(&self.path, self.rotated(1))?;

        self.prune();

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.size = 0;
        debug!(file = %self.path.display(), "rotated log");
        Ok(())
    }

    /// Remove rotated files beyond retention, newest (by mtime) kept
    /// first. Best-effort.
    fn prune(&self) {
        let Some(dir) = self.path.parent() else {
            return;
        };
        let Some(base) = self.path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let prefix = format!("{base}.");

        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        let mut rotated: Vec<(PathBuf, SystemTime)> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                let suffix = name.strip_prefix(&prefix)?;
                suffix.parse::<u32>().ok()?;
                let mtime = entry.metadata().ok()?.modified().ok()?;
                Some((entry.path(), mtime))
            })
            .collect();

        rotated.sort_by(|a, b| b.1.cmp(&a.1));
        for (path, _) in rotated.into_iter().skip(self.max_files.saturating_sub(1)) {
            if let Err(e) = fs::remove_file(&path) {
                warn!(file = %path.display(), "log prune failed: {e}");
            }
        }
    }
}

/// Read the last `count` lines of a file by scanning blocks backwards.
pub fn tail_lines(path: &Path, count: usize) -> Result<Vec<String>> {
    const BLOCK: u64 = 8192;

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 || count == 0 {
        return Ok(Vec::new());
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut pos = len;
    let mut newlines = 0usize;
    while pos > 0 && newlines <= count {
        let chunk = BLOCK.min(pos);
        pos -= chunk;
        file.seek(SeekFrom::Start(pos))?;
        let mut block = vec![0u8; chunk as usize];
        file.read_exact(&mut block)?;
        newlines += block.iter().filter(|&&b| b == b'\n').count();
        block.extend_from_slice(&buf);
        buf = block;
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    if lines.len() > count {
        lines.drain(..lines.len() - count);
    }
    Ok(lines)
}

/// Stream log lines. With `follow` the stream keeps delivering new lines,
/// reopening the file after rotation, until the receiver is dropped.
pub fn read_stream(path: &Path, opts: LogOptions) -> UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let path = path.to_path_buf();

    tokio::spawn(async move {
        let replay_tail = if opts.follow {
            // Skip a stale tail: replaying an old buffer after a daemon
            // restart looks like fresh output to the caller.
            fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(|mtime| {
                    SystemTime::now()
                        .duration_since(mtime)
                        .map(|age| age < FRESH_TAIL_WINDOW)
                        .unwrap_or(true)
                })
                .unwrap_or(false)
        } else {
            true
        };

        if replay_tail && opts.tail > 0 {
            if let Ok(lines) = tail_lines(&path, opts.tail) {
                for line in lines {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
            }
        }
        if !opts.follow {
            return;
        }

        let mut pos = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let mut pending = Vec::new();
        loop {
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(FOLLOW_POLL).await;

            let len = match fs::metadata(&path) {
                Ok(m) => m.len(),
                Err(_) => continue,
            };
            // Shrink means the file was rotated out from under us.
            if len < pos {
                pos = 0;
                pending.clear();
            }
            if len == pos {
                continue;
            }

            let Ok(mut file) = File::open(&path) else {
                continue;
            };
            if file.seek(SeekFrom::Start(pos)).is_err() {
                continue;
            }
            let mut chunk = Vec::new();
            let Ok(read) = file.read_to_end(&mut chunk) else {
                continue;
            };
            pos += read as u64;

            pending.extend_from_slice(&chunk);
            while let Some(nl) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=nl).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                if tx.send(line).is_err() {
                    return;
                }
            }
        }
    });

    rx
}

/// Per-node log files under one directory.
pub struct LogManager {
    dir: PathBuf,
    max_size: u64,
    max_files: usize,
    writers: Mutex<HashMap<String, Arc<Mutex<RotatingWriter>>>>,
}

impl LogManager {
    pub fn new(dir: &Path, max_size: u64, max_files: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            max_size,
            max_files,
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, node: &str) -> PathBuf {
        self.dir.join(format!("{node}.log"))
    }

    /// Shared writer for one node; created on first use.
    pub fn writer_for(&self, node: &str) -> Result<Arc<Mutex<RotatingWriter>>> {
        let mut writers = self.writers.lock().expect("log manager lock poisoned");
        if let Some(writer) = writers.get(node) {
            return Ok(writer.clone());
        }
        let writer = Arc::new(Mutex::new(RotatingWriter::open(
            &self.path_for(node),
            self.max_size,
            self.max_files,
        )?));
        writers.insert(node.to_string(), writer.clone());
        Ok(writer)
    }

    pub fn tail(&self, node: &str, count: usize) -> Result<Vec<String>> {
        tail_lines(&self.path_for(node), count)
    }

    pub fn stream(&self, node: &str, opts: LogOptions) -> UnboundedReceiver<String> {
        read_stream(&self.path_for(node), opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_keeps_retention_bound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        let mut writer = RotatingWriter::open(&path, 100, 3).unwrap();

        // Five 50-byte lines (49 chars + newline).
        let line = "x".repeat(49);
        for _ in 0..5 {
            writer.write_line(&line).unwrap();
        }

        assert!(path.exists());
        assert!(dir.path().join("node.log.1").exists());
        assert!(dir.path().join("node.log.2").exists());
        assert!(!dir.path().join("node.log.3").exists());
        assert!(!dir.path().join("node.log.4").exists());

        let total: u64 = ["node.log", "node.log.1", "node.log.2"]
            .iter()
            .map(|n| fs::metadata(dir.path().join(n)).map(|m| m.len()).unwrap_or(0))
            .sum();
        assert!(total <= 4 * 100);
    }

    #[test]
    fn tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        let mut writer = RotatingWriter::open(&path, 1024 * 1024, 3).unwrap();
        for i in 0..50 {
            writer.write_line(&format!("line {i}")).unwrap();
        }

        let lines = tail_lines(&path, 3).unwrap();
        assert_eq!(lines, vec!["line 47", "line 48", "line 49"]);

        let all = tail_lines(&path, 500).unwrap();
        assert_eq!(all.len(), 50);
    }

    #[tokio::test]
    async fn follow_delivers_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        let mut writer = RotatingWriter::open(&path, 1024 * 1024, 3).unwrap();
        writer.write_line("before").unwrap();

        let mut rx = read_stream(
            &path,
            LogOptions {
                tail: 10,
                follow: true,
            },
        );

        // Fresh file: the tail is replayed.
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "before");

        writer.write_line("after").unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, "after");
    }
}
