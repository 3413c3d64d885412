//! Append-only execution log, one file per run.
//!
//! Every append is a single `write_all` of a complete line performed under a
//! mutex on a file opened in append mode, so output from the stdout and
//! stderr pumps never splits a line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use fieldvis_models::RunId;

use crate::error::RunnerResult;

/// Prefix applied to worker stderr lines.
pub const STDERR_PREFIX: &str = "[stderr] ";

#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl LogSink {
    /// Deterministic log location for a run.
    pub fn path_for(log_dir: &Path, run_id: &RunId) -> PathBuf {
        log_dir.join(format!("run-{}.log", run_id))
    }

    /// Open (creating if needed) the log for `run_id`.
    pub async fn open(log_dir: &Path, run_id: &RunId) -> RunnerResult<Self> {
        fs::create_dir_all(log_dir).await?;
        let path = Self::path_for(log_dir, run_id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line; a trailing newline is added when missing.
    pub async fn append_line(&self, line: &str) -> RunnerResult<()> {
        let mut chunk = String::with_capacity(line.len() + 1);
        chunk.push_str(line);
        if !chunk.ends_with('\n') {
            chunk.push('\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(chunk.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn append_stdout(&self, line: &str) -> RunnerResult<()> {
        self.append_line(line).await
    }

    pub async fn append_stderr(&self, line: &str) -> RunnerResult<()> {
        self.append_line(&format!("{}{}", STDERR_PREFIX, line)).await
    }

    /// Append an orchestrator event such as `[exit] ...` or `[cancel] ...`.
    pub async fn append_marker(&self, kind: &str, message: &str) -> RunnerResult<()> {
        self.append_line(&format!("[{}] {}", kind, message)).await
    }

    /// Read at most the last `max_bytes` of a log, starting on a line boundary.
    pub async fn read_tail(path: &Path, max_bytes: usize) -> RunnerResult<String> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() <= max_bytes {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }

        let tail = &bytes[bytes.len() - max_bytes..];
        let start = tail
            .iter()
            .position(|b| *b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        Ok(String::from_utf8_lossy(&tail[start..]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_path_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::from_string("abc");
        let sink = LogSink::open(dir.path(), &run_id).await.unwrap();
        assert_eq!(sink.path(), dir.path().join("run-abc.log"));
        assert_eq!(LogSink::path_for(dir.path(), &run_id), sink.path());
    }

    #[tokio::test]
    async fn test_appends_prefixed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(dir.path(), &RunId::from_string("r1"))
            .await
            .unwrap();

        sink.append_stdout("processing video 1/2").await.unwrap();
        sink.append_stderr("warning: low light").await.unwrap();
        sink.append_marker("exit", "Worker exited with code 0").await.unwrap();

        let content = tokio::fs::read_to_string(sink.path()).await.unwrap();
        assert_eq!(
            content,
            "processing video 1/2\n[stderr] warning: low light\n[exit] Worker exited with code 0\n"
        );
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_lines_whole() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(dir.path(), &RunId::from_string("r2"))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for writer in 0..4 {
            let sink = sink.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    let line = format!("writer-{}-line-{}-{}", writer, i, "x".repeat(200));
                    sink.append_line(&line).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let content = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 200);
        assert!(lines
            .iter()
            .all(|l| l.starts_with("writer-") && l.ends_with(&"x".repeat(200))));
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::from_string("r3");
        LogSink::open(dir.path(), &run_id)
            .await
            .unwrap()
            .append_line("first")
            .await
            .unwrap();
        LogSink::open(dir.path(), &run_id)
            .await
            .unwrap()
            .append_line("second")
            .await
            .unwrap();

        let content = LogSink::read_tail(&LogSink::path_for(dir.path(), &run_id), 1024)
            .await
            .unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_read_tail_starts_on_line_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(dir.path(), &RunId::from_string("r4"))
            .await
            .unwrap();
        for i in 0..10 {
            sink.append_line(&format!("line-{:02}", i)).await.unwrap();
        }

        // Each line is 8 bytes; 20 bytes cuts into line-07.
        let tail = LogSink::read_tail(sink.path(), 20).await.unwrap();
        assert_eq!(tail, "line-08\nline-09\n");
    }

    #[tokio::test]
    async fn test_read_tail_of_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tail = LogSink::read_tail(&dir.path().join("nope.log"), 100)
            .await
            .unwrap();
        assert!(tail.is_empty());
    }
}
