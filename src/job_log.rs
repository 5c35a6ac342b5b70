use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};

use crate::errors::Result;
use crate::identity::sanitize_function_name;

/// Per-job log owned by the attempt sequence currently writing to it.
///
/// The log lives at `<base>/<sanitized_function_name>/<gjs_id>.log`.
/// Opening an existing file appends (a retried or restarted job); a fresh
/// file starts a new history. Lines are UTF-8, prefixed with an ISO-8601
/// UTC timestamp and the process identifier. The handle is cheap to clone
/// so the runner and the running function can share one sink; nothing
/// global is rebound, which keeps concurrent jobs' output fully separate.
#[derive(Clone)]
pub struct JobLog {
    inner: Arc<Mutex<File>>,
    path: PathBuf,
    restarted: bool,
}

impl JobLog {
    /// Open (or reopen) the log for one job, creating parent directories
    /// as needed, and write the opening banner.
    pub fn open(base: &Path, function_name: &str, gjs_id: &str) -> Result<Self> {
        let dir = base.join(sanitize_function_name(function_name));
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{gjs_id}.log"));
        let restarted = path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let log = JobLog {
            inner: Arc::new(Mutex::new(file)),
            path,
            restarted,
        };

        if restarted {
            log.line(&format!("Restarting job {gjs_id}"))?;
        } else {
            log.line(&format!("Starting job {gjs_id}"))?;
        }

        Ok(log)
    }

    /// Append one timestamped line.
    pub fn line(&self, message: &str) -> Result<()> {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let pid = std::process::id();
        let mut file = self.inner.lock().expect("job log mutex poisoned");
        writeln!(file, "{stamp} [{pid}] {message}")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file already existed when this scope opened it.
    pub fn restarted(&self) -> bool {
        self.restarted
    }

    /// The last `count` lines, for notification bodies.
    pub fn tail(&self, count: usize) -> Result<Vec<String>> {
        let file = File::open(&self.path)?;
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()?;
        let skip = lines.len().saturating_sub(count);
        Ok(lines[skip..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_log_banners_starting() {
        let dir = TempDir::new().unwrap();
        let log = JobLog::open(dir.path(), "Add", "abc.Add(a=2,_b=3)").unwrap();
        assert!(!log.restarted());

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.contains("Starting job abc.Add(a=2,_b=3)"));
        assert!(log.path().starts_with(dir.path().join("Add")));
    }

    #[test]
    fn reopened_log_banners_restarting_and_appends() {
        let dir = TempDir::new().unwrap();
        {
            let log = JobLog::open(dir.path(), "Add", "abc").unwrap();
            log.line("first run").unwrap();
        }

        let log = JobLog::open(dir.path(), "Add", "abc").unwrap();
        assert!(log.restarted());

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.contains("Starting job abc"));
        assert!(contents.contains("first run"));
        assert!(contents.contains("Restarting job abc"));
    }

    #[test]
    fn lines_carry_timestamp_and_pid() {
        let dir = TempDir::new().unwrap();
        let log = JobLog::open(dir.path(), "Add", "abc").unwrap();
        log.line("hello").unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let line = contents.lines().last().unwrap();
        let pid = std::process::id();
        assert!(line.ends_with(&format!("[{pid}] hello")));
        // ISO-8601 with a UTC suffix.
        assert!(line.contains('T'));
        assert!(line.split(' ').next().unwrap().ends_with('Z'));
    }

    #[test]
    fn function_name_is_sanitized_in_the_path() {
        let dir = TempDir::new().unwrap();
        let log = JobLog::open(dir.path(), "My::Fn", "abc").unwrap();
        assert!(log.path().starts_with(dir.path().join("My__Fn")));
    }

    #[test]
    fn tail_returns_the_last_lines() {
        let dir = TempDir::new().unwrap();
        let log = JobLog::open(dir.path(), "Add", "abc").unwrap();
        for i in 0..10 {
            log.line(&format!("line {i}")).unwrap();
        }

        let tail = log.tail(3).unwrap();
        assert_eq!(tail.len(), 3);
        assert!(tail[2].contains("line 9"));
        assert!(tail[0].contains("line 7"));

        // Asking for more lines than exist returns the whole file.
        let all = log.tail(1000).unwrap();
        assert_eq!(all.len(), 11);
    }
}
