//! Append-only record of rendering job output
//!
//! Failures to write are reported once and then ignored: the log never
//! decides whether a job succeeded.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

pub struct SessionLog {
    path: PathBuf,
    file: Option<File>,
}

impl SessionLog {
    /// Opens `path` for appending, creating parent directories as needed.
    pub fn open(path: &Path) -> Self {
        let opened = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(path));

        let file = match opened {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), "Cannot open session log, job output will not be recorded: {}", e);
                None
            }
        };

        Self {
            path: path.to_path_buf(),
            file,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_recording(&self) -> bool {
        self.file.is_some()
    }

    /// Writes a timestamped section header.
    pub fn header(&mut self, title: &str) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f %z");
        self.write_line(&format!("==== {} {} ====", stamp, title));
    }

    pub fn line(&mut self, line: &str) {
        self.write_line(line);
    }

    fn write_line(&mut self, text: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(file, "{}", text) {
            warn!(path = %self.path.display(), "Session log write failed, disabling: {}", e);
            self.file = None;
        }
    }
}

impl Drop for SessionLog {
    fn drop(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_appends_across_sessions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/render.log");

        {
            let mut log = SessionLog::open(&path);
            assert!(log.is_recording());
            log.header("render zoom 0-2");
            log.line("tile 0/0/0");
        }
        {
            let mut log = SessionLog::open(&path);
            log.line("tile 1/0/0");
        }

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("==== "));
        assert!(lines[0].ends_with("render zoom 0-2 ===="));
        assert_eq!(lines[2], "tile 1/0/0");
    }

    #[test]
    fn test_unwritable_path_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();

        let mut log = SessionLog::open(&blocker.join("render.log"));
        assert!(!log.is_recording());
        log.header("ignored");
        log.line("ignored");
    }
}
