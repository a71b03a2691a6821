//! Shared logging setup for the reaper binary.
//!
//! Two layers: a size-rotated log file under the reaper home directory, and
//! stderr. Both honor `RUST_LOG`; stderr defaults to the same filter unless
//! quieted.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "reaper=info,reaper_dicom=info,reaper_scu=info";
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for the reaper process.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Promote stderr to the full filter instead of warnings only.
    pub verbose: bool,
}

/// Initialize tracing with a rotated file writer plus stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = RotatingWriter::open(log_dir, config.app_name)
        .context("Failed to open log file")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// The reaper home directory: `$REAPER_HOME` or `~/.reaper`.
pub fn reaper_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("REAPER_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".reaper")
}

/// The logs directory: `<home>/logs`.
pub fn logs_dir() -> PathBuf {
    reaper_home().join("logs")
}

fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Append-mode log file that renames itself to `<name>.log.1` once it grows
/// past the size cap. One previous generation is kept.
struct RotatingFile {
    dir: PathBuf,
    base_name: String,
    file: File,
    current_size: u64,
}

impl RotatingFile {
    fn open(dir: PathBuf, base_name: &str) -> io::Result<RotatingFile> {
        fs::create_dir_all(&dir)?;
        let base_name = sanitize_name(base_name);
        let path = dir.join(format!("{base_name}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();
        Ok(RotatingFile {
            dir,
            base_name,
            file,
            current_size,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        let _ = self.file.flush();
        let current = self.dir.join(format!("{}.log", self.base_name));
        let previous = self.dir.join(format!("{}.log.1", self.base_name));
        if current.exists() {
            fs::rename(&current, &previous)?;
        }
        self.file = OpenOptions::new().create(true).append(true).open(&current)?;
        self.current_size = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            self.rotate()?;
        }
        let bytes = self.file.write(buf)?;
        self.current_size += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[derive(Clone)]
struct RotatingWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl RotatingWriter {
    fn open(dir: PathBuf, base_name: &str) -> Result<RotatingWriter> {
        let file = RotatingFile::open(dir, base_name)
            .with_context(|| format!("Failed to open log file for {base_name}"))?;
        Ok(RotatingWriter {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

struct RotatingWriterGuard {
    inner: Arc<Mutex<RotatingFile>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for RotatingWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rotation_keeps_one_previous_generation() {
        let dir = TempDir::new().unwrap();
        let mut file = RotatingFile::open(dir.path().to_path_buf(), "test").unwrap();
        file.current_size = MAX_LOG_FILE_SIZE; // force the next write to rotate
        file.write_all(b"after rotation\n").unwrap();
        file.flush().unwrap();
        assert!(dir.path().join("test.log").exists());
        assert!(dir.path().join("test.log.1").exists());
    }

    #[test]
    fn names_are_sanitized_for_the_filesystem() {
        assert_eq!(sanitize_name("net:scanner/1"), "net_scanner_1");
    }
}
