//! Logging init for embedding applications: file under the XDG state dir
//! (or an explicit directory), with a stderr fallback.

use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "mtnet.log";

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mtnet_core=debug"))
}

/// Initialize structured logging to `~/.local/state/mtnet/mtnet.log`.
/// On failure (e.g. state dir unwritable), returns Err so the caller can
/// fall back to [`init_logging_stderr`].
pub fn init_logging() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("mtnet")?;
    init_logging_to(&xdg_dirs.get_state_home().join("mtnet"))
}

/// Initialize structured logging to `<dir>/mtnet.log`, creating the
/// directory as needed. Returns the log file path.
pub fn init_logging_to(dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    let path = dir.join(LOG_FILE);
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_writer(LogWriter(file))
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install subscriber: {}", e))?;

    tracing::info!("mtnet logging initialized at {}", path.display());
    Ok(path)
}

/// Initialize logging to stderr only (no file). Use when [`init_logging`]
/// fails so the host application doesn't crash.
pub fn init_logging_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();
}

/// Hands out clones of the log file; a clone failure degrades that one
/// write to stderr instead of panicking inside the subscriber.
struct LogWriter(fs::File);

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = FileOrStderr;

    fn make_writer(&'a self) -> Self::Writer {
        self.0
            .try_clone()
            .map(FileOrStderr::File)
            .unwrap_or(FileOrStderr::Stderr)
    }
}

enum FileOrStderr {
    File(fs::File),
    Stderr,
}

impl io::Write for FileOrStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileOrStderr::File(f) => f.write(buf),
            FileOrStderr::Stderr => io::stderr().lock().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileOrStderr::File(f) => f.flush(),
            FileOrStderr::Stderr => io::stderr().lock().flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_to_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_logging_to(&dir.path().join("logs")).unwrap();
        assert!(path.ends_with(LOG_FILE));
        assert!(path.exists());
        // A second subscriber install in the same process is refused, but
        // the file setup path must still work.
        assert!(init_logging_to(dir.path()).is_err());
    }
}
