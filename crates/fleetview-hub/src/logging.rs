use crate::config::Config;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

type SharedFile = Arc<Mutex<File>>;

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
///
/// Lines go to stdout and, unless the log dir is blank, to a per-session file
/// that is rotated once it grows past `log_max_bytes`.
pub fn init_logging(config: &Config) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let guard = match SessionLog::open(&config.log_dir, &config.session_id, config.log_max_bytes) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard::stdout_only()
        }
    };

    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || TeeWriter {
        stdout: io::stdout(),
        file: file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(guard)
}

/// Keeps the session log file open for as long as logging is wanted.
pub struct LogGuard {
    file: Option<SharedFile>,
    path: Option<PathBuf>,
}

impl LogGuard {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn stdout_only() -> Self {
        Self {
            file: None,
            path: None,
        }
    }
}

struct SessionLog;

impl SessionLog {
    fn path(dir: &Path, session_id: &str) -> PathBuf {
        dir.join(format!("fleetview-hub-{session_id}.log"))
    }

    fn open(log_dir: &str, session_id: &str, max_bytes: u64) -> io::Result<LogGuard> {
        if log_dir.trim().is_empty() {
            return Ok(LogGuard::stdout_only());
        }
        let dir = PathBuf::from(log_dir.trim());
        std::fs::create_dir_all(&dir)?;
        let path = Self::path(&dir, session_id);
        Self::rotate_if_full(&path, max_bytes)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(LogGuard {
            file: Some(Arc::new(Mutex::new(file))),
            path: Some(path),
        })
    }

    /// Moves a full log aside to `<name>.1`, replacing any previous one.
    /// A limit of zero disables rotation.
    fn rotate_if_full(path: &Path, max_bytes: u64) -> io::Result<()> {
        if max_bytes == 0 {
            return Ok(());
        }
        let len = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if len < max_bytes {
            return Ok(());
        }
        let mut rotated = path.as_os_str().to_owned();
        rotated.push(".1");
        std::fs::rename(path, PathBuf::from(rotated))
    }
}

struct TeeWriter {
    stdout: io::Stdout,
    file: Option<SharedFile>,
}

impl TeeWriter {
    fn with_file(&self, op: impl FnOnce(&mut File)) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                op(&mut file);
            }
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        self.with_file(|file| {
            let _ = file.write_all(buf);
        });
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        self.with_file(|file| {
            let _ = file.flush();
        });
        Ok(())
    }
}
