//! Two-phase logging.
//!
//! [`init`] runs before the configuration is known: lines go to stdout and
//! into an in-memory buffer. Once the configuration is loaded,
//! [`LogHandle::attach_file`] replays the buffer into the log file, switches
//! the sink over to the file and applies the configured level.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::LogConfig;
use crate::error::ConfigError;

const EARLY_FILTER: &str = "bond_rate_sync=debug,probe_apis=debug,info";

/// Rewritten on every start and written from the first line on, so a run
/// that dies before its configuration is read still leaves a trace on disk.
pub const SESSION_LOG: &str = "last-session.log";

enum SinkTarget {
    Buffering(Vec<u8>),
    File(File),
}

struct SinkState {
    target: SinkTarget,
    session: Option<File>,
}

/// Writer target that buffers until a file is attached.
#[derive(Clone)]
pub struct DeferredSink {
    state: Arc<Mutex<SinkState>>,
    saw_error: Arc<AtomicBool>,
}

impl DeferredSink {
    pub fn new() -> Self {
        Self::with_session(None)
    }

    /// Like [`DeferredSink::new`], also copying every line into `session`.
    pub fn with_session(session: Option<File>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                target: SinkTarget::Buffering(Vec::new()),
                session,
            })),
            saw_error: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        // A poisoned sink is still usable; the log line is all that's at stake.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replay buffered output into `file` and route all further output there.
    pub fn attach(&self, mut file: File) -> io::Result<()> {
        let mut state = self.lock();
        if let SinkTarget::Buffering(buffer) = &state.target {
            file.write_all(buffer)?;
            file.flush()?;
        }
        state.target = SinkTarget::File(file);
        Ok(())
    }

    /// Buffered bytes, empty once a file is attached.
    pub fn buffered(&self) -> Vec<u8> {
        match &self.lock().target {
            SinkTarget::Buffering(buffer) => buffer.clone(),
            SinkTarget::File(_) => Vec::new(),
        }
    }

    pub fn contains_error(&self) -> bool {
        self.saw_error.load(Ordering::Relaxed)
    }
}

impl Default for DeferredSink {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SinkWriter {
    sink: DeferredSink,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.windows(5).any(|w| w == b"ERROR") {
            self.sink.saw_error.store(true, Ordering::Relaxed);
        }
        let mut state = self.sink.lock();
        if let Some(session) = state.session.as_mut() {
            // Losing the session copy must not lose the line itself.
            if session.write_all(buf).is_err() {
                state.session = None;
            }
        }
        match &mut state.target {
            SinkTarget::Buffering(buffer) => {
                buffer.extend_from_slice(buf);
                Ok(buf.len())
            }
            SinkTarget::File(file) => file.write_all(buf).map(|()| buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.sink.lock();
        if let Some(session) = state.session.as_mut() {
            session.flush()?;
        }
        match &mut state.target {
            SinkTarget::Buffering(_) => Ok(()),
            SinkTarget::File(file) => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter { sink: self.clone() }
    }
}

/// Returned by [`init`]; completes the second phase.
pub struct LogHandle {
    sink: DeferredSink,
    filter: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    /// Open the configured log file, replay everything logged so far into it
    /// and apply the configured level (`RUST_LOG` still wins).
    pub fn attach_file(&self, config: &LogConfig) -> Result<PathBuf, ConfigError> {
        let path = expand_log_path(&config.path);
        debug!("Configuring logging to '{}'", path.display());

        let log_file_error = |source| ConfigError::LogFile {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(log_file_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(log_file_error)?;
        self.sink.attach(file).map_err(log_file_error)?;

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.level))
            .map_err(|e| ConfigError::Invalid {
                field: "log.level",
                reason: e.to_string(),
            })?;
        // Only fails if the subscriber is gone, in which case there is nothing to reconfigure.
        let _ = self.filter.reload(filter);

        info!("Logging to {}", path.display());
        Ok(path)
    }

    pub fn contains_error(&self) -> bool {
        self.sink.contains_error()
    }
}

/// Replace the `{date}` placeholder with today's date.
pub fn expand_log_path(template: &str) -> PathBuf {
    PathBuf::from(template.replace("{date}", &Local::now().format("%Y-%m-%d").to_string()))
}

/// First phase: stdout, [`SESSION_LOG`] in the working directory, and an
/// in-memory buffer.
pub fn init() -> LogHandle {
    init_with_session(Path::new(SESSION_LOG))
}

pub fn init_with_session(session_path: &Path) -> LogHandle {
    let (session, session_error) = match File::create(session_path) {
        Ok(file) => (Some(file), None),
        Err(e) => (None, Some(e)),
    };
    let sink = DeferredSink::with_session(session);
    let initial =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(EARLY_FILTER));
    let (filter, handle) = reload::Layer::new(initial);

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(sink.clone()),
        )
        .try_init();
    if result.is_err() {
        eprintln!("logging already initialized, keeping the existing subscriber");
    }

    if let Some(e) = session_error {
        warn!("Failed to open session log {}: {}", session_path.display(), e);
    }
    info!(user = %login_name(), host = %host_name(), "Initialized logging");
    LogHandle {
        sink,
        filter: handle,
    }
}

fn login_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
