//! Logging bootstrap and fatal-exit plumbing.
//!
//! The library logs through `tracing` everywhere; binaries call [`init`]
//! once after flag parsing to install a `tracing-subscriber` whose max level
//! comes from the log-level flag. When a log file is configured, output is
//! teed to the original stderr and the file, and the process stderr is
//! redirected into the file so panic traces land there too.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::FromRawFd;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::Error;
use crate::flags::{FlagEntry, FlagSet, FlagValue};

/// Logs at error level, dumps a backtrace, and exits the process with
/// status 1. Used for setup-fatal and lifecycle-fatal conditions where no
/// recovery is meaningful.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        $crate::log::fatal_exit()
    }};
}
pub(crate) use fatal;

#[doc(hidden)]
pub fn fatal_exit() -> ! {
    tracing::error!("{}", std::backtrace::Backtrace::force_capture());
    std::process::exit(1);
}

/// Integer log-level flag.
///
/// Levels: 0=error, 1=warning, 2=info (default), 3=debug, 4 and up=trace.
/// The fatal level (−1) is not selectable via flag.
pub struct LevelFlag {
    level: AtomicI64,
}

impl LevelFlag {
    /// The currently configured level.
    pub fn value(&self) -> i64 {
        self.level.load(Ordering::SeqCst)
    }

    /// The `tracing` filter corresponding to the configured level.
    pub fn filter(&self) -> LevelFilter {
        match self.value() {
            0 => LevelFilter::ERROR,
            1 => LevelFilter::WARN,
            2 => LevelFilter::INFO,
            3 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

impl FlagValue for LevelFlag {
    fn set(&self, flag: &str, raw: &str) -> Result<(), Error> {
        let level: i64 = raw.parse().map_err(|_| Error::InvalidValue {
            flag: flag.to_string(),
            value: raw.to_string(),
            reason: "not an integer".to_string(),
        })?;
        if level < 0 {
            return Err(Error::InvalidValue {
                flag: flag.to_string(),
                value: raw.to_string(),
                reason: "negative levels are reserved".to_string(),
            });
        }
        self.level.store(level, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self) -> String {
        self.value().to_string()
    }
}

/// Log-file flag. When set, opens the file append/create at parse time.
pub struct LogFileFlag {
    state: Mutex<Option<(PathBuf, Arc<File>)>>,
}

impl LogFileFlag {
    fn file(&self) -> Option<Arc<File>> {
        self.state.lock().unwrap().as_ref().map(|(_, f)| f.clone())
    }

    /// Path of the configured log file, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().as_ref().map(|(p, _)| p.clone())
    }
}

impl FlagValue for LogFileFlag {
    fn set(&self, flag: &str, raw: &str) -> Result<(), Error> {
        if raw.is_empty() {
            // An empty value (as a replicated child receives when no log
            // file was configured) means "no log file".
            *self.state.lock().unwrap() = None;
            return Ok(());
        }
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(raw)
            .map_err(|e| Error::InvalidValue {
                flag: flag.to_string(),
                value: raw.to_string(),
                reason: e.to_string(),
            })?;
        *self.state.lock().unwrap() = Some((PathBuf::from(raw), Arc::new(file)));
        Ok(())
    }

    fn get(&self) -> String {
        self.path()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }
}

impl FlagSet {
    /// Register the integer log-level flag.
    pub fn log_level(&mut self, name: &str) -> Arc<LevelFlag> {
        let flag = Arc::new(LevelFlag {
            level: AtomicI64::new(2),
        });
        self.register(FlagEntry::plain(
            name,
            "Log level (0=error, 1=warning, 2=info, 3+=verbose)",
            flag.clone(),
        ));
        flag
    }

    /// Register the log-file flag.
    pub fn log_file(&mut self, name: &str) -> Arc<LogFileFlag> {
        let flag = Arc::new(LogFileFlag {
            state: Mutex::new(None),
        });
        self.register(FlagEntry::plain(
            name,
            "Log file (also writes to stderr if set)",
            flag.clone(),
        ));
        flag
    }
}

#[derive(Clone)]
struct TeeMakeWriter {
    console: Option<Arc<File>>,
    file: Option<Arc<File>>,
}

struct TeeWriter {
    console: Option<Arc<File>>,
    file: Option<Arc<File>>,
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> TeeWriter {
        TeeWriter {
            console: self.console.clone(),
            file: self.file.clone(),
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.console {
            Some(console) => {
                let _ = (&**console).write_all(buf);
            }
            None => {
                let _ = io::stderr().write_all(buf);
            }
        }
        if let Some(file) = &self.file {
            let _ = (&**file).write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(console) = &self.console {
            (&**console).flush()?;
        }
        if let Some(file) = &self.file {
            (&**file).flush()?;
        }
        Ok(())
    }
}

/// Install the global `tracing` subscriber.
///
/// Call once, after flag parsing and before anything logs in earnest. When
/// the log-file flag is set, the process stderr is redirected into the file
/// (so panics are captured) and log lines are teed to the original console.
pub fn init(level: &LevelFlag, file: Option<&LogFileFlag>) {
    let writer = match file.and_then(LogFileFlag::file) {
        Some(file) => {
            let console = redirect_stderr(&file);
            TeeMakeWriter {
                console,
                file: Some(file),
            }
        }
        None => TeeMakeWriter {
            console: None,
            file: None,
        },
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(writer);

    let _ = tracing_subscriber::registry()
        .with(level.filter())
        .with(fmt_layer)
        .try_init();
}

/// Point fd 2 at the log file, returning a duplicate of the original stderr
/// so the console keeps receiving log lines.
fn redirect_stderr(file: &Arc<File>) -> Option<Arc<File>> {
    let console = unsafe { libc::fcntl(2, libc::F_DUPFD_CLOEXEC, 3) };
    let console = if console >= 0 {
        // SAFETY: fcntl returned a fresh descriptor we now own.
        Some(Arc::new(unsafe { File::from_raw_fd(console) }))
    } else {
        None
    };
    if unsafe { libc::dup2(file.as_raw_fd(), 2) } < 0 {
        return None;
    }
    console
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::FlagSet;

    #[test]
    fn level_flag_maps_to_filters() {
        let mut flags = FlagSet::new("test");
        let level = flags.log_level("log-level");
        assert_eq!(level.value(), 2);
        assert_eq!(level.filter(), LevelFilter::INFO);

        for (raw, filter) in [
            ("0", LevelFilter::ERROR),
            ("1", LevelFilter::WARN),
            ("2", LevelFilter::INFO),
            ("3", LevelFilter::DEBUG),
            ("7", LevelFilter::TRACE),
        ] {
            flags
                .parse_from(vec![format!("--log-level={raw}")])
                .unwrap();
            assert_eq!(level.filter(), filter);
        }
    }

    #[test]
    fn fatal_level_is_not_selectable() {
        let mut flags = FlagSet::new("test");
        let level = flags.log_level("log-level");
        let err = flags
            .parse_from(vec!["--log-level=-1".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));
        assert_eq!(level.value(), 2);
    }

    #[test]
    fn log_file_flag_opens_for_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.log");
        std::fs::write(&path, b"existing\n").unwrap();

        let mut flags = FlagSet::new("test");
        let logfile = flags.log_file("logfile");
        flags
            .parse_from(vec![format!("--logfile={}", path.display())])
            .unwrap();

        let file = logfile.file().expect("file should be open");
        (&*file).write_all(b"appended\n").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "existing\nappended\n");
    }
}
