//! Forking into the background and pidfile management.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::flags::{FlagEntry, FlagRole, FlagSet, FlagValue};
use crate::log::fatal;
use crate::replicate::{replicate, spawn};
use crate::supervisor::claim_stop;

/// The fork/pidfile flag pair.
///
/// Registered through [`FlagSet::fork`]; call [`fork`](Self::fork) exactly
/// once near the top of `main`, before any listener binds.
pub struct ForkFlag {
    fork: AtomicBool,
    pidfile: Mutex<PathBuf>,
}

impl ForkFlag {
    /// Whether the command line requested a background fork.
    pub fn fork_requested(&self) -> bool {
        self.fork.load(Ordering::SeqCst)
    }

    /// The configured pidfile path.
    pub fn pidfile(&self) -> PathBuf {
        self.pidfile.lock().unwrap().clone()
    }

    /// If forking was requested, re-spawn this process detached with the
    /// same flags (minus the fork flag itself) and exit; only the spawned
    /// copy returns from its own call. Otherwise write the pidfile; a
    /// failure there is logged but not fatal.
    pub fn fork(&self, flags: &FlagSet) {
        if self.fork.load(Ordering::SeqCst) {
            if !claim_stop() {
                fatal!("fork aborted: a stop is already in progress");
            }
            // The spawned copy must not fork again.
            self.fork.store(false, Ordering::SeqCst);
            debug!("forking into the background");
            let cmd = match replicate(flags) {
                Ok(cmd) => cmd,
                Err(e) => fatal!(error = %e, "failed to replicate command line"),
            };
            if let Err(e) = spawn(&cmd, true) {
                fatal!(error = %e, "exec failed");
            }
            std::process::exit(0);
        }

        let path = self.pidfile();
        match File::create(&path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", std::process::id()) {
                    error!(path = %path.display(), error = %e, "failed to write pidfile");
                } else {
                    debug!(path = %path.display(), pid = std::process::id(), "wrote pidfile");
                }
            }
            Err(e) => error!(path = %path.display(), error = %e, "failed to create pidfile"),
        }
    }
}

/// Boolean half of the pair; `--fork` alone means true.
struct ForkValue(Arc<ForkFlag>);

impl FlagValue for ForkValue {
    fn set(&self, flag: &str, raw: &str) -> Result<()> {
        let value = match raw {
            "1" | "t" | "T" | "true" | "TRUE" | "True" => true,
            "0" | "f" | "F" | "false" | "FALSE" | "False" => false,
            _ => {
                return Err(Error::InvalidValue {
                    flag: flag.to_string(),
                    value: raw.to_string(),
                    reason: "not a boolean".to_string(),
                })
            }
        };
        self.0.fork.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self) -> String {
        self.0.fork_requested().to_string()
    }

    fn takes_value(&self) -> bool {
        false
    }
}

/// Pidfile half of the pair; replicated to children like any other flag.
struct PidfileValue(Arc<ForkFlag>);

impl FlagValue for PidfileValue {
    fn set(&self, flag: &str, raw: &str) -> Result<()> {
        if raw.is_empty() {
            return Err(Error::EmptyValue {
                flag: flag.to_string(),
            });
        }
        *self.0.pidfile.lock().unwrap() = PathBuf::from(raw);
        Ok(())
    }

    fn get(&self) -> String {
        self.0.pidfile().display().to_string()
    }
}

impl FlagSet {
    /// Register the fork flag pair: a boolean `--<fork_name>` defaulting to
    /// false and a string `--<pid_name>` defaulting to `default_pidfile`.
    pub fn fork(
        &mut self,
        fork_name: &str,
        pid_name: &str,
        default_pidfile: impl Into<PathBuf>,
    ) -> Arc<ForkFlag> {
        let flag = Arc::new(ForkFlag {
            fork: AtomicBool::new(false),
            pidfile: Mutex::new(default_pidfile.into()),
        });
        self.register(FlagEntry::plain(
            pid_name,
            "File to which to write PID",
            Arc::new(PidfileValue(flag.clone())),
        ));
        self.register(FlagEntry::with_role(
            fork_name,
            "Fork into the background",
            FlagRole::Fork,
            Arc::new(ForkValue(flag.clone())),
        ));
        flag
    }
}
