//! Rebuilding the command line for a replacement process.
//!
//! Walks the registered flags in declaration order and produces the child's
//! argv plus the listening descriptors it inherits. Bound listener flags
//! become `--name=&<fd>` references, where the descriptor numbers are the
//! slots the child will see after the pre-exec shuffle maps them to 3..N.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Arc;

use tracing::debug;

use crate::flags::{FlagRole, FlagSet};
use crate::listener::TrackedListener;

/// The first descriptor slot after stdin, stdout and stderr.
const FIRST_SLOT: RawFd = 3;

/// One listener handed to the child.
pub(crate) struct InheritedListener {
    /// Descriptor number the child will see, as written into argv.
    pub(crate) slot: RawFd,
    /// Duplicated descriptor backing the slot.
    pub(crate) file: OwnedFd,
}

/// Everything needed to launch (or merely drain) a copy of this process.
pub(crate) struct ReplicatedCommand {
    pub(crate) program: PathBuf,
    pub(crate) args: Vec<String>,
    pub(crate) manifest: Vec<InheritedListener>,
    /// Bound listeners, in flag-declaration order, for stop/close/drain.
    pub(crate) listeners: Vec<Arc<TrackedListener>>,
}

/// Build the child command line from the current flag values.
///
/// Bound listeners are substituted with `&<slot>` and their duplicated
/// descriptors recorded; unbound listener flags and ordinary flags pass
/// through textually; the fork flag is elided so the child cannot re-fork.
pub(crate) fn replicate(flags: &FlagSet) -> io::Result<ReplicatedCommand> {
    let program = std::env::current_exe()?;
    let mut cmd = ReplicatedCommand {
        program,
        args: Vec::new(),
        manifest: Vec::new(),
        listeners: Vec::new(),
    };

    for entry in flags.entries() {
        match &entry.role {
            FlagRole::Listener(flag) => {
                let Some(listener) = flag.bound() else {
                    // Not listening yet; the textual address still applies.
                    cmd.args
                        .push(format!("--{}={}", entry.name, entry.value.get()));
                    continue;
                };
                let slot = FIRST_SLOT + cmd.manifest.len() as RawFd;
                cmd.args.push(format!("--{}=&{slot}", entry.name));
                cmd.manifest.push(InheritedListener {
                    slot,
                    file: listener.file()?,
                });
                cmd.listeners.push(listener);
            }
            FlagRole::Fork => {}
            FlagRole::Plain => {
                cmd.args
                    .push(format!("--{}={}", entry.name, entry.value.get()));
            }
        }
    }
    Ok(cmd)
}

/// Spawn the replicated command, mapping inherited descriptors to their
/// argv slots. The parent does not wait for the child.
///
/// The manifest descriptors are first duplicated into a high range (≥100,
/// close-on-exec) so that a source sitting inside 3..N cannot be clobbered
/// while the `pre_exec` hook `dup2`s each one down to its slot; `dup2`
/// leaves close-on-exec clear on the target, so the slots survive the exec
/// while the temporaries do not.
pub(crate) fn spawn(cmd: &ReplicatedCommand, detach: bool) -> io::Result<Child> {
    debug!(program = %cmd.program.display(), args = ?cmd.args, "spawning process");

    let mut command = Command::new(&cmd.program);
    command.args(&cmd.args);
    if detach {
        command.process_group(0);
    }

    if !cmd.manifest.is_empty() {
        let mut temps = Vec::with_capacity(cmd.manifest.len());
        for inherited in &cmd.manifest {
            let fd = unsafe {
                libc::fcntl(inherited.file.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 100)
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: fcntl returned a fresh descriptor we now own.
            temps.push(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        let mapping: Vec<(RawFd, RawFd)> = temps
            .iter()
            .zip(&cmd.manifest)
            .map(|(temp, inherited)| (temp.as_raw_fd(), inherited.slot))
            .collect();
        // The hook runs after fork, where allocation is off limits; it only
        // walks the prebuilt list and issues dup2.
        unsafe {
            command.pre_exec(move || {
                for &(fd, slot) in &mapping {
                    if libc::dup2(fd, slot) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
        let child = command.spawn();
        drop(temps);
        return child;
    }

    command.spawn()
}
