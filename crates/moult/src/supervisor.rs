//! Signal-driven lifecycle: graceful shutdown and graceful restart.
//!
//! [`Supervisor::run`] is the last thing to call from `main`. It consumes
//! operator signals forever:
//!
//! - `SIGINT` / `SIGTERM` — graceful shutdown (close listeners, drain, exit)
//! - `SIGHUP` — graceful restart (hand sockets to a fresh copy of this
//!   process, drain, exit)
//! - `SIGUSR1` — log a stack dump and keep running
//!
//! At most one of shutdown, restart, or fork-as-parent runs per process
//! lifetime; a second shutdown or restart signal while one is in progress
//! terminates immediately.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::flags::FlagSet;
use crate::listener::TrackedListener;
use crate::log::fatal;
use crate::replicate::{replicate, spawn};

/// Default lame-duck interval: how long a stopping process waits for its
/// connections to drain before giving up.
pub const DEFAULT_LAME_DUCK: Duration = Duration::from_secs(15);

/// Signals can burst (an operator's repeated Ctrl-C, a process manager
/// escalating); the queue must absorb them without loss.
const SIGNAL_QUEUE_DEPTH: usize = 16;

/// Process-wide one-shot permit for stopping the binary. Whoever claims it
/// first (shutdown, restart, or fork-as-parent) owns the exit path.
static STOP_CLAIMED: AtomicBool = AtomicBool::new(false);

pub(crate) fn claim_stop() -> bool {
    !STOP_CLAIMED.swap(true, Ordering::SeqCst)
}

fn stop_claimed() -> bool {
    STOP_CLAIMED.load(Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalEvent {
    Shutdown,
    Restart,
    StackDump,
}

/// Consumes operator signals and drives the shutdown/restart state machine.
pub struct Supervisor {
    flags: Arc<FlagSet>,
    lame_duck: Duration,
}

impl Supervisor {
    /// Create a supervisor over the given flag set with the default
    /// lame-duck interval.
    pub fn new(flags: Arc<FlagSet>) -> Self {
        Self {
            flags,
            lame_duck: DEFAULT_LAME_DUCK,
        }
    }

    /// Override the lame-duck interval used for signal-initiated stops.
    pub fn lame_duck(mut self, timeout: Duration) -> Self {
        self.lame_duck = timeout;
        self
    }

    /// Install the signal handlers and dispatch forever. Does not return;
    /// the process exits from a shutdown or restart task, or fatally.
    pub async fn run(self) {
        let (tx, mut rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);

        for (kind, event, name) in [
            (SignalKind::interrupt(), SignalEvent::Shutdown, "SIGINT"),
            (SignalKind::terminate(), SignalEvent::Shutdown, "SIGTERM"),
            (SignalKind::hangup(), SignalEvent::Restart, "SIGHUP"),
            (SignalKind::user_defined1(), SignalEvent::StackDump, "SIGUSR1"),
        ] {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => fatal!(signal = name, error = %e, "failed to install signal handler"),
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    debug!(signal = name, "received signal");
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
        }

        info!("lifecycle supervisor running");
        while let Some(event) = rx.recv().await {
            match event {
                SignalEvent::StackDump => {
                    info!("stack dump:\n{}", Backtrace::force_capture());
                }
                SignalEvent::Shutdown | SignalEvent::Restart if stop_claimed() => {
                    fatal!("Aborted by signal during shutdown");
                }
                SignalEvent::Shutdown => {
                    let flags = self.flags.clone();
                    let timeout = self.lame_duck;
                    tokio::spawn(async move { shutdown(&flags, timeout).await });
                }
                SignalEvent::Restart => {
                    let flags = self.flags.clone();
                    let timeout = self.lame_duck;
                    tokio::spawn(async move { restart(&flags, timeout).await });
                }
            }
        }
    }
}

/// Close every bound listener, wait up to `timeout` for their connections
/// to drain, then exit the process. Does not return: exits 0 after a clean
/// drain, fatally on timeout or if a stop is already in progress.
pub async fn shutdown(flags: &FlagSet, timeout: Duration) {
    if !claim_stop() {
        fatal!("shutdown aborted: a stop is already in progress");
    }
    let cmd = match replicate(flags) {
        Ok(cmd) => cmd,
        Err(e) => fatal!(error = %e, "failed to collect listeners"),
    };
    for listener in &cmd.listeners {
        if let Err(e) = listener.close() {
            warn!(addr = %listener.local_addr(), error = %e, "close failed");
        }
    }
    if !drain(&cmd.listeners, timeout).await {
        fatal!("Shutdown timed out after {:?}", timeout);
    }
    info!("shutdown complete");
    std::process::exit(0);
}

/// Hand every bound listener to a freshly spawned copy of this process,
/// wait up to `timeout` for the old connections to drain, then exit. Does
/// not return: exits 0 after a clean drain, fatally on timeout, spawn
/// failure, or if a stop is already in progress.
pub async fn restart(flags: &FlagSet, timeout: Duration) {
    if !claim_stop() {
        fatal!("restart aborted: a stop is already in progress");
    }
    let cmd = match replicate(flags) {
        Ok(cmd) => cmd,
        Err(e) => fatal!(error = %e, "failed to replicate command line"),
    };
    for listener in &cmd.listeners {
        // Stop before the noop, so the woken accept observes the stop flag
        // instead of treating the wake-up as a real connection.
        if let Err(e) = listener.stop() {
            warn!(addr = %listener.local_addr(), error = %e, "stop failed");
        }
        listener.noop().await;
    }
    match spawn(&cmd, false) {
        Ok(child) => info!(pid = child.id(), "spawned replacement process"),
        Err(e) => fatal!(error = %e, "exec failed"),
    }
    if !drain(&cmd.listeners, timeout).await {
        fatal!("Restart timed out after {:?}", timeout);
    }
    info!("restart complete");
    std::process::exit(0);
}

/// Wait for every listener's connections to close, racing `timeout`.
/// Returns whether the drain completed in time.
async fn drain(listeners: &[Arc<TrackedListener>], timeout: Duration) -> bool {
    let active: usize = listeners.iter().map(|l| l.active_connections()).sum();
    info!(
        listeners = listeners.len(),
        active_connections = active,
        timeout = ?timeout,
        "draining connections"
    );
    let wait_all = async {
        for listener in listeners {
            listener.wait().await;
        }
    };
    tokio::time::timeout(timeout, wait_all).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{FlagSet, Network};
    use tokio::net::TcpStream;

    #[test]
    fn stop_token_is_claimed_exactly_once() {
        // This is the only test in the binary that touches the process-wide
        // token; it must see a fresh one.
        let claims: Vec<std::thread::JoinHandle<bool>> =
            (0..32).map(|_| std::thread::spawn(claim_stop)).collect();
        let won: usize = claims
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(won, 1);
        assert!(stop_claimed());
        assert!(!claim_stop());
    }

    #[tokio::test]
    async fn drain_completes_when_connections_close() {
        let mut flags = FlagSet::new("test");
        let echo = flags.listener("echo", Network::Tcp, "127.0.0.1:0", "echo");
        let listener = echo.listen().await.unwrap();

        let _client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut conn = listener.accept().await.unwrap();

        let listeners = vec![listener.clone()];
        assert!(!drain(&listeners, Duration::from_millis(100)).await);

        conn.close().await.unwrap();
        assert!(drain(&listeners, Duration::from_secs(1)).await);
    }
}
