//! # moult
//!
//! Daemon lifecycle support for long-running network servers: graceful
//! shutdown and graceful restart with listening-socket handoff, driven by
//! operator signals.
//!
//! ## Overview
//!
//! A moulting server sheds its old process without dropping connections:
//!
//! 1. Listener flags parse either a `host:port` to bind or an inherited
//!    descriptor written as `&N`.
//! 2. Accepted connections are counted, so the process always knows how
//!    many are in flight.
//! 3. On `SIGHUP`, the process rebuilds its own command line (substituting
//!    each bound listener with a descriptor reference), spawns a fresh copy
//!    of itself that adopts the sockets, then drains its remaining
//!    connections under a deadline and exits.
//! 4. On `SIGINT`/`SIGTERM`, it closes its listeners, drains, and exits.
//!
//! ## Signal conventions
//!
//! - `SIGINT`, `SIGTERM` — graceful shutdown
//! - `SIGHUP` — graceful restart
//! - `SIGUSR1` — log a stack dump
//!
//! A second shutdown/restart signal while a stop is in progress terminates
//! the process immediately.
//!
//! ## Sketch
//!
//! ```no_run
//! use std::sync::Arc;
//! use moult::{Error, FlagSet, Network, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let mut flags = FlagSet::new("echod");
//!     let echo = flags.listener("echo", Network::Tcp, ":12112", "echo");
//!     let fork = flags.fork("fork", "pidfile", "echo.pid");
//!     let level = flags.log_level("log-level");
//!     flags.parse()?;
//!
//!     moult::log::init(&level, None);
//!     fork.fork(&flags);
//!
//!     let listener = echo.listen().await?;
//!     tokio::spawn(async move {
//!         loop {
//!             match listener.accept().await {
//!                 Ok(_conn) => { /* spawn a handler */ }
//!                 Err(Error::Stopped) => break,
//!                 Err(e) => tracing::error!(error = %e, "accept failed"),
//!             }
//!         }
//!     });
//!
//!     Supervisor::new(Arc::new(flags)).run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform
//!
//! POSIX signal and descriptor-inheritance semantics are assumed; this
//! crate does not compile on other platforms.

#[cfg(not(unix))]
compile_error!("moult requires a Unix platform (Linux or macOS)");

mod error;
mod flags;
mod fork;
mod listener;
pub mod log;
mod privs;
mod replicate;
mod supervisor;

pub use error::{Error, Result};
pub use flags::{DurationFlag, FlagSet, IntFlag, ListenFlag, Network, StringFlag};
pub use fork::ForkFlag;
pub use listener::{TrackedListener, TrackedStream};
pub use log::{LevelFlag, LogFileFlag};
pub use privs::PrivFlag;
pub use supervisor::{restart, shutdown, Supervisor, DEFAULT_LAME_DUCK};
