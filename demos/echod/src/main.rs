//! A small echo server demonstrating the full daemon lifecycle:
//! forking into the background, pidfile management, privilege dropping,
//! and signal-driven graceful shutdown and restart.
//!
//! Try it:
//!
//! ```text
//! echod --echo=:12112 --log-level=3
//! # in another terminal:
//! nc localhost 12112        # hold a connection open
//! kill -HUP $(cat echo.pid) # watch the socket hand over
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info};

use moult::{Error, FlagSet, Network, Supervisor, TrackedStream};

#[tokio::main]
async fn main() -> Result<()> {
    let mut flags = FlagSet::new("echod");
    let echo = flags.listener("echo", Network::Tcp, ":12112", "echo");
    let fork = flags.fork("fork", "pidfile", "echo.pid");
    let delay = flags.duration(
        "delay",
        Duration::ZERO,
        "Restart automatically after this long (0 disables)",
    );
    let lame_duck = flags.duration(
        "lame-duck",
        moult::DEFAULT_LAME_DUCK,
        "How long to wait for connections to drain on stop",
    );
    let user = flags.privileges("user", "");
    let level = flags.log_level("log-level");
    let logfile = flags.log_file("logfile");
    flags.parse()?;

    moult::log::init(&level, Some(&logfile));
    info!(args = ?std::env::args().collect::<Vec<_>>(), "command line");

    fork.fork(&flags);

    let listener = echo.listen().await.context("listen")?;
    user.drop_privileges();

    {
        let listener = listener.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        tokio::spawn(echo_conn(conn));
                    }
                    Err(Error::Stopped) => break,
                    Err(e) => error!(error = %e, "accept failed"),
                }
            }
            info!("serve loop exited");
        });
    }

    let flags = Arc::new(flags);

    let restart_after = delay.value();
    if !restart_after.is_zero() {
        let flags = flags.clone();
        let timeout = lame_duck.value();
        tokio::spawn(async move {
            tokio::time::sleep(restart_after).await;
            moult::restart(&flags, timeout).await;
        });
    }

    Supervisor::new(flags).lame_duck(lame_duck.value()).run().await;
    Ok(())
}

/// Echo everything back until the peer hangs up.
async fn echo_conn(mut conn: TrackedStream) {
    let peer = conn.peer_addr();
    debug!(%peer, "echoing");
    let mut buf = [0u8; 4096];
    loop {
        match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = conn.write_all(&buf[..n]).await {
                    debug!(%peer, error = %e, "write failed");
                    break;
                }
            }
            Err(e) => {
                debug!(%peer, error = %e, "read failed");
                break;
            }
        }
    }
    if let Err(e) = conn.close().await {
        debug!(%peer, error = %e, "close failed");
    }
}
