//! Connection-tracked TCP listeners.
//!
//! [`TrackedListener`] wraps a [`tokio::net::TcpListener`] and counts the
//! connections it has accepted, so a stopping process can wait for all of
//! them to close before exiting. A listener can be fully closed (shutdown)
//! or merely stopped (restart), in which case the descriptor stays open for
//! inheritance by a replacement process.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Counts accepted-but-unclosed connections and wakes drain waiters when
/// the count reaches zero.
#[derive(Debug)]
struct ConnCounter {
    active: AtomicUsize,
    drained: Notify,
}

impl ConnCounter {
    fn add(self: &Arc<Self>) -> ConnGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnGuard {
            counter: Arc::clone(self),
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before re-checking so a decrement between the check
            // and the await cannot be lost.
            notified.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the counter exactly once, on drop.
#[derive(Debug)]
struct ConnGuard {
    counter: Arc<ConnCounter>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if self.counter.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counter.drained.notify_waiters();
        }
    }
}

/// A TCP listener that tracks its accepted connections.
///
/// Obtained from [`crate::ListenFlag::listen`]. Accept loops should treat
/// [`Error::Stopped`] as the signal to break.
#[derive(Debug)]
pub struct TrackedListener {
    inner: TcpListener,
    addr: SocketAddr,
    conns: Arc<ConnCounter>,
    /// Fired by both `stop` and `close`; makes the next `accept` return
    /// `Stopped` but does not wake one already blocked.
    stop: CancellationToken,
    /// Fired by `close` only; wakes blocked accepts.
    closed: CancellationToken,
    stop_fired: AtomicBool,
    close_fired: AtomicBool,
}

impl TrackedListener {
    pub(crate) fn from_tokio(inner: TcpListener) -> io::Result<Arc<Self>> {
        let addr = inner.local_addr()?;
        Ok(Arc::new(Self {
            inner,
            addr,
            conns: Arc::new(ConnCounter {
                active: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
            stop: CancellationToken::new(),
            closed: CancellationToken::new(),
            stop_fired: AtomicBool::new(false),
            close_fired: AtomicBool::new(false),
        }))
    }

    /// Accept the next connection.
    ///
    /// Returns [`Error::Stopped`] once the listener has been stopped or
    /// closed, including when a wake-up connection arrives after the stop
    /// signal fired.
    pub async fn accept(&self) -> Result<TrackedStream> {
        // Assume the accept will produce a connection; every other path
        // below rolls the count back by dropping the guard.
        let guard = self.conns.add();

        if self.stop.is_cancelled() {
            return Err(Error::Stopped);
        }

        let (stream, peer) = tokio::select! {
            _ = self.closed.cancelled() => return Err(Error::Stopped),
            res = self.inner.accept() => match res {
                Ok(pair) => pair,
                Err(_) if self.closed.is_cancelled() => return Err(Error::Stopped),
                Err(e) => return Err(e.into()),
            },
        };

        if self.stop.is_cancelled() {
            // The connection that unblocked us arrived after stop; it is
            // either the noop self-connect or a client we must turn away.
            return Err(Error::Stopped);
        }

        debug!(local = %self.addr, peer = %peer, "accepted connection");

        Ok(TrackedStream {
            inner: stream,
            local: self.addr,
            peer,
            guard: Some(guard),
        })
    }

    /// Stop accepting without closing the descriptor, which is about to be
    /// inherited by a replacement process. A blocked accept is not woken;
    /// pair with [`noop`](Self::noop) to unblock it.
    pub fn stop(&self) -> Result<()> {
        if self.close_fired.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        if self.stop_fired.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStopped);
        }
        debug!(addr = %self.addr, "stopping listener");
        self.stop.cancel();
        Ok(())
    }

    /// Stop accepting and close the listener. It is an error to call this
    /// more than once.
    pub fn close(&self) -> Result<()> {
        if self.close_fired.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        debug!(addr = %self.addr, "closing listener");
        self.stop_fired.store(true, Ordering::SeqCst);
        self.stop.cancel();
        self.closed.cancel();
        Ok(())
    }

    /// Wait for every accepted connection to close.
    pub async fn wait(&self) {
        self.conns.wait().await;
    }

    /// Number of connections currently in flight.
    pub fn active_connections(&self) -> usize {
        self.conns.active.load(Ordering::SeqCst)
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Duplicate the listening descriptor for handoff to a child process.
    pub(crate) fn file(&self) -> io::Result<OwnedFd> {
        let fd = unsafe { libc::fcntl(self.inner.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 3) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fcntl returned a fresh descriptor we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Make a throwaway connection to the listener's own address so a
    /// blocked accept wakes up and observes the stop signal. Tries v4
    /// loopback, v6 loopback, then the bound IP; the first success is
    /// enough. Failure is logged, not fatal: the accept loop still exits
    /// when the descriptor is eventually closed.
    pub(crate) async fn noop(&self) {
        for ip in [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            self.addr.ip(),
        ] {
            let target = SocketAddr::new(ip, self.addr.port());
            match TcpStream::connect(target).await {
                Ok(_) => {
                    debug!(%target, "noop connection succeeded");
                    return;
                }
                Err(e) => debug!(%target, error = %e, "noop connection failed"),
            }
        }
        debug!(addr = %self.addr, "failed to ping listener with a noop connection");
    }
}

/// Validate that a descriptor refers to a socket before adopting it.
fn validate_fd(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// Adopt a listening socket inherited from the parent process.
pub(crate) fn adopt_fd(fd: RawFd) -> io::Result<Arc<TrackedListener>> {
    if fd < 0 || !validate_fd(fd) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("inherited descriptor {fd} is not a socket"),
        ));
    }
    // SAFETY: the descriptor was just validated and is ours to own from
    // here on; the parent duplicated it before handing it over.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    TrackedListener::from_tokio(TcpListener::from_std(std_listener)?)
}

/// An accepted connection whose lifetime is tracked by its listener.
///
/// Dropping the stream releases its slot; [`close`](Self::close) does the
/// same explicitly and reports a second close as an error.
#[derive(Debug)]
pub struct TrackedStream {
    inner: TcpStream,
    local: SocketAddr,
    peer: SocketAddr,
    guard: Option<ConnGuard>,
}

impl TrackedStream {
    /// Shut the connection down and release its tracking slot. Calling this
    /// twice returns [`Error::DoubleClose`] without touching the count.
    pub async fn close(&mut self) -> Result<()> {
        let guard = self.guard.take().ok_or(Error::DoubleClose)?;
        debug!(local = %self.local, peer = %self.peer, "closed connection");
        let res = self.inner.shutdown().await;
        drop(guard);
        match res {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// The peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The local address of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn bound() -> Arc<TrackedListener> {
        let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
        TrackedListener::from_tokio(inner).unwrap()
    }

    #[tokio::test]
    async fn accept_tracks_and_close_decrements() {
        let listener = bound().await;
        let _client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut conn = listener.accept().await.unwrap();
        assert_eq!(listener.active_connections(), 1);

        conn.close().await.unwrap();
        assert_eq!(listener.active_connections(), 0);

        // A second close is an error and must not decrement again.
        let err = conn.close().await.unwrap_err();
        assert!(matches!(err, Error::DoubleClose));
        assert_eq!(listener.active_connections(), 0);
    }

    #[tokio::test]
    async fn dropping_a_connection_decrements_once() {
        let listener = bound().await;
        let _client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let conn = listener.accept().await.unwrap();
        assert_eq!(listener.active_connections(), 1);
        drop(conn);
        assert_eq!(listener.active_connections(), 0);
    }

    #[tokio::test]
    async fn accept_after_stop_returns_stopped() {
        let listener = bound().await;
        listener.stop().unwrap();

        let err = listener.accept().await.unwrap_err();
        assert!(matches!(err, Error::Stopped));
        // The speculative increment must have been rolled back.
        assert_eq!(listener.active_connections(), 0);

        let err = listener.stop().unwrap_err();
        assert!(matches!(err, Error::AlreadyStopped));
    }

    #[tokio::test]
    async fn noop_unblocks_blocked_accept() {
        let listener = bound().await;
        let task = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        listener.stop().unwrap();
        listener.noop().await;

        let res = timeout(Duration::from_millis(200), task)
            .await
            .expect("accept should unblock promptly")
            .unwrap();
        assert!(matches!(res, Err(Error::Stopped)));
        assert_eq!(listener.active_connections(), 0);
    }

    #[tokio::test]
    async fn close_wakes_blocked_accept() {
        let listener = bound().await;
        let task = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        listener.close().unwrap();
        let res = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(res, Err(Error::Stopped)));

        let err = listener.close().unwrap_err();
        assert!(matches!(err, Error::AlreadyClosed));
        let err = listener.stop().unwrap_err();
        assert!(matches!(err, Error::AlreadyClosed));
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let listener = bound().await;
        timeout(Duration::from_millis(100), listener.wait())
            .await
            .expect("wait should not block with no connections");
    }

    #[tokio::test]
    async fn wait_blocks_until_connections_close() {
        let listener = bound().await;
        let _client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut conn = listener.accept().await.unwrap();

        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        conn.close().await.unwrap();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should finish after the last close")
            .unwrap();
    }

    #[tokio::test]
    async fn adopting_a_non_socket_fails() {
        let file = tempfile::tempfile().unwrap();
        let err = adopt_fd(file.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        // Keep the descriptor alive past the call so the error path cannot
        // have closed someone else's fd.
        drop(file);
    }
}
