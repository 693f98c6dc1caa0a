//! Command-line flag registry.
//!
//! The restart machinery has to rebuild the child's command line from the
//! parent's live flag values, substituting bound listeners with inherited
//! descriptor references. That requires a registry that can enumerate
//! declared flags with both their current textual value and their typed
//! identity, so the registry is part of the library rather than an external
//! parser: each registration returns a shared handle the application reads,
//! and [`FlagSet`] keeps the declaration-ordered entries the replicator
//! walks.
//!
//! Accepted syntax: `--name=value`, `--name value`, single-dash variants,
//! bare boolean flags, and `--` to end flag parsing. `-h`/`--help` prints
//! usage and exits.

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};
use crate::listener::{adopt_fd, TrackedListener};
use crate::log::fatal;

/// A parse/stringify handle for one registered flag.
pub(crate) trait FlagValue: Send + Sync {
    /// Apply a raw command-line argument.
    fn set(&self, flag: &str, raw: &str) -> Result<()>;
    /// Render the current value the way the child's argv should carry it.
    fn get(&self) -> String;
    /// Whether the flag consumes an argument (`false` for bare booleans).
    fn takes_value(&self) -> bool {
        true
    }
}

/// Typed identity the replicator dispatches on.
pub(crate) enum FlagRole {
    /// A listener flag; carries the handle so bound listeners can be found.
    Listener(Arc<ListenFlag>),
    /// The fork flag; never passed to children.
    Fork,
    /// Everything else is replicated textually.
    Plain,
}

pub(crate) struct FlagEntry {
    pub(crate) name: String,
    help: String,
    default: String,
    pub(crate) role: FlagRole,
    pub(crate) value: Arc<dyn FlagValue>,
}

impl FlagEntry {
    pub(crate) fn plain(name: &str, help: &str, value: Arc<dyn FlagValue>) -> Self {
        Self::with_role(name, help, FlagRole::Plain, value)
    }

    pub(crate) fn with_role(
        name: &str,
        help: &str,
        role: FlagRole,
        value: Arc<dyn FlagValue>,
    ) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            default: value.get(),
            role,
            value,
        }
    }
}

/// The set of flags an application declares.
///
/// Declaration order is preserved; the replicator walks it when rebuilding
/// a child's command line.
pub struct FlagSet {
    program: String,
    entries: Vec<FlagEntry>,
    positional: Vec<String>,
}

impl FlagSet {
    /// Create an empty flag set. `program` is only used in usage output.
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            entries: Vec::new(),
            positional: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, entry: FlagEntry) {
        if self.entries.iter().any(|e| e.name == entry.name) {
            fatal!(flag = %entry.name, "flag registered twice");
        }
        self.entries.push(entry);
    }

    pub(crate) fn entries(&self) -> &[FlagEntry] {
        &self.entries
    }

    /// Register a listener flag. The default address must resolve.
    pub fn listener(
        &mut self,
        name: &str,
        network: Network,
        default_addr: &str,
        proto: &str,
    ) -> Arc<ListenFlag> {
        let addr = match resolve(network, name, default_addr) {
            Ok(addr) => addr,
            Err(e) => {
                fatal!(flag = name, default = default_addr, error = %e,
                    "failed to resolve default listen address")
            }
        };
        let flag = Arc::new(ListenFlag {
            proto: proto.to_string(),
            network,
            state: Mutex::new(ListenState::Addr(addr)),
        });
        self.register(FlagEntry::with_role(
            name,
            &format!("Address on which to listen for {proto}"),
            FlagRole::Listener(flag.clone()),
            flag.clone(),
        ));
        flag
    }

    /// Register a string flag.
    pub fn string(&mut self, name: &str, default: &str, help: &str) -> Arc<StringFlag> {
        let flag = Arc::new(StringFlag {
            value: Mutex::new(default.to_string()),
        });
        self.register(FlagEntry::plain(name, help, flag.clone()));
        flag
    }

    /// Register an integer flag.
    pub fn integer(&mut self, name: &str, default: i64, help: &str) -> Arc<IntFlag> {
        let flag = Arc::new(IntFlag {
            value: AtomicI64::new(default),
        });
        self.register(FlagEntry::plain(name, help, flag.clone()));
        flag
    }

    /// Register a duration flag (humantime syntax, e.g. `15s`, `200ms`).
    pub fn duration(&mut self, name: &str, default: Duration, help: &str) -> Arc<DurationFlag> {
        let flag = Arc::new(DurationFlag {
            value: Mutex::new(default),
        });
        self.register(FlagEntry::plain(name, help, flag.clone()));
        flag
    }

    /// Arguments left over after flag parsing stopped.
    pub fn args(&self) -> &[String] {
        &self.positional
    }

    /// Parse the process command line (skipping argv\[0\]).
    pub fn parse(&mut self) -> Result<()> {
        let mut args = std::env::args();
        args.next();
        self.parse_from(args)
    }

    /// Parse the given arguments.
    pub fn parse_from<I>(&mut self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            if arg == "--" {
                self.positional.extend(args);
                break;
            }
            if !arg.starts_with('-') || arg == "-" {
                self.positional.push(arg);
                self.positional.extend(args);
                break;
            }
            let body = arg.strip_prefix("--").unwrap_or(&arg[1..]);
            if body == "h" || body == "help" {
                eprint!("{}", self.usage());
                std::process::exit(0);
            }
            let (name, inline) = match body.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (body, None),
            };
            let Some(entry) = self.entries.iter().find(|e| e.name == name) else {
                return Err(Error::UnknownFlag {
                    name: name.to_string(),
                });
            };
            let raw = match inline {
                Some(value) => value,
                None if entry.value.takes_value() => {
                    args.next().ok_or_else(|| Error::MissingValue {
                        flag: name.to_string(),
                    })?
                }
                None => "true".to_string(),
            };
            entry.value.set(&entry.name, &raw)?;
        }
        Ok(())
    }

    fn usage(&self) -> String {
        let mut out = format!("Usage of {}:\n", self.program);
        for entry in &self.entries {
            let _ = writeln!(out, "  --{}", entry.name);
            if entry.default.is_empty() {
                let _ = writeln!(out, "        {}", entry.help);
            } else {
                let _ = writeln!(out, "        {} (default {:?})", entry.help, entry.default);
            }
        }
        out
    }
}

/// Which address family a listener flag accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Either family; the first resolved address wins.
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl Network {
    fn wants(self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }

    fn unspecified(self) -> IpAddr {
        match self {
            Network::Tcp | Network::Tcp4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Network::Tcp6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// A resolved listen address that remembers whether the host part was
/// given, so `:port` round-trips through stringification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ListenAddr {
    ip: Option<IpAddr>,
    port: u16,
}

impl ListenAddr {
    fn socket_addr(&self, network: Network) -> SocketAddr {
        SocketAddr::new(self.ip.unwrap_or_else(|| network.unspecified()), self.port)
    }
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            Some(ip) => write!(f, "{}", SocketAddr::new(ip, self.port)),
            None => write!(f, ":{}", self.port),
        }
    }
}

fn invalid(flag: &str, value: &str, reason: impl Into<String>) -> Error {
    Error::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn resolve(network: Network, flag: &str, raw: &str) -> Result<ListenAddr> {
    if let Some(port) = raw.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| invalid(flag, raw, "bad port number"))?;
        return Ok(ListenAddr { ip: None, port });
    }
    let mut addrs = raw
        .to_socket_addrs()
        .map_err(|e| invalid(flag, raw, e.to_string()))?;
    match addrs.find(|a| network.wants(a)) {
        Some(addr) => Ok(ListenAddr {
            ip: Some(addr.ip()),
            port: addr.port(),
        }),
        None => Err(invalid(flag, raw, "no address for the requested network")),
    }
}

enum ListenState {
    /// Resolved host:port, waiting for `listen` to bind.
    Addr(ListenAddr),
    /// Inherited descriptor number, waiting for `listen` to adopt it.
    Fd(RawFd),
    /// Listening.
    Bound(Arc<TrackedListener>),
}

/// A flag whose value is somewhere to listen: either an address to bind or
/// an inherited descriptor written as `&N`.
pub struct ListenFlag {
    proto: String,
    network: Network,
    state: Mutex<ListenState>,
}

impl ListenFlag {
    /// Bind a fresh listener or adopt the inherited descriptor, depending
    /// on how the flag was set. Idempotent once bound.
    pub async fn listen(&self) -> Result<Arc<TrackedListener>> {
        enum Pending {
            Addr(ListenAddr),
            Fd(RawFd),
        }
        let pending = match &*self.state.lock().unwrap() {
            ListenState::Bound(listener) => return Ok(listener.clone()),
            ListenState::Addr(addr) => Pending::Addr(*addr),
            ListenState::Fd(fd) => Pending::Fd(*fd),
        };
        let listener = match pending {
            Pending::Addr(addr) => {
                let inner =
                    tokio::net::TcpListener::bind(addr.socket_addr(self.network)).await?;
                let listener = TrackedListener::from_tokio(inner)?;
                info!(proto = %self.proto, addr = %listener.local_addr(),
                    "listening on fresh socket");
                listener
            }
            Pending::Fd(fd) => {
                let listener = adopt_fd(fd)?;
                info!(proto = %self.proto, fd, addr = %listener.local_addr(),
                    "listening on inherited descriptor");
                listener
            }
        };
        *self.state.lock().unwrap() = ListenState::Bound(listener.clone());
        Ok(listener)
    }

    /// The tracked listener, if `listen` has been called.
    pub(crate) fn bound(&self) -> Option<Arc<TrackedListener>> {
        match &*self.state.lock().unwrap() {
            ListenState::Bound(listener) => Some(listener.clone()),
            _ => None,
        }
    }
}

impl FlagValue for ListenFlag {
    fn set(&self, flag: &str, raw: &str) -> Result<()> {
        if raw.is_empty() {
            return Err(Error::EmptyValue {
                flag: flag.to_string(),
            });
        }
        if let Some(fd) = raw.strip_prefix('&') {
            let fd: RawFd = fd
                .parse()
                .map_err(|_| invalid(flag, raw, "bad descriptor number"))?;
            if fd < 0 {
                return Err(invalid(flag, raw, "descriptor number must not be negative"));
            }
            *self.state.lock().unwrap() = ListenState::Fd(fd);
            return Ok(());
        }
        let addr = resolve(self.network, flag, raw)?;
        *self.state.lock().unwrap() = ListenState::Addr(addr);
        Ok(())
    }

    fn get(&self) -> String {
        match &*self.state.lock().unwrap() {
            ListenState::Addr(addr) => addr.to_string(),
            ListenState::Fd(fd) => format!("&{fd}"),
            ListenState::Bound(listener) => listener.local_addr().to_string(),
        }
    }
}

impl std::fmt::Display for ListenFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.get())
    }
}

/// A plain string flag.
pub struct StringFlag {
    value: Mutex<String>,
}

impl StringFlag {
    /// The current value.
    pub fn value(&self) -> String {
        self.value.lock().unwrap().clone()
    }
}

impl FlagValue for StringFlag {
    fn set(&self, _flag: &str, raw: &str) -> Result<()> {
        *self.value.lock().unwrap() = raw.to_string();
        Ok(())
    }

    fn get(&self) -> String {
        self.value()
    }
}

/// A plain integer flag.
pub struct IntFlag {
    value: AtomicI64,
}

impl IntFlag {
    /// The current value.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

impl FlagValue for IntFlag {
    fn set(&self, flag: &str, raw: &str) -> Result<()> {
        let value: i64 = raw
            .parse()
            .map_err(|_| invalid(flag, raw, "not an integer"))?;
        self.value.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self) -> String {
        self.value().to_string()
    }
}

/// A duration flag in humantime syntax.
pub struct DurationFlag {
    value: Mutex<Duration>,
}

impl DurationFlag {
    /// The current value.
    pub fn value(&self) -> Duration {
        *self.value.lock().unwrap()
    }
}

impl FlagValue for DurationFlag {
    fn set(&self, flag: &str, raw: &str) -> Result<()> {
        let value = humantime::parse_duration(raw).map_err(|e| invalid(flag, raw, e.to_string()))?;
        *self.value.lock().unwrap() = value;
        Ok(())
    }

    fn get(&self) -> String {
        humantime::format_duration(self.value()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_all_argument_forms() {
        let mut flags = FlagSet::new("test");
        let name = flags.string("name", "", "a name");
        let count = flags.integer("count", 1, "a count");
        let delay = flags.duration("delay", Duration::ZERO, "a delay");

        flags
            .parse_from(strings(&["--name=alpha", "-count", "3", "--delay", "5s"]))
            .unwrap();
        assert_eq!(name.value(), "alpha");
        assert_eq!(count.value(), 3);
        assert_eq!(delay.value(), Duration::from_secs(5));
    }

    #[test]
    fn stops_at_terminator_and_positionals() {
        let mut flags = FlagSet::new("test");
        let name = flags.string("name", "", "a name");
        flags
            .parse_from(strings(&["--name=x", "--", "--name=y", "tail"]))
            .unwrap();
        assert_eq!(name.value(), "x");
        assert_eq!(flags.args(), &["--name=y".to_string(), "tail".to_string()]);

        let mut flags = FlagSet::new("test");
        flags.string("name", "", "a name");
        flags
            .parse_from(strings(&["positional", "--name=y"]))
            .unwrap();
        assert_eq!(
            flags.args(),
            &["positional".to_string(), "--name=y".to_string()]
        );
    }

    #[test]
    fn rejects_unknown_and_missing() {
        let mut flags = FlagSet::new("test");
        flags.string("name", "", "a name");

        let err = flags.parse_from(strings(&["--bogus=1"])).unwrap_err();
        assert!(matches!(err, Error::UnknownFlag { .. }));

        let err = flags.parse_from(strings(&["--name"])).unwrap_err();
        assert!(matches!(err, Error::MissingValue { .. }));
    }

    #[test]
    fn listen_flag_parses_addresses_and_descriptors() {
        let mut flags = FlagSet::new("test");
        let echo = flags.listener("echo", Network::Tcp, ":12112", "echo");
        assert_eq!(echo.to_string(), ":12112");

        flags.parse_from(strings(&["--echo=127.0.0.1:8080"])).unwrap();
        assert_eq!(echo.to_string(), "127.0.0.1:8080");

        flags.parse_from(strings(&["--echo=:9090"])).unwrap();
        assert_eq!(echo.to_string(), ":9090");

        flags.parse_from(strings(&["--echo=&7"])).unwrap();
        assert_eq!(echo.to_string(), "&7");

        let err = flags.parse_from(strings(&["--echo="])).unwrap_err();
        assert!(matches!(err, Error::EmptyValue { .. }));

        let err = flags.parse_from(strings(&["--echo=&-2"])).unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));

        let err = flags
            .parse_from(strings(&["--echo=not-an-address"]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn listen_binds_and_is_idempotent() {
        let mut flags = FlagSet::new("test");
        let echo = flags.listener("echo", Network::Tcp, "127.0.0.1:0", "echo");
        let first = echo.listen().await.unwrap();
        let second = echo.listen().await.unwrap();
        assert_eq!(first.local_addr(), second.local_addr());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn inherited_descriptor_round_trips() {
        // Bind a listener, hand its duplicated descriptor to a fresh flag
        // set the way a restarted child would receive it, and check the
        // adopted listener serves the same address.
        let mut flags = FlagSet::new("parent");
        let parent = flags.listener("echo", Network::Tcp, "127.0.0.1:0", "echo");
        let listener = parent.listen().await.unwrap();
        let addr = listener.local_addr();
        let file = listener.file().unwrap();

        let mut child_flags = FlagSet::new("child");
        let child = child_flags.listener("echo", Network::Tcp, ":12112", "echo");
        // The flag owns the descriptor once the argument is applied.
        let fd = file.into_raw_fd();
        child_flags.parse_from(vec![format!("--echo=&{fd}")]).unwrap();
        assert_eq!(child.to_string(), format!("&{fd}"));

        let inherited = child.listen().await.unwrap();
        assert_eq!(inherited.local_addr().port(), addr.port());

        // Stop the original listener's accept path; the adopted one must
        // still produce connections.
        listener.close().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let conn = inherited.accept().await.unwrap();
        assert_eq!(inherited.active_connections(), 1);
        drop(conn);
        drop(client);
    }
}
