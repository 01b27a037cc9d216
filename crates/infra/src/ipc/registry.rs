//! Singleton waiter registry over Unix datagram sockets
//!
//! At most one waiter owns a given channel name at a time. Every probe,
//! unlink, and bind of the channel socket happens while holding an exclusive
//! advisory lock on a sidecar `<name>.lock` file, so concurrent claimants
//! serialize and exactly one wins, including when the socket on disk was
//! left behind by a crashed owner. The kernel drops the lock at process
//! exit, so a crash never wedges the name.
//!
//! Senders locate the owner by name. The kernel queue behind the socket
//! gives the channel its bounded-capacity semantics: an unread backlog turns
//! sends into [`RegistryError::Full`] instead of blocking the sender.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::message::{SwitchProfileRequest, MESSAGE_LIMIT};

/// How long a waiter blocks per receive attempt before rechecking its stop
/// flag.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout for the liveness probe against a possibly-stale socket.
pub const CONNECT_PROBE: Duration = Duration::from_millis(100);

#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(not(target_os = "linux"))]
const ENOBUFS: i32 = 55;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Another live process already owns the channel.
    #[error("channel {name:?} already has a live owner")]
    AlreadyExists { name: String },

    /// No live owner for the channel.
    #[error("no live owner for channel {name:?}")]
    NotFound { name: String },

    /// The owner's receive queue is full.
    #[error("channel queue is full")]
    Full,

    /// The encoded message exceeds [`MESSAGE_LIMIT`].
    #[error("message of {0} bytes exceeds the channel message limit")]
    MessageTooLarge(usize),

    /// The payload did not decode as a switch-profile request.
    #[error("malformed channel message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("channel i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// Filesystem namespace where channel sockets live.
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Registry in the conventional per-user location.
    pub fn system() -> Self {
        let root = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(root)
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.lock"))
    }

    /// Take the name's sidecar lock, or [`RegistryError::AlreadyExists`] if
    /// another process holds it.
    fn acquire_lock(&self, name: &str) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.lock_path(name))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(RegistryError::AlreadyExists { name: name.into() })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// With the name's lock held: remove the socket at `path` if nothing
    /// answers on it. `false` means a live owner is still attached.
    fn reclaim(&self, path: &Path) -> Result<bool> {
        if has_live_owner(path)? {
            return Ok(false);
        }
        warn!(path = %path.display(), "Removing stale channel socket");
        remove_if_present(path)?;
        Ok(true)
    }

    /// Claim exclusive ownership of `name`.
    ///
    /// The whole sequence runs under the name's lock: a socket file left by
    /// a crashed owner is reclaimed before binding, and no concurrent
    /// claimant can unlink or rebind the path in between. Losers report
    /// [`RegistryError::AlreadyExists`].
    #[instrument(skip(self))]
    pub fn try_become_waiter(&self, name: &str) -> Result<WaiterEndpoint> {
        let lock = self.acquire_lock(name)?;
        let path = self.socket_path(name);
        if path.exists() && !self.reclaim(&path)? {
            // A socket with a live owner but no lock holder; respect it.
            return Err(RegistryError::AlreadyExists { name: name.into() });
        }
        let sock = UnixDatagram::bind(&path)?;
        Ok(WaiterEndpoint::new(sock, path, name, lock))
    }

    /// Fallback cleanup: remove the socket left behind by an owner that no
    /// longer exists. Returns `true` if a stale socket was removed; a live
    /// owner (holding the lock or answering on the socket) is left alone.
    #[instrument(skip(self))]
    pub fn remove_stale(&self, name: &str) -> Result<bool> {
        let _lock = match self.acquire_lock(name) {
            Ok(lock) => lock,
            Err(RegistryError::AlreadyExists { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let path = self.socket_path(name);
        if !path.exists() {
            return Ok(false);
        }
        self.reclaim(&path)
    }

    /// Connect to the channel's live owner.
    #[instrument(skip(self))]
    pub fn try_open_existing(&self, name: &str) -> Result<SwitchSender> {
        let path = self.socket_path(name);
        let sock = UnixDatagram::unbound()?;
        match sock.connect(&path) {
            Ok(()) => {
                sock.set_nonblocking(true)?;
                Ok(SwitchSender {
                    sock,
                    name: name.into(),
                })
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || e.kind() == io::ErrorKind::ConnectionRefused =>
            {
                Err(RegistryError::NotFound { name: name.into() })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// True if a process currently answers on the socket at `path`.
fn has_live_owner(path: &Path) -> Result<bool> {
    let probe = UnixDatagram::unbound()?;
    probe.set_write_timeout(Some(CONNECT_PROBE))?;
    match probe.connect(path) {
        Ok(()) => Ok(true),
        Err(e)
            if e.kind() == io::ErrorKind::ConnectionRefused
                || e.kind() == io::ErrorKind::NotFound =>
        {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// The owning side of a channel. Holding the endpoint is holding the
/// ownership token; dropping it releases the name for the next claimant.
///
/// The sidecar lock stays held for the endpoint's whole lifetime, so the
/// drop-time unlink runs under the same serialization as claims do.
#[derive(Debug)]
pub struct WaiterEndpoint {
    sock: UnixDatagram,
    path: PathBuf,
    name: String,
    _lock: File,
}

impl WaiterEndpoint {
    fn new(sock: UnixDatagram, path: PathBuf, name: &str, lock: File) -> Self {
        debug!(name, path = %path.display(), "Claimed waiter channel");
        Self {
            sock,
            path,
            name: name.into(),
            _lock: lock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive the next request, waiting at most `timeout`.
    ///
    /// Malformed datagrams are logged and skipped without consuming the
    /// remaining wait budget's worth of valid traffic. Returns `Ok(None)` on
    /// timeout.
    pub fn receive(&self, timeout: Duration) -> Result<Option<SwitchProfileRequest>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; MESSAGE_LIMIT];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // A zero timeout would mean "block forever" to the socket.
            self.sock.set_read_timeout(Some(remaining))?;
            match self.sock.recv(&mut buf) {
                Ok(n) => match SwitchProfileRequest::decode(&buf[..n]) {
                    Ok(request) => return Ok(Some(request)),
                    Err(e) => {
                        warn!(error = %e, "Discarding malformed channel message");
                        continue;
                    }
                },
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Release the channel name explicitly instead of via drop.
    pub fn release(self) {}
}

impl Drop for WaiterEndpoint {
    fn drop(&mut self) {
        if let Err(e) = remove_if_present(&self.path) {
            warn!(error = %e, path = %self.path.display(), "Failed to remove channel socket");
        } else {
            debug!(name = %self.name, "Released waiter channel");
        }
    }
}

/// The sending side of a channel, connected to a live owner.
#[derive(Debug)]
pub struct SwitchSender {
    sock: UnixDatagram,
    name: String,
}

impl SwitchSender {
    /// Send one request without blocking.
    ///
    /// A full owner queue reports [`RegistryError::Full`]; an owner that went
    /// away since the channel was opened reports [`RegistryError::NotFound`].
    #[instrument(skip(self, request), fields(profile = %request.profile))]
    pub fn send(&self, request: &SwitchProfileRequest) -> Result<()> {
        let bytes = request.encode()?;
        match self.sock.send(&bytes) {
            Ok(_) => {
                debug!(name = %self.name, "Sent switch-profile request");
                Ok(())
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.raw_os_error() == Some(ENOBUFS) =>
            {
                Err(RegistryError::Full)
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Err(RegistryError::NotFound {
                    name: self.name.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}
