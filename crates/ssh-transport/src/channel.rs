//! Channel handles usable from blocking worker threads.
//!
//! Locking order is always session first, then channel. The session mutex is
//! the only thing standing between libssh2 and concurrent access, so every
//! method here takes it before touching the channel, and restores blocking
//! mode before releasing it.

use std::io;
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;

/// Session plus the pieces needed to force-close it. Shared between the
/// transport and every channel opened through it.
pub struct LockedSession {
    pub(crate) session: Mutex<ssh2::Session>,
    pub(crate) tcp: TcpStream,
    pub(crate) alive: AtomicBool,
}

/// One direct-tcpip channel. Reads are polled non-blockingly so a copy loop
/// can interleave with other users of the session; writes block until the
/// remote window drains.
pub struct SshChannel {
    locked: std::sync::Arc<LockedSession>,
    channel: Mutex<ssh2::Channel>,
}

impl SshChannel {
    pub(crate) fn new(locked: std::sync::Arc<LockedSession>, channel: ssh2::Channel) -> Self {
        Self {
            locked,
            channel: Mutex::new(channel),
        }
    }

    /// Write the whole buffer to the channel.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        use std::io::Write;
        let session = self.locked.session.lock();
        session.set_blocking(true);
        let mut channel = self.channel.lock();
        channel.write_all(data)?;
        channel.flush()
    }

    /// Attempt a read without blocking. `Ok(None)` means no data is pending,
    /// `Ok(Some(0))` means the remote side sent EOF.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        use std::io::Read;
        let session = self.locked.session.lock();
        session.set_blocking(false);
        let mut channel = self.channel.lock();
        let result = match channel.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        };
        drop(channel);
        session.set_blocking(true);
        result
    }

    /// Signal EOF and close the channel. Best effort; safe to call twice.
    pub fn close(&self) {
        let session = self.locked.session.lock();
        session.set_blocking(true);
        let mut channel = self.channel.lock();
        let _ = channel.send_eof();
        let _ = channel.close();
    }
}

impl Drop for SshChannel {
    fn drop(&mut self) {
        if let Some(session) = self.locked.session.try_lock() {
            session.set_blocking(true);
            if let Some(mut channel) = self.channel.try_lock() {
                let _ = channel.close();
            }
        }
    }
}

/// Remote listener backing the remote-forward variant. Accepts are polled so
/// the session lock is never held across a blocking wait.
pub struct SshRemoteListener {
    locked: std::sync::Arc<LockedSession>,
    listener: Mutex<ssh2::Listener>,
    bound_port: u16,
}

impl SshRemoteListener {
    pub(crate) fn new(
        locked: std::sync::Arc<LockedSession>,
        listener: ssh2::Listener,
        bound_port: u16,
    ) -> Self {
        Self {
            locked,
            listener: Mutex::new(listener),
            bound_port,
        }
    }

    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    /// Poll for an inbound channel open. `Ok(None)` when nothing is pending.
    pub fn try_accept(&self) -> io::Result<Option<SshChannel>> {
        const EAGAIN: i32 = -37; // LIBSSH2_ERROR_EAGAIN

        let session = self.locked.session.lock();
        session.set_blocking(false);
        let mut listener = self.listener.lock();
        let result = match listener.accept() {
            Ok(channel) => Ok(Some(SshChannel::new(self.locked.clone(), channel))),
            Err(err) if err.code() == ssh2::ErrorCode::Session(EAGAIN) => Ok(None),
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
        };
        drop(listener);
        session.set_blocking(true);
        result
    }
}
