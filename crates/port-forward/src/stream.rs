//! Seams between the forwarder and the SSH layer.
//!
//! The forwarder only knows how to pump bytes; where the far end of a pair
//! comes from is behind these traits, so tests can substitute plain TCP.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use outpost_ssh_transport::{SshChannel, SshRemoteListener, SshTransport};

use crate::error::ForwardError;

/// One proxied byte stream. Writes block; reads are polled so a copy loop can
/// also watch its shutdown flag.
pub trait ForwardStream: Send + Sync {
    /// Write the whole buffer.
    fn write_all(&self, data: &[u8]) -> io::Result<()>;
    /// `Ok(None)` when no data is pending, `Ok(Some(0))` on EOF.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;
    /// Close both directions. Safe to call more than once.
    fn close(&self);
}

impl ForwardStream for SshChannel {
    fn write_all(&self, data: &[u8]) -> io::Result<()> {
        SshChannel::write_all(self, data)
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        SshChannel::try_read(self, buf)
    }

    fn close(&self) {
        SshChannel::close(self)
    }
}

/// Opens the far end of a local-forward pair.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open_forward(
        &self,
        host: &str,
        port: u16,
        src: (String, u16),
    ) -> Result<Box<dyn ForwardStream>, ForwardError>;
}

#[async_trait]
impl ChannelOpener for SshTransport {
    async fn open_forward(
        &self,
        host: &str,
        port: u16,
        src: (String, u16),
    ) -> Result<Box<dyn ForwardStream>, ForwardError> {
        let channel = self.open_channel(host, port, Some(src)).await?;
        Ok(Box::new(channel))
    }
}

/// Accept side of a remote forward.
pub trait RemoteAcceptor: Send + Sync {
    /// Poll for an inbound channel open. `Ok(None)` when nothing is pending.
    fn try_accept(&self) -> io::Result<Option<Box<dyn ForwardStream>>>;
}

impl RemoteAcceptor for SshRemoteListener {
    fn try_accept(&self) -> io::Result<Option<Box<dyn ForwardStream>>> {
        Ok(SshRemoteListener::try_accept(self)?
            .map(|channel| Box::new(channel) as Box<dyn ForwardStream>))
    }
}

/// Requests a remote listener for the remote-forward variant.
#[async_trait]
pub trait RemoteListenProvider: Send + Sync {
    async fn listen_remote(
        &self,
        bind_host: &str,
        bind_port: u16,
    ) -> Result<Arc<dyn RemoteAcceptor>, ForwardError>;
}

#[async_trait]
impl RemoteListenProvider for SshTransport {
    async fn listen_remote(
        &self,
        bind_host: &str,
        bind_port: u16,
    ) -> Result<Arc<dyn RemoteAcceptor>, ForwardError> {
        let listener = SshTransport::listen_remote(self, bind_host, bind_port).await?;
        Ok(Arc::new(listener))
    }
}
