use crate::address::Multiaddr;
use crate::session::{AnonListener, BoxedStream, SessionError};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tordht_common::OnionService;

/// A session stream tagged with its local and remote addresses, not yet upgraded
pub struct RawConnection {
    stream: BoxedStream,
    local: Multiaddr,
    remote: Multiaddr,
}

impl RawConnection {
    pub fn new(stream: BoxedStream, local: Multiaddr, remote: Multiaddr) -> Self {
        Self {
            stream,
            local,
            remote,
        }
    }

    pub fn local_addr(&self) -> &Multiaddr {
        &self.local
    }

    /// Empty for inbound onion connections: the dialer is anonymous
    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote
    }

    /// Shut the stream down; consumes the connection so it closes once
    pub async fn close(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

impl fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection")
            .field("local", &self.local.to_string())
            .field("remote", &self.remote.to_string())
            .finish()
    }
}

impl AsyncRead for RawConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for RawConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// A published onion service yielding [`RawConnection`]s
pub struct RawListener {
    inner: Box<dyn AnonListener>,
    local: Multiaddr,
}

impl RawListener {
    pub fn new(inner: Box<dyn AnonListener>, local: Multiaddr) -> Self {
        Self { inner, local }
    }

    pub fn local_addr(&self) -> &Multiaddr {
        &self.local
    }

    pub fn service(&self) -> &OnionService {
        self.inner.service()
    }

    pub async fn accept(&mut self) -> Result<RawConnection, SessionError> {
        let stream = self.inner.accept().await?;
        Ok(RawConnection::new(
            stream,
            self.local.clone(),
            Multiaddr::empty(),
        ))
    }

    pub async fn close(&mut self) -> Result<(), SessionError> {
        self.inner.close().await
    }
}
