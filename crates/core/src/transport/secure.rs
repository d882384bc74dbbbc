/// Authenticated, encrypted framing over an upgraded connection
///
/// Each frame is a little-endian `u32` length followed by a ChaCha20-Poly1305
/// ciphertext. Every direction has its own key and a nonce counter that starts
/// at zero, so nonces never repeat under one key.

use super::connection::RawConnection;
use crate::address::Multiaddr;
use crate::identity::{PeerId, PublicKey};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use std::fmt;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tordht_common::protocol::MAX_FRAME_SIZE;

/// Poly1305 tag length
const TAG_LEN: usize = 16;

/// One direction of the channel
pub(crate) struct FrameCipher {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl FrameCipher {
    pub(crate) fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(&key.into()),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], ChannelError> {
        if self.counter == u64::MAX {
            return Err(ChannelError::NonceExhausted);
        }
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        Ok(nonce)
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ChannelError::Encrypt)
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| ChannelError::Decrypt)
    }
}

/// Secure channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Frame failed authentication")]
    Decrypt,

    #[error("Nonce counter exhausted")]
    NonceExhausted,
}

/// An upgraded connection to an authenticated peer
pub struct SecureConn {
    reader: SecureReader,
    writer: SecureWriter,
    remote_peer: PeerId,
    remote_key: PublicKey,
    local_addr: Multiaddr,
    remote_addr: Multiaddr,
}

impl SecureConn {
    pub(crate) fn new(
        conn: RawConnection,
        remote_key: PublicKey,
        send_key: [u8; 32],
        recv_key: [u8; 32],
    ) -> Self {
        let local_addr = conn.local_addr().clone();
        let remote_addr = conn.remote_addr().clone();
        let (read, write) = tokio::io::split(conn);

        Self {
            reader: SecureReader {
                inner: read,
                cipher: FrameCipher::new(recv_key),
            },
            writer: SecureWriter {
                inner: write,
                cipher: FrameCipher::new(send_key),
            },
            remote_peer: PeerId::from_public_key(&remote_key),
            remote_key,
            local_addr,
            remote_addr,
        }
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn remote_public_key(&self) -> &PublicKey {
        &self.remote_key
    }

    pub fn local_addr(&self) -> &Multiaddr {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    pub async fn send_frame(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.writer.send_frame(data).await
    }

    pub async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        self.reader.recv_frame().await
    }

    /// Separate the halves so reading and writing can run in different tasks
    pub fn split(self) -> (SecureReader, SecureWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for SecureConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureConn")
            .field("remote_peer", &self.remote_peer)
            .field("remote_addr", &self.remote_addr.to_string())
            .finish()
    }
}

pub struct SecureReader {
    inner: ReadHalf<RawConnection>,
    cipher: FrameCipher,
}

impl SecureReader {
    /// Next frame, or `None` once the peer closed the stream between frames
    pub async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE + TAG_LEN {
            return Err(ChannelError::FrameTooLarge(len));
        }

        let mut ciphertext = vec![0u8; len];
        self.inner.read_exact(&mut ciphertext).await?;
        self.cipher.open(&ciphertext).map(Some)
    }
}

pub struct SecureWriter {
    inner: WriteHalf<RawConnection>,
    cipher: FrameCipher,
}

impl SecureWriter {
    pub async fn send_frame(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge(data.len()));
        }
        let ciphertext = self.cipher.seal(data)?;

        self.inner
            .write_all(&(ciphertext.len() as u32).to_le_bytes())
            .await?;
        self.inner.write_all(&ciphertext).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
