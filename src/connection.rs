use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::resp::{Decoded, Resp, RespError};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error")]
    Io(#[from] tokio::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] RespError),

    #[error("connection closed in the middle of a frame")]
    Truncated,
}

/// A TCP stream with a read buffer, so frames split across reads (or several
/// frames in one read) are handled by the decoder rather than by the caller.
#[derive(Debug)]
pub struct Connection {
    tcp: TcpStream,
    pub addr: SocketAddr,
    buffer: BytesMut,
}

impl Connection {
    pub fn new((tcp, addr): (TcpStream, SocketAddr)) -> Self {
        Self {
            tcp,
            addr,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    pub async fn connect(addr: &str) -> Result<Self, ConnectionError> {
        let tcp = TcpStream::connect(addr).await?;
        let peer = tcp.peer_addr()?;
        Ok(Self::new((tcp, peer)))
    }

    pub async fn read_frame(&mut self) -> Result<Option<Resp>, ConnectionError> {
        Ok(self.read_frame_with_len().await?.map(|(frame, _)| frame))
    }

    /// Next frame plus its encoded size. `None` on a clean EOF.
    ///
    /// Cancel safe: partial input stays in the buffer, so this can sit in a
    /// `select!` arm.
    pub async fn read_frame_with_len(&mut self) -> Result<Option<(Resp, usize)>, ConnectionError> {
        self.read_with(Resp::decode).await
    }

    /// Reads the `$<len>\r\n<bytes>` payload sent after `+FULLRESYNC`.
    pub async fn read_snapshot(&mut self) -> Result<Bytes, ConnectionError> {
        match self.read_with(Resp::decode_snapshot).await? {
            Some((snapshot, _)) => Ok(snapshot),
            None => Err(ConnectionError::Truncated),
        }
    }

    async fn read_with<T>(
        &mut self,
        decode: impl Fn(&[u8]) -> Decoded<T>,
    ) -> Result<Option<(T, usize)>, ConnectionError> {
        loop {
            if let Some((value, used)) = decode(&self.buffer)? {
                self.buffer.advance(used);
                return Ok(Some((value, used)));
            }
            if self.tcp.read_buf(&mut self.buffer).await? == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(ConnectionError::Truncated)
                };
            }
        }
    }

    pub async fn write_frame(&mut self, frame: &Resp) -> Result<(), ConnectionError> {
        self.write_all(&frame.encode()).await
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.tcp.write_all(bytes).await?;
        self.tcp.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.tcp.shutdown().await?;
        Ok(())
    }
}
