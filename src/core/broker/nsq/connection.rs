use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use crate::core::broker::nsq::protocol::{
    extract_frame, Command, Frame, Identify, HEARTBEAT, MAGIC_V2, OK,
};
use crate::core::error::BrokerError;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Buffered frame decoder over the read half of a connection.
///
/// `read_frame` is cancel-safe: bytes already read stay in the buffer.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, BrokerError> {
        loop {
            if let Some(frame) = extract_frame(&mut self.buf) {
                return frame;
            }
            self.buf.reserve(READ_BUFFER_SIZE);
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(BrokerError::Closed);
            }
        }
    }
}

/// Command encoder over the write half of a connection.
pub struct CommandWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> CommandWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, cmd: &Command) -> Result<(), BrokerError> {
        self.buf.clear();
        cmd.encode_into(&mut self.buf);
        self.write_raw_buffered().await
    }

    async fn write_magic(&mut self) -> Result<(), BrokerError> {
        self.buf.clear();
        self.buf.extend_from_slice(MAGIC_V2);
        self.write_raw_buffered().await
    }

    async fn write_raw_buffered(&mut self) -> Result<(), BrokerError> {
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// A handshaken connection to one nsqd.
pub struct NsqConnection {
    addr: String,
    reader: FrameReader<OwnedReadHalf>,
    writer: CommandWriter<OwnedWriteHalf>,
}

impl NsqConnection {
    /// Dials `addr`, sends the protocol magic and `IDENTIFY`.
    pub async fn connect(
        addr: &str,
        dial_timeout: Duration,
        identify: &Identify,
    ) -> Result<Self, BrokerError> {
        let stream = timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BrokerError::Timeout(dial_timeout))??;
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();

        let mut conn = Self {
            addr: addr.to_string(),
            reader: FrameReader::new(r),
            writer: CommandWriter::new(w),
        };

        let handshake = async {
            conn.writer.write_magic().await?;
            conn.send(&identify.to_command()?).await?;
            conn.expect_ok().await
        };
        timeout(dial_timeout, handshake)
            .await
            .map_err(|_| BrokerError::Timeout(dial_timeout))??;

        trace!(target: "nsqdelay::nsq", addr, "handshake complete");
        Ok(conn)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn send(&mut self, cmd: &Command) -> Result<(), BrokerError> {
        self.writer.send(cmd).await
    }

    pub async fn read_frame(&mut self) -> Result<Frame, BrokerError> {
        self.reader.read_frame().await
    }

    /// Reads the next response, answering heartbeats along the way.
    pub async fn read_response(&mut self) -> Result<Bytes, BrokerError> {
        loop {
            match self.reader.read_frame().await? {
                Frame::Response(data) if &data[..] == HEARTBEAT => {
                    self.writer.send(&Command::Nop).await?;
                }
                Frame::Response(data) => return Ok(data),
                Frame::Error(data) => {
                    return Err(BrokerError::Rejected(
                        String::from_utf8_lossy(&data).into_owned(),
                    ))
                }
                Frame::Message(_) => {
                    return Err(BrokerError::Protocol(
                        "unexpected message frame while awaiting response".to_string(),
                    ))
                }
            }
        }
    }

    pub async fn expect_ok(&mut self) -> Result<(), BrokerError> {
        let data = self.read_response().await?;
        if &data[..] == OK {
            Ok(())
        } else {
            Err(BrokerError::Protocol(format!(
                "expected OK, got {:?}",
                String::from_utf8_lossy(&data)
            )))
        }
    }

    pub fn into_split(self) -> (FrameReader<OwnedReadHalf>, CommandWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}
