use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::error::{Result, TesseraError};
use crate::protocol::frame::{Frame, FrameHeader, HEADER_LEN};

/// Async framed transport.
///
/// Frames are written header-first as one buffer and read back header-first,
/// so a reader never allocates for a body whose header failed validation.
///
/// # Wire Protocol
///
/// ```text
/// [version u8][flags u8][stream i16][opcode u8][length u32] [body ...]
/// ```
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use tessera_common::transport::FrameTransport;
/// use tessera_common::protocol::{Frame, Opcode};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr = "127.0.0.1:9042".parse()?;
/// let mut stream = FrameTransport::connect(addr, Duration::from_secs(5)).await?;
/// FrameTransport::write_frame(&mut stream, &Frame::request(0, Opcode::Options, &b""[..])).await?;
/// let reply = FrameTransport::read_frame(&mut stream).await?;
/// # Ok(())
/// # }
/// ```
pub struct FrameTransport;

impl FrameTransport {
    /// Connects to `addr`, giving up after `timeout`.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TesseraError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| TesseraError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| TesseraError::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

        Ok(stream)
    }

    /// Writes one frame and flushes.
    pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = frame.encode()?;

        writer
            .write_all(&encoded)
            .await
            .map_err(|e| Self::map_io_error(e, "writing frame"))?;

        writer
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream"))?;

        Ok(())
    }

    /// Reads one frame.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly between
    /// frames. EOF in the middle of a frame is an error.
    pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header_buf = [0u8; HEADER_LEN];
        let first = reader
            .read(&mut header_buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading frame header"))?;
        if first == 0 {
            return Ok(None);
        }
        reader
            .read_exact(&mut header_buf[first..])
            .await
            .map_err(|e| Self::map_io_error(e, "reading frame header"))?;

        let header = FrameHeader::decode(&header_buf)?;

        let mut body = vec![0u8; header.length];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| Self::map_io_error(e, "reading frame body"))?;

        Ok(Some(Frame::from_parts(header, Bytes::from(body))))
    }

    /// Map IO errors to appropriate TesseraError variants
    ///
    /// - Connection resets and EOF -> `Connection`
    /// - Other IO errors -> `Io`
    fn map_io_error(err: std::io::Error, context: &str) -> TesseraError {
        match err.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => {
                TesseraError::Connection(format!("{}: Connection lost", context))
            }
            _ => TesseraError::Io(err),
        }
    }
}
