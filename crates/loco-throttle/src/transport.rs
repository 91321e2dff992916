//! Byte-stream transports to a command station
//!
//! The connection task is generic over any `AsyncRead + AsyncWrite` stream:
//! a serial port, a TCP socket, or one end of `tokio::io::duplex()` wired to
//! a virtual command station.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

use crate::config::TransportConfig;
use crate::error::ThrottleError;

/// Stream a connection task can own
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Open a serial port
pub fn open_serial(port: &str, baud_rate: u32) -> Result<SerialStream, ThrottleError> {
    let stream = tokio_serial::new(port, baud_rate)
        .timeout(Duration::from_millis(100))
        .open_native_async()
        .map_err(|e| ThrottleError::Io(io::Error::other(e)))?;
    info!("Opened serial port {} at {} baud", port, baud_rate);
    Ok(stream)
}

/// Connect to a network command station or bus bridge
pub async fn open_tcp(host: &str, port: u16) -> Result<TcpStream, ThrottleError> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    info!("Connected to {}:{}", host, port);
    Ok(stream)
}

/// Open the transport a configuration names
///
/// [`TransportConfig::Virtual`] has no stream of its own; callers supply one
/// to `LayoutConnection::with_io` instead.
pub async fn open(transport: &TransportConfig) -> Result<Box<dyn AsyncIo>, ThrottleError> {
    match transport {
        TransportConfig::Serial { port, baud_rate } => {
            Ok(Box::new(open_serial(port, *baud_rate)?))
        }
        TransportConfig::Tcp { host, port } => Ok(Box::new(open_tcp(host, *port).await?)),
        TransportConfig::Virtual => Err(ThrottleError::InvalidValue(
            "virtual transport has no stream; pass one to LayoutConnection::with_io".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_virtual_needs_stream() {
        let err = open(&TransportConfig::Virtual).await.err().unwrap();
        assert!(matches!(err, ThrottleError::InvalidValue(_)));
    }

    #[tokio::test]
    async fn test_tcp_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut io = open(&TransportConfig::Tcp {
            host: "127.0.0.1".into(),
            port,
        })
        .await
        .unwrap();
        io.write_all(b"<s>\n").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"<s>\n");
    }

    #[tokio::test]
    async fn test_missing_serial_port() {
        assert!(open_serial("/dev/does-not-exist-loco", 115200).is_err());
    }
}
