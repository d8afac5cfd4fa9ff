//! This module provides the configuration, error type and transport
//! abstraction shared by the `tokio` based monitor.
use crate::protocol as proto;
use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Represents all errors reported to callers of the monitor.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `proto::Error`.
    #[error(transparent)]
    Protocol(#[from] proto::Error),

    /// There is currently no live connection to the gateway.
    #[error("No active connection to the Modbus gateway")]
    NotConnected,

    /// The monitor has been closed.
    #[error("Monitor is closed")]
    Closed,

    /// Wraps `std::io::Error`.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The result type for tokio operations.
pub type Result<T> = std::result::Result<T, crate::tokio_common::Error>;

/// Timing of the monitor loops.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct MonitorConfig {
    /// Timeout for establishing the TCP connection.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub connect_timeout: Duration,
    /// Silence after which the connection is presumed dead.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub read_timeout: Duration,
    /// Pause after a failed connection attempt.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub reconnect_delay: Duration,
    /// Pause before a crashed loop is restarted.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub error_backoff: Duration,
    /// A slave without updates for longer than this becomes unavailable.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub availability_timeout: Duration,
    /// Period of the availability check.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub sweep_interval: Duration,
    /// Minimum time between two change notifications.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub notify_interval: Duration,
    /// Pause after each processed batch of received bytes.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub batch_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            error_backoff: Duration::from_secs(5),
            availability_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(15),
            notify_interval: Duration::from_secs(5),
            batch_delay: Duration::from_millis(100),
        }
    }
}

/// Opens the byte stream to the gateway.
///
/// The monitor calls [`Connector::connect`] whenever it has no live
/// connection. The returned halves are owned by the read loop and the write
/// path respectively.
pub trait Connector: fmt::Display + Send + Sync + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> impl Future<Output = io::Result<(Self::Reader, Self::Writer)>> + Send;
}

/// Connects to a serial-to-TCP gateway.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector for `address` (`host:port`).
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl Connector for TcpConnector {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn connect(&self) -> impl Future<Output = io::Result<(Self::Reader, Self::Writer)>> + Send {
        async move {
            let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect timed out after {:?}", self.timeout),
                    )
                })??;
            stream.set_nodelay(true)?;
            Ok(stream.into_split())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.availability_timeout, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(15));
        assert_eq!(config.notify_interval, Duration::from_secs(5));
        assert_eq!(config.read_timeout, Duration::from_secs(30));
    }

    #[test]
    fn error_conversion() {
        let error: Error = proto::Error::SetpointOutOfRange(7000.0).into();
        assert_matches!(error, Error::Protocol(proto::Error::SetpointOutOfRange(_)));
        assert_eq!(
            Error::NotConnected.to_string(),
            "No active connection to the Modbus gateway"
        );
    }

    #[tokio::test]
    async fn tcp_connector_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let connector = TcpConnector::new(address.clone(), Duration::from_secs(1));
        assert_eq!(connector.to_string(), address);

        let (client, server) = tokio::join!(connector.connect(), listener.accept());
        let (mut reader, mut writer) = client.unwrap();
        let (mut socket, _) = server.unwrap();

        writer.write_all(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 3];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3]);

        socket.write_all(&[4]).await.unwrap();
        assert_eq!(reader.read_u8().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn tcp_connector_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);
        let connector = TcpConnector::new(address.to_string(), Duration::from_secs(1));
        assert!(connector.connect().await.is_err());
    }
}
