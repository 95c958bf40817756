//! Byte transports to the controller.
//!
//! Two endpoint flavors: `host:port` reaches a serial-over-IP bridge via
//! TCP, anything without a colon is treated as a local serial device at
//! 9600-8N1. Both are exposed behind one boxed duplex stream so the client
//! (and its tests, via `tokio::io::duplex`) never care which one they got.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_serial::SerialPortBuilderExt;

use crate::error::{CzError, Result};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const BAUD_RATE: u32 = 9600;

/// Anything that can carry bus bytes in both directions.
pub trait BusStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + std::fmt::Debug {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + std::fmt::Debug> BusStream for T {}

pub type BoxedStream = Box<dyn BusStream>;

/// Open a transport for the given endpoint string.
pub async fn open(endpoint: &str) -> Result<BoxedStream> {
    if endpoint.contains(':') {
        open_tcp(endpoint).await
    } else {
        open_serial(endpoint)
    }
}

async fn open_tcp(endpoint: &str) -> Result<BoxedStream> {
    let (host, port) = endpoint
        .split_once(':')
        .ok_or_else(|| CzError::Unreachable(format!("malformed endpoint: {endpoint}")))?;
    if host.is_empty() {
        return Err(CzError::Unreachable(format!(
            "malformed endpoint (empty host): {endpoint}"
        )));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| CzError::Unreachable(format!("malformed endpoint (bad port): {endpoint}")))?;
    if port == 0 {
        return Err(CzError::Unreachable(format!(
            "malformed endpoint (port 0): {endpoint}"
        )));
    }

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| CzError::Unreachable(format!("connect to {endpoint} timed out")))?
        .map_err(|e| CzError::Unreachable(format!("connect to {endpoint} failed: {e}")))?;

    stream.set_nodelay(true)?;
    socket2::SockRef::from(&stream).set_keepalive(true)?;

    tracing::info!(endpoint, "connected to serial bridge");
    Ok(Box::new(stream))
}

fn open_serial(path: &str) -> Result<BoxedStream> {
    let stream = tokio_serial::new(path, BAUD_RATE)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .open_native_async()
        .map_err(|e| CzError::Unreachable(format!("open serial {path} failed: {e}")))?;

    tracing::info!(path, "opened serial port");
    Ok(Box::new(stream))
}
