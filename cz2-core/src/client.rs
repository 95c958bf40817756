//! Bus client for the ComfortZone II master panel.
//!
//! The bus is shared with other masters, so every exchange is
//! scan-and-correlate: write our frame, then sift through whatever shows up
//! until we see a reply addressed to us. Transport failures are retried with
//! a fixed spacing; protocol failures are not.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{CzError, Result};
use crate::frame::{build_message, scan_frame, Frame, Function, MAX_MESSAGE_SIZE};
use crate::model::{FanMode, SystemMode, SystemStatus};
use crate::status::{decode_status, RowCache};
use crate::transport::{self, BoxedStream};

/// Soft per-read deadline; expiry yields an empty read, not an error.
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive empty reads tolerated before declaring the link dead.
const MAX_EMPTY_READS: u32 = 50;
/// Scan buffer high-water mark; beyond this only the tail is retained.
const BUFFER_LIMIT: usize = 10 * MAX_MESSAGE_SIZE;
/// Settle time between writing a request and scanning for the reply.
const REPLY_SETTLE: Duration = Duration::from_millis(20);
/// Frames inspected per attempt while hunting for our reply.
const MAX_REPLY_ATTEMPTS: usize = 5;
/// Transport-error retry budget and spacing.
const RETRY_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// The ordered read set behind one status snapshot. The device address for
/// each read is the table number.
const READ_QUERIES: [(u8, u8); 9] = [
    (9, 3),
    (9, 4),
    (9, 5),
    (1, 9),
    (1, 12),
    (1, 16),
    (1, 17),
    (1, 18),
    (1, 24),
];

/// How the client obtains a transport. The default connects to the
/// configured endpoint; tests substitute in-memory duplex streams.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<BoxedStream>;
}

struct EndpointConnector {
    endpoint: String,
}

#[async_trait]
impl Connector for EndpointConnector {
    async fn open(&self) -> Result<BoxedStream> {
        transport::open(&self.endpoint).await
    }
}

pub struct CzClient {
    connector: Box<dyn Connector>,
    zone_count: u8,
    device_id: u8,
    stream: Option<BoxedStream>,
    buffer: Vec<u8>,
}

impl CzClient {
    pub fn new(endpoint: impl Into<String>, zone_count: u8, device_id: u8) -> Self {
        Self::with_connector(
            Box::new(EndpointConnector {
                endpoint: endpoint.into(),
            }),
            zone_count,
            device_id,
        )
    }

    pub fn with_connector(connector: Box<dyn Connector>, zone_count: u8, device_id: u8) -> Self {
        CzClient {
            connector,
            zone_count,
            device_id,
            stream: None,
            buffer: Vec::new(),
        }
    }

    pub fn zone_count(&self) -> u8 {
        self.zone_count
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.stream = Some(self.connector.open().await?);
        Ok(())
    }

    /// Idempotent teardown.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("connection closed");
        }
        self.buffer.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn drop_connection(&mut self) {
        self.stream = None;
    }

    /// One read into the scan buffer. Soft timeout yields an empty chunk;
    /// EOF and I/O errors invalidate the connection.
    async fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            CzError::Transport(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
        })?;
        let mut chunk = vec![0u8; MAX_MESSAGE_SIZE];
        let outcome = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut chunk)).await;
        match outcome {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => {
                self.drop_connection();
                Err(CzError::ConnectionAborted("connection closed by peer".into()))
            }
            Ok(Ok(n)) => {
                chunk.truncate(n);
                Ok(chunk)
            }
            Ok(Err(e)) => {
                self.drop_connection();
                Err(CzError::Transport(e))
            }
        }
    }

    async fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            CzError::Transport(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
        })?;
        let outcome: io::Result<()> = async {
            stream.write_all(data).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = outcome {
            self.drop_connection();
            return Err(CzError::Transport(e));
        }
        Ok(())
    }

    /// Yield the next valid frame seen on the bus.
    pub async fn get_frame(&mut self) -> Result<Frame> {
        let mut empty_reads = 0u32;
        loop {
            if let Some((frame, consumed)) = scan_frame(&self.buffer) {
                self.buffer.drain(..consumed);
                return Ok(frame);
            }
            if self.buffer.len() > BUFFER_LIMIT {
                let trim = self.buffer.len() - MAX_MESSAGE_SIZE;
                warn!(dropped = trim, "scan buffer overflow, keeping tail");
                self.buffer.drain(..trim);
            }
            let chunk = self.read_chunk().await?;
            if chunk.is_empty() {
                empty_reads += 1;
                if empty_reads >= MAX_EMPTY_READS {
                    self.drop_connection();
                    return Err(CzError::ConnectionAborted(
                        "bus silent: too many empty reads".into(),
                    ));
                }
                continue;
            }
            empty_reads = 0;
            self.buffer.extend_from_slice(&chunk);
        }
    }

    /// Send a frame and wait for the matching reply, retrying transport
    /// failures up to the budget.
    pub async fn send_with_reply(
        &mut self,
        destination: u8,
        function: Function,
        data: &[u8],
    ) -> Result<Frame> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !self.is_connected() {
                if let Err(e) = self.connect().await {
                    if e.is_transport() && attempt < RETRY_ATTEMPTS {
                        warn!(attempt, error = %e, "reconnect failed, retrying");
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                    return Err(e);
                }
            }
            match self.send_with_reply_once(destination, function, data).await {
                Ok(frame) => return Ok(frame),
                Err(e) if e.is_transport() && attempt < RETRY_ATTEMPTS => {
                    warn!(attempt, error = %e, "transport error, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_with_reply_once(
        &mut self,
        destination: u8,
        function: Function,
        data: &[u8],
    ) -> Result<Frame> {
        let message = build_message(destination, self.device_id, function, data)?;
        self.write_data(&message).await?;
        tokio::time::sleep(REPLY_SETTLE).await;

        for _ in 0..MAX_REPLY_ATTEMPTS {
            let reply = self.get_frame().await?;
            if reply.destination != self.device_id {
                // Crosstalk between other masters; keep scanning.
                continue;
            }
            match reply.function {
                Function::Error => {
                    return Err(CzError::Protocol(format!(
                        "error reply received: {:?}",
                        reply.data
                    )));
                }
                Function::Reply => {
                    if function == Function::Read && data.len() >= 3 && reply.data.len() >= 3 {
                        if reply.data[..3] == data[..3] {
                            return Ok(reply);
                        }
                        // Reply to somebody else's read of a different row.
                        continue;
                    }
                    return Ok(reply);
                }
                _ => {}
            }
        }
        Err(CzError::Timeout("no valid reply received".into()))
    }

    pub async fn read_row(&mut self, dest: u8, table: u8, row: u8) -> Result<Frame> {
        self.send_with_reply(dest, Function::Read, &[0, table, row]).await
    }

    pub async fn write_row(&mut self, dest: u8, table: u8, row: u8, data: &[u8]) -> Result<()> {
        let mut full_data = vec![0, table, row];
        full_data.extend_from_slice(data);
        let reply = self.send_with_reply(dest, Function::Write, &full_data).await?;
        let ack = reply.data.first().copied().unwrap_or(0xFF);
        if ack != 0 {
            return Err(CzError::Protocol(format!(
                "write failed with reply code {ack}"
            )));
        }
        Ok(())
    }

    /// Run the full ordered read sequence and decode a snapshot.
    pub async fn get_status_data(&mut self, include_raw: bool) -> Result<SystemStatus> {
        let mut rows = RowCache::new();
        for (table, row) in READ_QUERIES {
            let frame = self.read_row(table, table, row).await?;
            rows.insert((table, row), frame.data);
        }
        Ok(decode_status(&rows, self.zone_count, include_raw))
    }

    /// Patch the mode byte and/or the all-zones flag in row 1.12.
    pub async fn set_system_mode(
        &mut self,
        mode: Option<SystemMode>,
        all_zones: Option<bool>,
    ) -> Result<()> {
        if mode.is_none() && all_zones.is_none() {
            return Ok(());
        }
        let frame = self.read_row(1, 1, 12).await?;
        let mut data = writable_row(&frame)?;
        if let Some(mode) = mode {
            patch(&mut data, 4 - 3, mode.to_raw())?;
        }
        if let Some(all) = all_zones {
            patch(&mut data, 15 - 3, all as u8)?;
        }
        self.write_row(1, 1, 12, &data).await
    }

    /// Fan mode lives in bit 2 of byte 3 of row 1.17.
    pub async fn set_fan_mode(&mut self, fan_mode: FanMode) -> Result<()> {
        let frame = self.read_row(1, 1, 17).await?;
        let mut data = writable_row(&frame)?;
        let current = data[3 - 3];
        patch(
            &mut data,
            3 - 3,
            (current & !(1 << 2)) | (fan_mode.to_raw() << 2),
        )?;
        self.write_row(1, 1, 17, &data).await
    }

    /// Read-modify-write of the setpoint and flag rows for a set of zones.
    /// Rows 1.12 and 1.16 are each read and written exactly once.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_zone_setpoints(
        &mut self,
        zones: &[u8],
        heat_setpoint: Option<u8>,
        cool_setpoint: Option<u8>,
        temporary_hold: Option<bool>,
        hold: Option<bool>,
        out_mode: Option<bool>,
    ) -> Result<()> {
        let row12_frame = self.read_row(1, 1, 12).await?;
        let row16_frame = self.read_row(1, 1, 16).await?;
        let mut data12 = writable_row(&row12_frame)?;
        let mut data16 = writable_row(&row16_frame)?;

        for &zone_id in zones {
            if !(1..=self.zone_count).contains(&zone_id) {
                warn!(zone_id, "ignoring out-of-range zone");
                continue;
            }
            let zone_idx = (zone_id - 1) as usize;
            let bit = 1u8 << zone_idx;

            if let Some(heat) = heat_setpoint {
                patch(&mut data16, 11 + zone_idx - 3, heat)?;
            }
            if let Some(cool) = cool_setpoint {
                patch(&mut data16, 3 + zone_idx - 3, cool)?;
            }
            if let Some(temporary) = temporary_hold {
                let current = data12[9 - 3];
                patch(
                    &mut data12,
                    9 - 3,
                    (current & !bit) | ((temporary as u8) << zone_idx),
                )?;
            }
            if let Some(hold) = hold {
                let current = data12[10 - 3];
                patch(
                    &mut data12,
                    10 - 3,
                    (current & !bit) | ((hold as u8) << zone_idx),
                )?;
            }
            if let Some(out) = out_mode {
                let current = data12[12 - 3];
                patch(
                    &mut data12,
                    12 - 3,
                    (current & !bit) | ((out as u8) << zone_idx),
                )?;
            }
        }

        self.write_row(1, 1, 12, &data12).await?;
        self.write_row(1, 1, 16, &data16).await
    }
}

/// Strip the 3-byte echoed address off a row reply, leaving the writable
/// portion. Replies shorter than the echo are malformed.
fn writable_row(frame: &Frame) -> Result<Vec<u8>> {
    if frame.data.len() < 3 {
        return Err(CzError::Protocol(format!(
            "row reply too short: {} bytes",
            frame.data.len()
        )));
    }
    Ok(frame.data[3..].to_vec())
}

fn patch(data: &mut [u8], index: usize, value: u8) -> Result<()> {
    let slot = data.get_mut(index).ok_or_else(|| {
        CzError::Protocol(format!("row reply too short to patch byte {index}"))
    })?;
    *slot = value;
    Ok(())
}
