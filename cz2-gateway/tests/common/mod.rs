//! Shared fixtures: an in-memory panel that answers row reads and writes
//! over a duplex stream, plus a couple of degenerate connectors.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use cz2_core::client::Connector;
use cz2_core::error::{CzError, Result as CzResult};
use cz2_core::frame::{build_message, scan_frame, Function};
use cz2_core::status::RowCache;
use cz2_core::transport::BoxedStream;

/// Row set describing a 4-zone system in Auto mode with the fan running.
pub fn canonical_rows() -> RowCache {
    let mut rows = RowCache::new();
    rows.insert(
        (9, 3),
        vec![0, 9, 3, 0, 0, 0, 0, 65, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    );
    rows.insert(
        (9, 4),
        vec![0, 9, 4, 15, 12, 8, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    );
    rows.insert(
        (9, 5),
        vec![0, 9, 5, 0x20, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    );
    rows.insert(
        (1, 9),
        vec![0, 1, 9, 0, 45, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    );
    rows.insert(
        (1, 12),
        vec![0, 1, 12, 0, 2, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    );
    rows.insert(
        (1, 16),
        vec![0, 1, 16, 74, 74, 74, 74, 0, 0, 0, 0, 68, 68, 68, 68, 0, 0, 0, 0],
    );
    rows.insert(
        (1, 17),
        vec![0, 1, 17, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    );
    rows.insert(
        (1, 18),
        vec![0, 1, 18, 2, 14, 30, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    );
    rows.insert(
        (1, 24),
        vec![0, 1, 24, 72, 70, 68, 66, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    );
    rows
}

/// A controller double: serves reads from (and applies writes to) a shared
/// row table. Each `open` produces a fresh connection, matching the
/// gateway's connect-execute-disconnect pattern.
pub struct MockPanel {
    pub rows: Arc<Mutex<RowCache>>,
}

impl MockPanel {
    pub fn new() -> Self {
        MockPanel {
            rows: Arc::new(Mutex::new(canonical_rows())),
        }
    }
}

#[async_trait]
impl Connector for MockPanel {
    async fn open(&self) -> CzResult<BoxedStream> {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(remote, self.rows.clone()));
        Ok(Box::new(local))
    }
}

async fn serve(mut stream: DuplexStream, rows: Arc<Mutex<RowCache>>) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        while let Some((frame, consumed)) = scan_frame(&buffer) {
            buffer.drain(..consumed);
            if frame.data.len() < 3 {
                continue;
            }
            let table = frame.data[1];
            let row = frame.data[2];
            let reply = match frame.function {
                Function::Read => {
                    let data = rows
                        .lock()
                        .unwrap()
                        .get(&(table, row))
                        .cloned()
                        .unwrap_or_default();
                    build_message(frame.source, table, Function::Reply, &data).unwrap()
                }
                Function::Write => {
                    let payload = &frame.data[3..];
                    let mut rows = rows.lock().unwrap();
                    if let Some(existing) = rows.get_mut(&(table, row)) {
                        for (i, &byte) in payload.iter().enumerate() {
                            if existing.len() > 3 + i {
                                existing[3 + i] = byte;
                            }
                        }
                    }
                    build_message(frame.source, table, Function::Reply, &[0]).unwrap()
                }
                _ => continue,
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Accepts the connection, then never answers anything.
pub struct SilentPanel;

#[async_trait]
impl Connector for SilentPanel {
    async fn open(&self) -> CzResult<BoxedStream> {
        let (local, mut remote) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut sink = [0u8; 1024];
            while matches!(remote.read(&mut sink).await, Ok(n) if n > 0) {}
        });
        Ok(Box::new(local))
    }
}

/// Refuses every connection attempt.
pub struct UnreachablePanel;

#[async_trait]
impl Connector for UnreachablePanel {
    async fn open(&self) -> CzResult<BoxedStream> {
        Err(CzError::Unreachable("connection refused".to_string()))
    }
}
