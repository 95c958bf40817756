//! Wire frames for the ComfortZone II bus.
//!
//! A frame is `[dst, 0, src, 0, len, 0, 0, func, data..., crc_lo, crc_hi]`.
//! The CRC is CRC-16/ARC (poly 0x8005 reflected, init 0, no final xor)
//! appended little-endian, so recomputing over the whole frame yields zero.
//!
//! The bus is multi-master and noisy, so parsing is byte-level: scan for the
//! first offset whose claimed length and CRC check out, discard everything
//! before it.

use serde::{Deserialize, Serialize};

/// Header (8 bytes) plus CRC (2 bytes).
pub const PROTOCOL_SIZE: usize = 10;
/// Smallest frame we will ever sync on: one data byte.
pub const MIN_MESSAGE_SIZE: usize = PROTOCOL_SIZE + 1;
/// Largest possible frame: 255 data bytes.
pub const MAX_MESSAGE_SIZE: usize = PROTOCOL_SIZE + 255;

/// Function codes used on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Function {
    Reply = 0x06,
    Read = 0x0B,
    Write = 0x0C,
    Error = 0x15,
}

impl Function {
    /// Decode a raw code. Unknown codes map to `Error`, matching how the
    /// panel reports anything it does not understand.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x06 => Function::Reply,
            0x0B => Function::Read,
            0x0C => Function::Write,
            _ => Function::Error,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// A parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub destination: u8,
    pub source: u8,
    pub function: Function,
    pub data: Vec<u8>,
}

impl Frame {
    /// Re-encode this frame to wire bytes.
    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        build_message(self.destination, self.source, self.function, &self.data)
    }
}

/// CRC-16/ARC over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x0000;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Build a wire frame.
pub fn build_message(
    destination: u8,
    source: u8,
    function: Function,
    data: &[u8],
) -> crate::error::Result<Vec<u8>> {
    if data.len() > 255 {
        return Err(crate::error::CzError::InvalidArgument(format!(
            "frame data too large: {} bytes (max 255)",
            data.len()
        )));
    }
    let mut message = Vec::with_capacity(PROTOCOL_SIZE + data.len());
    message.extend_from_slice(&[
        destination,
        0x00,
        source,
        0x00,
        data.len() as u8,
        0x00,
        0x00,
        function.code(),
    ]);
    message.extend_from_slice(data);
    let crc = crc16(&message);
    message.extend_from_slice(&crc.to_le_bytes());
    Ok(message)
}

/// Scan `buf` for the first complete valid frame.
///
/// Returns the frame and the number of bytes consumed from the start of
/// `buf` (noise prefix plus the frame itself). Returns `None` when no
/// complete frame validates yet; the caller should read more bytes and
/// rescan.
pub fn scan_frame(buf: &[u8]) -> Option<(Frame, usize)> {
    if buf.len() < MIN_MESSAGE_SIZE {
        return None;
    }
    for offset in 0..=buf.len() - MIN_MESSAGE_SIZE {
        let window = &buf[offset..];
        let length = window[4] as usize;
        if length == 0 {
            continue;
        }
        let total = PROTOCOL_SIZE + length;
        if window.len() < total {
            continue;
        }
        // Header padding bytes are constant zeros on this protocol.
        if window[1] != 0 || window[3] != 0 || window[5] != 0 || window[6] != 0 {
            continue;
        }
        if crc16(&window[..total]) != 0 {
            continue;
        }
        let frame = Frame {
            destination: window[0],
            source: window[2],
            function: Function::from_code(window[7]),
            data: window[8..8 + length].to_vec(),
        };
        return Some((frame, offset + total));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_read_request_vector() {
        let built = build_message(9, 99, Function::Read, &[1, 16]).unwrap();
        assert_eq!(built.len(), 12);
        assert_eq!(&built[..10], &[9, 0x00, 99, 0x00, 2, 0x00, 0x00, 0x0B, 1, 16]);
        assert_eq!(crc16(&built), 0);
    }

    #[test]
    fn build_write_command() {
        let built = build_message(1, 99, Function::Write, &[1, 12, 4, 2]).unwrap();
        assert_eq!(built.len(), 14);
        assert_eq!(built[0], 1);
        assert_eq!(built[2], 99);
        assert_eq!(built[4], 4);
        assert_eq!(built[7], 0x0C);
        assert_eq!(&built[8..12], &[1, 12, 4, 2]);
        assert_eq!(crc16(&built), 0);
    }

    #[test]
    fn build_rejects_oversized_payload() {
        let data = vec![0u8; 256];
        assert!(matches!(
            build_message(1, 2, Function::Write, &data),
            Err(crate::error::CzError::InvalidArgument(_))
        ));
    }

    #[test]
    fn scan_round_trips_built_frames() {
        let cases: Vec<(u8, u8, Function, Vec<u8>)> = vec![
            (9, 99, Function::Read, vec![1, 16]),
            (1, 99, Function::Write, vec![1, 12, 4, 2]),
            (99, 1, Function::Reply, vec![0x06, 0x00]),
            (255, 255, Function::Read, (0..10).collect()),
            (1, 2, Function::Write, (0..=254).collect()),
        ];
        for (dst, src, function, data) in cases {
            let built = build_message(dst, src, function, &data).unwrap();
            let (frame, consumed) = scan_frame(&built).expect("frame should validate");
            assert_eq!(consumed, built.len());
            assert_eq!(frame.destination, dst);
            assert_eq!(frame.source, src);
            assert_eq!(frame.function, function);
            assert_eq!(frame.data, data);
            assert_eq!(frame.to_bytes().unwrap(), built);
        }
    }

    #[test]
    fn scan_skips_noise_prefix() {
        let built = build_message(9, 99, Function::Read, &[1, 16]).unwrap();
        let mut stream = vec![0x00, 0x00, 0x00];
        stream.extend_from_slice(&built);
        stream.push(0xFF);

        let (frame, consumed) = scan_frame(&stream).expect("frame should validate");
        assert_eq!(frame.destination, 9);
        assert_eq!(frame.source, 99);
        assert_eq!(frame.function, Function::Read);
        assert_eq!(frame.data, vec![1, 16]);
        // Everything up to and including the frame is consumed; trailing
        // noise stays for the next scan.
        assert_eq!(consumed, 3 + built.len());
        assert_eq!(stream[consumed..], [0xFF]);
    }

    #[test]
    fn scan_waits_for_partial_frame() {
        let built = build_message(9, 99, Function::Read, &[1, 16]).unwrap();
        assert!(scan_frame(&built[..built.len() - 1]).is_none());
    }

    #[test]
    fn scan_rejects_corrupted_crc() {
        let mut built = build_message(9, 99, Function::Read, &[1, 16]).unwrap();
        let last = built.len() - 1;
        built[last] ^= 0xFF;
        assert!(scan_frame(&built).is_none());
    }

    #[test]
    fn unknown_function_decodes_to_error() {
        assert_eq!(Function::from_code(0x42), Function::Error);
        assert_eq!(Function::from_code(0x0B), Function::Read);
    }
}
