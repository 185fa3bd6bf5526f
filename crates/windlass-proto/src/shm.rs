//! Length-prefixed framing for the shared-memory result path.
//!
//! Layout, bit-exact:
//!
//! ```text
//! offset 0..4   : u32 little-endian length N
//! offset 4..4+N : UTF-8 JSON payload, exactly N bytes
//! returned size : 4 + N
//! ```
//!
//! Length mismatches are bugs, not warnings: every violation is rejected
//! with a precise reason so the scheduler can surface a decode failure.

use thiserror::Error;

/// Bytes reserved for the length prefix.
pub const HEADER_LEN: usize = 4;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ShmFrameError {
    #[error("payload of {payload} bytes does not fit a {capacity}-byte slot")]
    PayloadTooLarge { payload: usize, capacity: usize },

    #[error("reported byte count {byte_count} is shorter than the 4-byte header")]
    TruncatedHeader { byte_count: usize },

    #[error("reported byte count {byte_count} exceeds the {capacity}-byte slot")]
    CountExceedsBuffer { byte_count: usize, capacity: usize },

    #[error("frame declares {declared} payload bytes but only {available} were written")]
    LengthMismatch { declared: usize, available: usize },

    #[error("payload is not valid UTF-8: {reason}")]
    InvalidUtf8 { reason: String },
}

/// Write `payload` into `buf` as `[u32 LE length][bytes]`.
///
/// Returns the total number of bytes laid down (`payload.len() + 4`),
/// which is the byte count the reader must be handed.
pub fn write_frame(buf: &mut [u8], payload: &str) -> Result<usize, ShmFrameError> {
    let bytes = payload.as_bytes();
    let total = HEADER_LEN + bytes.len();
    if total > buf.len() {
        return Err(ShmFrameError::PayloadTooLarge {
            payload: bytes.len(),
            capacity: buf.len(),
        });
    }
    buf[..HEADER_LEN].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf[HEADER_LEN..total].copy_from_slice(bytes);
    Ok(total)
}

/// Decode a frame previously written with [`write_frame`].
///
/// `byte_count` is the writer-reported total size. Rejected frames:
/// `byte_count < 4`, `byte_count > buf.len()`, `4 + N > byte_count`,
/// and payloads that are not UTF-8.
pub fn read_frame(buf: &[u8], byte_count: usize) -> Result<&str, ShmFrameError> {
    if byte_count < HEADER_LEN {
        return Err(ShmFrameError::TruncatedHeader { byte_count });
    }
    if byte_count > buf.len() {
        return Err(ShmFrameError::CountExceedsBuffer {
            byte_count,
            capacity: buf.len(),
        });
    }
    let declared = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if HEADER_LEN + declared > byte_count {
        return Err(ShmFrameError::LengthMismatch {
            declared,
            available: byte_count - HEADER_LEN,
        });
    }
    std::str::from_utf8(&buf[HEADER_LEN..HEADER_LEN + declared]).map_err(|e| {
        ShmFrameError::InvalidUtf8 {
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_any_payload_that_fits() {
        let mut buf = vec![0u8; 64];
        for payload in ["", "{}", r#"{"text":"héllo"}"#] {
            let n = write_frame(&mut buf, payload).unwrap();
            assert_eq!(n, payload.len() + 4);
            assert_eq!(read_frame(&buf, n).unwrap(), payload);
        }
    }

    #[test]
    fn oversized_payload_is_rejected_at_write() {
        let mut buf = vec![0u8; 8];
        let err = write_frame(&mut buf, "longer than eight").unwrap_err();
        assert!(matches!(err, ShmFrameError::PayloadTooLarge { .. }));
    }

    #[test]
    fn short_byte_count_is_rejected() {
        let buf = vec![0u8; 16];
        assert_eq!(
            read_frame(&buf, 3),
            Err(ShmFrameError::TruncatedHeader { byte_count: 3 })
        );
    }

    #[test]
    fn byte_count_beyond_buffer_is_rejected() {
        let buf = vec![0u8; 16];
        assert!(matches!(
            read_frame(&buf, 17),
            Err(ShmFrameError::CountExceedsBuffer { .. })
        ));
    }

    #[test]
    fn declared_length_beyond_byte_count_is_rejected() {
        let mut buf = vec![0u8; 32];
        let n = write_frame(&mut buf, "0123456789").unwrap();
        // Writer claims fewer bytes than the header declares.
        assert_eq!(
            read_frame(&buf, n - 2),
            Err(ShmFrameError::LengthMismatch {
                declared: 10,
                available: 8
            })
        );
    }

    #[test]
    fn non_utf8_payload_is_rejected() {
        let mut buf = vec![0u8; 16];
        buf[..4].copy_from_slice(&2u32.to_le_bytes());
        buf[4] = 0xff;
        buf[5] = 0xfe;
        assert!(matches!(
            read_frame(&buf, 6),
            Err(ShmFrameError::InvalidUtf8 { .. })
        ));
    }
}
