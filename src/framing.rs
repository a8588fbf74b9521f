//! Browser native-messaging frame codec.
//!
//! Each frame is a 4-byte little-endian unsigned length `L` followed by `L`
//! bytes of UTF-8 JSON. Frames larger than 1 MiB are a fatal decode error;
//! the agent reports them once and exits non-zero.
use std::io::{ErrorKind, Read, Write};

/// Maximum accepted frame payload, in bytes.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Errors from the frame decoder. All of these are fatal to the agent except
/// where the caller treats EOF as a clean shutdown.
#[derive(Debug)]
pub enum FrameError {
    /// Standard input closed between frames.
    Eof,
    /// The length prefix was zero.
    Empty,
    /// The length prefix exceeded [MAX_FRAME_LEN].
    TooLarge(u32),
    /// The payload was not valid UTF-8.
    Utf8,
    /// The stream failed or was truncated mid-frame.
    Io(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Eof => write!(f, "end of stream"),
            FrameError::Empty => write!(f, "zero-length frame"),
            FrameError::TooLarge(l) => {
                write!(f, "frame of {l} bytes exceeds the {MAX_FRAME_LEN} byte limit")
            }
            FrameError::Utf8 => write!(f, "frame payload is not valid UTF-8"),
            FrameError::Io(e) => write!(f, "stream error: {e}"),
        }
    }
}

/// Reads one frame, returning its JSON payload as a string.
pub fn read_frame(r: &mut impl Read) -> Result<String, FrameError> {
    let mut len = [0u8; 4];
    if let Err(e) = r.read_exact(&mut len) {
        return Err(if e.kind() == ErrorKind::UnexpectedEof {
            FrameError::Eof
        } else {
            FrameError::Io(e)
        });
    }
    let len = u32::from_le_bytes(len);

    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).map_err(FrameError::Io)?;

    String::from_utf8(payload).map_err(|_| FrameError::Utf8)
}

/// Writes one frame and flushes, so the bridge never blocks on a buffered
/// response.
pub fn write_frame(w: &mut impl Write, payload: &str) -> std::io::Result<()> {
    let len = payload.len() as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(payload.as_bytes())?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip() {
        let payload = r#"{"id":1,"command":"ping","params":{}}"#;
        let mut buf = Vec::new();
        write_frame(&mut buf, payload).unwrap();

        assert_eq!(&buf[..4], (payload.len() as u32).to_le_bytes());

        let mut c = Cursor::new(buf);
        let decoded = read_frame(&mut c).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn round_trip_json_object() {
        // Encoding any JSON object and decoding it back must yield the same
        // object.
        let o = serde_json::json!({
            "id": "abc-123",
            "command": "transmitApdu",
            "params": { "deviceId": "ccid_1", "apdu": [0, 164, 4, 0] }
        });
        let mut buf = Vec::new();
        write_frame(&mut buf, &o.to_string()).unwrap();
        let decoded = read_frame(&mut Cursor::new(buf)).unwrap();
        let back: serde_json::Value = serde_json::from_str(&decoded).unwrap();
        assert_eq!(o, back);
    }

    #[test]
    fn eof_between_frames() {
        let mut c = Cursor::new(Vec::<u8>::new());
        assert!(matches!(read_frame(&mut c), Err(FrameError::Eof)));
    }

    #[test]
    fn truncated_payload_is_io_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_le_bytes());
        buf.extend_from_slice(b"abc");
        assert!(matches!(
            read_frame(&mut Cursor::new(buf)),
            Err(FrameError::Io(_))
        ));
    }

    #[test]
    fn zero_length_rejected() {
        let buf = 0u32.to_le_bytes().to_vec();
        assert!(matches!(
            read_frame(&mut Cursor::new(buf)),
            Err(FrameError::Empty)
        ));
    }

    #[test]
    fn oversized_rejected() {
        let buf = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        match read_frame(&mut Cursor::new(buf)) {
            Err(FrameError::TooLarge(l)) => assert_eq!(l, MAX_FRAME_LEN + 1),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn exactly_max_accepted() {
        let payload = "x".repeat(MAX_FRAME_LEN as usize);
        let mut buf = Vec::new();
        write_frame(&mut buf, &payload).unwrap();
        let decoded = read_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded.len(), MAX_FRAME_LEN as usize);
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&[0xff, 0xfe]);
        assert!(matches!(
            read_frame(&mut Cursor::new(buf)),
            Err(FrameError::Utf8)
        ));
    }
}
