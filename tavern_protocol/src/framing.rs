// Length-delimited message framing over a byte stream.
//
// Wire format: a 4-byte big-endian length prefix followed by a JSON-encoded
// envelope. Both functions work on raw bytes — JSON encoding happens at the
// call site, so this module stays format-agnostic and testable with plain
// `Cursor`s.
//
// `MAX_MESSAGE_SIZE` bounds allocation from a malformed or hostile length
// prefix. History responses (the full accepted log of a room) are the largest
// messages on this protocol; 4 MB covers a session several orders of
// magnitude longer than rooms actually live.

use std::io::{self, Read, Write};

/// Maximum allowed message size (4 MB).
pub const MAX_MESSAGE_SIZE: u32 = 4 * 1024 * 1024;

/// Write one framed message and flush.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = payload.len();
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to write {len} byte message (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    #[expect(clippy::cast_possible_truncation)]
    let prefix = (len as u32).to_be_bytes();
    writer.write_all(&prefix)?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one framed message.
///
/// Returns `UnexpectedEof` if the stream closes before or mid-message, and
/// `InvalidData` for a length prefix above `MAX_MESSAGE_SIZE`.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("refusing to read {len} byte message (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn frame_roundtrip() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"{\"type\":\"NEW_HOST\"}").unwrap();

        let mut cursor = Cursor::new(&wire);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"{\"type\":\"NEW_HOST\"}");
    }

    #[test]
    fn back_to_back_frames_stay_separate() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"one").unwrap();
        write_frame(&mut wire, b"two").unwrap();
        write_frame(&mut wire, b"").unwrap();

        let mut cursor = Cursor::new(&wire);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"one");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"two");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"");
    }

    #[test]
    fn oversized_write_refused() {
        let huge = vec![0u8; MAX_MESSAGE_SIZE as usize + 1];
        let err = write_frame(&mut Vec::new(), &huge).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn oversized_length_prefix_refused() {
        let wire = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let err = read_frame(&mut Cursor::new(wire.to_vec())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_stream_is_eof() {
        // Prefix promises 10 bytes but only 3 arrive.
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abc");
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
