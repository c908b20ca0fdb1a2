//! Frame model and wire I/O for the framed transport.
//!
//! Wire layout: one kind byte, a big-endian `u32` payload length, then the
//! payload. Oversize frames are protocol violations in both directions.

use std::io::{self, Read, Write};

use bytes::Bytes;

/// Frame kinds, numbered after the usual message-transport opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
    Ping,
    Pong,
}

impl FrameKind {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Text => 1,
            Self::Binary => 2,
            Self::Ping => 9,
            Self::Pong => 10,
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Text),
            2 => Some(Self::Binary),
            9 => Some(Self::Ping),
            10 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// One complete message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Text, payload)
    }

    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Binary, payload)
    }

    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self.kind, FrameKind::Ping | FrameKind::Pong)
    }
}

/// Read one frame. `Ok(None)` means the peer closed cleanly on a frame
/// boundary; EOF mid-frame is an `UnexpectedEof` error.
pub(crate) fn read_frame<R: Read>(reader: &mut R, max_frame: usize) -> io::Result<Option<Frame>> {
    let mut header = [0u8; 5];
    loop {
        match reader.read(&mut header[..1]) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    reader.read_exact(&mut header[1..])?;

    let kind = FrameKind::from_code(header[0])
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown frame kind"))?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > max_frame {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds the size limit",
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(Frame {
        kind,
        payload: Bytes::from(payload),
    }))
}

/// Write one frame atomically from the writer helper's perspective.
pub(crate) fn write_frame<W: Write>(writer: &mut W, frame: &Frame, max_frame: usize) -> io::Result<()> {
    if frame.payload.len() > max_frame {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds the size limit",
        ));
    }
    let len = u32::try_from(frame.payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds the wire format"))?;
    let mut header = [0u8; 5];
    header[0] = frame.kind.code();
    header[1..].copy_from_slice(&len.to_be_bytes());
    writer.write_all(&header)?;
    writer.write_all(&frame.payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trip() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Frame::text("hello"), 1024).unwrap();
        write_frame(&mut wire, &Frame::binary(vec![0u8, 1, 2]), 1024).unwrap();

        let mut cursor = Cursor::new(wire);
        let first = read_frame(&mut cursor, 1024).unwrap().unwrap();
        assert_eq!(first.kind, FrameKind::Text);
        assert_eq!(&first.payload[..], b"hello");
        let second = read_frame(&mut cursor, 1024).unwrap().unwrap();
        assert_eq!(second.kind, FrameKind::Binary);
        assert_eq!(&second.payload[..], &[0, 1, 2]);
        // clean EOF on a frame boundary
        assert!(read_frame(&mut cursor, 1024).unwrap().is_none());
    }

    #[test]
    fn empty_frame_is_not_eof() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Frame::text(""), 64).unwrap();
        let mut cursor = Cursor::new(wire);
        let frame = read_frame(&mut cursor, 64).unwrap().unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn oversize_frames_rejected_both_ways() {
        let mut wire = Vec::new();
        assert!(write_frame(&mut wire, &Frame::binary(vec![0u8; 32]), 16).is_err());

        let mut wire = Vec::new();
        write_frame(&mut wire, &Frame::binary(vec![0u8; 32]), 64).unwrap();
        let mut cursor = Cursor::new(wire);
        let err = read_frame(&mut cursor, 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Frame::text("truncated"), 64).unwrap();
        wire.truncate(wire.len() - 3);
        let mut cursor = Cursor::new(wire);
        let err = read_frame(&mut cursor, 64).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let wire = vec![7u8, 0, 0, 0, 0];
        let mut cursor = Cursor::new(wire);
        let err = read_frame(&mut cursor, 64).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
