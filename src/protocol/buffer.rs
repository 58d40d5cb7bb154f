//! Inbound byte framing.
use bytes::{Buf, Bytes, BytesMut};

/// Header size: type byte plus the four length bytes.
const HEADER: usize = 5;

/// Accumulates inbound bytes and cuts them into complete framed messages.
///
/// A frame is `(type_byte, payload)` where the payload excludes the header.
/// Partial headers and partial payloads never yield; the length field counts
/// itself but not the type byte, so a bodyless message carries length 4.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(1024) }
    }

    /// Append a chunk and collect every frame it completes.
    pub fn receive(&mut self, chunk: &[u8]) -> Vec<(u8, Bytes)> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Cut one complete frame out of the buffer, if any.
    pub fn next_frame(&mut self) -> Option<(u8, Bytes)> {
        let mut header = self.buf.get(..HEADER)?;
        let msgtype = header.get_u8();
        let body_len = header.get_u32() as usize - 4;

        if self.buf.len() - HEADER < body_len {
            self.buf.reserve(HEADER + body_len - self.buf.len());
            return None;
        }

        self.buf.advance(HEADER);
        Some((msgtype, self.buf.split_to(body_len).freeze()))
    }

    /// Take the raw buffered leftover, header bytes included, and reset.
    pub fn flush(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// The underlying buffer, for the host to read socket bytes into.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_split_across_chunks() {
        let mut buf = FrameBuffer::new();
        assert!(buf.receive(b"Q\x00\x00\x00\x19select * from ").is_empty());
        let frames = buf.receive(b"people\0");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, b'Q');
        assert_eq!(&frames[0].1[..], b"select * from people\0");
        assert!(buf.is_empty());
    }

    #[test]
    fn bodyless_frame_after_partial_header() {
        let mut buf = FrameBuffer::new();
        assert!(buf.receive(b"X\x00\x00\x00").is_empty());
        let frames = buf.receive(b"\x04");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, b'X');
        assert!(frames[0].1.is_empty());
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut buf = FrameBuffer::new();
        let frames = buf.receive(b"1\x00\x00\x00\x042\x00\x00\x00\x04Z\x00\x00\x00\x05I");
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].0, b'1');
        assert_eq!(frames[1].0, b'2');
        assert_eq!(frames[2].0, b'Z');
        assert_eq!(&frames[2].1[..], b"I");
    }

    #[test]
    fn byte_at_a_time() {
        let wire = b"Z\x00\x00\x00\x05IC\x00\x00\x00\x0dSELECT 1\0";
        let mut buf = FrameBuffer::new();
        let mut frames = Vec::new();
        for byte in wire {
            frames.extend(buf.receive(&[*byte]));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, b'Z');
        assert_eq!(frames[1].0, b'C');
        assert_eq!(&frames[1].1[..], b"SELECT 1\0");
    }

    #[test]
    fn flush_returns_serialized_leftover() {
        let mut buf = FrameBuffer::new();
        assert!(buf.receive(b"D\x00\x00\x00\x20part").is_empty());
        assert_eq!(&buf.flush()[..], b"D\x00\x00\x00\x20part");
        assert!(buf.is_empty());
    }
}
