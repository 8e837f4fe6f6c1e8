// SPDX-License-Identifier: Apache-2.0

use crate::stream::LogEntry;
use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for the log stream frame: a 4-byte big-endian length prefix followed
/// by a protobuf-encoded [`LogEntry`], with a hard cap on the frame size.
pub struct EntryCodec {
    max_frame_size: usize,
}

impl EntryCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for EntryCodec {
    fn default() -> Self {
        Self::new(crate::stream::MAX_FRAME_SIZE)
    }
}

impl Decoder for EntryCodec {
    type Item = LogEntry;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let frame_len = u32::from_be_bytes(length_bytes) as usize;

        if frame_len > self.max_frame_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "frame size {} exceeds maximum {}",
                    frame_len, self.max_frame_size
                ),
            ));
        }

        if src.len() < LENGTH_PREFIX_SIZE + frame_len {
            // Need more data; reserve what we know is coming.
            src.reserve(LENGTH_PREFIX_SIZE + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let body = src.split_to(frame_len);

        let entry = LogEntry::decode(body.freeze()).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to decode log entry: {}", e),
            )
        })?;

        Ok(Some(entry))
    }
}

impl Encoder<LogEntry> for EntryCodec {
    type Error = std::io::Error;

    fn encode(&mut self, entry: LogEntry, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame_len = entry.encoded_len();
        if frame_len > self.max_frame_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "frame size {} exceeds maximum {}",
                    frame_len, self.max_frame_size
                ),
            ));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + frame_len);
        dst.put_u32(frame_len as u32);
        entry
            .encode(dst)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(line: &str) -> LogEntry {
        LogEntry {
            source: "stdout".to_string(),
            time_nano: 1_700_000_000_000_000_000,
            line: line.as_bytes().to_vec(),
            partial: false,
        }
    }

    #[test]
    fn encode_then_decode() {
        let mut codec = EntryCodec::default();
        let mut buf = BytesMut::new();

        codec.encode(entry("first"), &mut buf).unwrap();
        codec.encode(entry("second"), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.line, b"first");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.line, b"second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let mut codec = EntryCodec::default();
        let mut full = BytesMut::new();
        codec.encode(entry("hello"), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[3..6]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[6..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.line, b"hello");
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = EntryCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(17);
        buf.extend_from_slice(&[0u8; 17]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        let mut codec = EntryCodec::default();
        let mut buf = BytesMut::new();
        // Field tag 1 declared as varint with a truncated payload.
        buf.put_u32(2);
        buf.extend_from_slice(&[0x08, 0x80]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
