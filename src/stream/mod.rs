// SPDX-License-Identifier: Apache-2.0

//! Wire format of the inbound log stream: length-delimited protobuf frames,
//! matching the docker logdriver stream protocol.

use bytes::Bytes;
use chrono::{DateTime, Utc};

pub mod codec;

pub use codec::EntryCodec;

/// Frames larger than this are treated as a protocol violation.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// One framed record as it appears on the stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LogEntry {
    #[prost(string, tag = "1")]
    pub source: String,

    #[prost(int64, tag = "2")]
    pub time_nano: i64,

    #[prost(bytes = "vec", tag = "3")]
    pub line: ::prost::alloc::vec::Vec<u8>,

    #[prost(bool, tag = "4")]
    pub partial: bool,
}

/// A decoded log record, immutable once built. Consumed exactly once by the
/// session consumer loop and handed by value to both sinks.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub line: Bytes,
    pub source: String,
    pub partial: bool,
    pub timestamp: DateTime<Utc>,
    /// Extra attributes attached by the daemon (labels/env selected into the
    /// record). Not part of the wire frame.
    pub attrs: Vec<(String, String)>,
}

impl From<LogEntry> for LogRecord {
    fn from(entry: LogEntry) -> Self {
        Self {
            line: Bytes::from(entry.line),
            source: entry.source,
            partial: entry.partial,
            timestamp: DateTime::from_timestamp_nanos(entry.time_nano),
            attrs: Vec::new(),
        }
    }
}

impl From<&LogRecord> for LogEntry {
    fn from(record: &LogRecord) -> Self {
        Self {
            source: record.source.clone(),
            time_nano: record.timestamp.timestamp_nanos_opt().unwrap_or(0),
            line: record.line.to_vec(),
            partial: record.partial,
        }
    }
}
