// SPDX-License-Identifier: Apache-2.0

//! The local, always-available log store. The driver only depends on the
//! [`DurableSink`] trait; the JSON-file implementation lives in
//! [`jsonfile`].

use crate::bounded_channel::BoundedReceiver;
use crate::stream::LogRecord;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub mod jsonfile;

pub use jsonfile::JsonFileSink;

/// Read-back options for `docker logs`, as sent by the daemon.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    /// Keep the watcher open and stream records as they are written.
    #[serde(rename = "Follow")]
    pub follow: bool,

    /// Only the last N records; zero or negative means everything.
    #[serde(rename = "Tail")]
    pub tail: i64,
}

/// Tailing handle produced by a sink that supports read-back: a record
/// channel, an error channel, and a close signal. The producing task stops
/// at the first of: close requested, error sent, all records delivered (in
/// non-follow mode).
pub struct LogWatcher {
    pub records: BoundedReceiver<LogRecord>,
    pub errors: BoundedReceiver<std::io::Error>,
    cancel: CancellationToken,
}

impl LogWatcher {
    pub(crate) fn new(
        records: BoundedReceiver<LogRecord>,
        errors: BoundedReceiver<std::io::Error>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            records,
            errors,
            cancel,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LogWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One durable sink per session.
pub trait DurableSink: Send {
    fn log(&mut self, record: &LogRecord) -> std::io::Result<()>;

    fn close(&mut self) -> std::io::Result<()>;

    /// Tailing capability. Sinks without read-back support return `None`.
    fn read_logs(&self, _config: &ReadConfig) -> Option<LogWatcher> {
        None
    }
}
