// SPDX-License-Identifier: Apache-2.0

use crate::store::LogWatcher;
use crate::stream::{EntryCodec, LogEntry};
use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;
use tracing::warn;

/// Pump task behind `read_logs`: re-frames every record from the store's
/// watcher into the wire format and writes it to the output stream. Exactly
/// one of {record channel closed, watcher error, write error} ends it; the
/// output closes when the task drops its write half.
pub(crate) async fn run<W>(mut watcher: LogWatcher, out: W)
where
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedWrite::new(out, EntryCodec::default());

    loop {
        tokio::select! {
            record = watcher.records.next() => match record {
                Some(record) => {
                    if let Err(e) = frames.send(LogEntry::from(&record)).await {
                        warn!(error = %e, "error writing log frame to read stream");
                        break;
                    }
                }
                None => break, // watcher finished cleanly
            },

            err = watcher.errors.next() => {
                if let Some(e) = err {
                    warn!(error = %e, "log watcher failed");
                }
                break;
            }
        }
    }

    watcher.close();
}
