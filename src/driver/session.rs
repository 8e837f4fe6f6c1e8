// SPDX-License-Identifier: Apache-2.0

use crate::info::ContainerInfo;
use crate::insights::RemoteLogger;
use crate::store::DurableSink;
use crate::stream::{EntryCodec, LogRecord};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncRead;
use tokio::sync::RwLock;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The live pairing of one container's log stream with its durable and
/// remote sinks. `is_open` is the only state shared between the consumer
/// loop (read side) and `stop_logging` (write side); the write lock is held
/// while the sinks are being closed so the loop never dispatches into a
/// closing sink.
pub struct Session {
    pub(crate) stream_path: String,
    pub(crate) info: Arc<ContainerInfo>,
    pub(crate) is_open: RwLock<bool>,
    pub(crate) store: Mutex<Box<dyn DurableSink>>,
    pub(crate) remote: RemoteLogger,
    pub(crate) cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        stream_path: String,
        info: Arc<ContainerInfo>,
        store: Box<dyn DurableSink>,
        remote: RemoteLogger,
    ) -> Self {
        Self {
            stream_path,
            info,
            is_open: RwLock::new(true),
            store: Mutex::new(store),
            remote,
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn store_record(&self, record: &LogRecord) -> std::io::Result<()> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.log(record)
    }

    pub(crate) fn close_store(&self) -> std::io::Result<()> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.close()
    }
}

/// Consumer loop, one task per session: reads length-prefixed frames off the
/// stream and dispatches each record to the durable store and the delivery
/// worker, in arrival order. Terminates on end of stream, on cancellation,
/// when the session is closed, or on a decode error — a broken frame would
/// desynchronize every frame after it, so decode errors fail the stream
/// closed.
pub(crate) async fn consume<R>(session: Arc<Session>, stream: R)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(stream, EntryCodec::default());
    let container_id = session.info.container_id.clone();

    loop {
        let entry = tokio::select! {
            biased;

            _ = session.cancel.cancelled() => {
                debug!(%container_id, file = %session.stream_path, "log stream consumer cancelled");
                break;
            }

            frame = frames.next() => match frame {
                None => {
                    debug!(%container_id, "log stream closed, shutting down consumer");
                    break;
                }
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    error!(%container_id, error = %e, "fatal error decoding log frame");
                    break;
                }
            },
        };

        let record = LogRecord::from(entry);

        let open = session.is_open.read().await;
        if !*open {
            info!(%container_id, file = %session.stream_path, "stop consuming log stream");
            break;
        }

        // Each sink is independent best-effort: one failing never drops the
        // record for the other or stops the loop.
        if let Err(e) = session.store_record(&record) {
            error!(%container_id, error = %e, "error writing log record to local store");
        }
        if let Err(e) = session.remote.log(record).await {
            error!(%container_id, error = %e, "error forwarding log record to remote sink");
        }
        drop(open);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::insights::test_support::{test_config, RecordingTransport};
    use crate::stream::LogEntry;
    use bytes::BytesMut;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::Encoder;

    /// Sink double that captures records and can be told to fail.
    pub(crate) struct CapturingSink {
        pub(crate) records: Arc<StdMutex<Vec<String>>>,
        pub(crate) fail: bool,
    }

    impl CapturingSink {
        pub(crate) fn new() -> (Self, Arc<StdMutex<Vec<String>>>) {
            let records = Arc::new(StdMutex::new(Vec::new()));
            (
                Self {
                    records: records.clone(),
                    fail: false,
                },
                records,
            )
        }
    }

    impl DurableSink for CapturingSink {
        fn log(&mut self, record: &LogRecord) -> std::io::Result<()> {
            if self.fail {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "sink down"));
            }
            self.records
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&record.line).into_owned());
            Ok(())
        }

        fn close(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    pub(crate) async fn test_session(container_id: &str) -> Arc<Session> {
        let info = Arc::new(ContainerInfo {
            container_id: container_id.to_string(),
            ..Default::default()
        });
        let (sink, _records) = CapturingSink::new();
        let remote = RemoteLogger::start(test_config(), &info, RecordingTransport::succeeding());
        Arc::new(Session::new(
            "/run/fifo".to_string(),
            info,
            Box::new(sink),
            remote,
        ))
    }

    fn encode_frames(lines: &[&str]) -> BytesMut {
        let mut codec = EntryCodec::default();
        let mut buf = BytesMut::new();
        for (i, line) in lines.iter().enumerate() {
            codec
                .encode(
                    LogEntry {
                        source: "stdout".to_string(),
                        time_nano: 1_700_000_000_000_000_000 + i as i64,
                        line: line.as_bytes().to_vec(),
                        partial: false,
                    },
                    &mut buf,
                )
                .unwrap();
        }
        buf
    }

    struct SessionUnderTest {
        session: Arc<Session>,
        stored: Arc<StdMutex<Vec<String>>>,
        transport: RecordingTransport,
    }

    fn build_session(fail_store: bool) -> SessionUnderTest {
        let info = Arc::new(ContainerInfo {
            container_id: "abc123".to_string(),
            ..Default::default()
        });
        let (mut sink, stored) = CapturingSink::new();
        sink.fail = fail_store;
        let transport = RecordingTransport::succeeding();
        let remote = RemoteLogger::start(test_config(), &info, transport.clone());
        let session = Arc::new(Session::new(
            "/run/fifo".to_string(),
            info,
            Box::new(sink),
            remote,
        ));
        SessionUnderTest {
            session,
            stored,
            transport,
        }
    }

    #[tokio::test]
    async fn dispatches_to_both_sinks_in_order() {
        let under_test = build_session(false);
        let (mut writer, reader) = tokio::io::duplex(4096);

        let consumer = tokio::spawn(consume(under_test.session.clone(), reader));

        writer
            .write_all(&encode_frames(&["one", "two", "three"]))
            .await
            .unwrap();
        drop(writer); // end of stream terminates the loop

        tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*under_test.stored.lock().unwrap(), vec!["one", "two", "three"]);

        // Drain the remote worker and check the same order arrived there.
        under_test.session.remote.close().await;
        let calls = under_test.transport.calls();
        let delivered: Vec<String> = calls.lock().unwrap().iter().flatten().cloned().collect();
        assert_eq!(delivered, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn store_failure_does_not_block_the_remote_sink() {
        let under_test = build_session(true);
        let (mut writer, reader) = tokio::io::duplex(4096);

        let consumer = tokio::spawn(consume(under_test.session.clone(), reader));

        writer.write_all(&encode_frames(&["still here"])).await.unwrap();
        drop(writer);

        tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();

        under_test.session.remote.close().await;
        let calls = under_test.transport.calls();
        let delivered: Vec<String> = calls.lock().unwrap().iter().flatten().cloned().collect();
        assert_eq!(delivered, vec!["still here"]);
        assert!(under_test.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn decode_error_fails_the_stream_closed() {
        let under_test = build_session(false);
        let (mut writer, reader) = tokio::io::duplex(4096);

        let consumer = tokio::spawn(consume(under_test.session.clone(), reader));

        let mut bytes = encode_frames(&["good"]);
        // A frame claiming to be larger than the cap.
        bytes.extend_from_slice(&(crate::stream::MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        bytes.extend_from_slice(b"garbage");
        writer.write_all(&bytes).await.unwrap();

        // The loop must exit on the bad frame even with the writer open.
        tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*under_test.stored.lock().unwrap(), vec!["good"]);
    }

    #[tokio::test]
    async fn closed_session_stops_dispatching() {
        let under_test = build_session(false);
        let (mut writer, reader) = tokio::io::duplex(4096);

        {
            let mut open = under_test.session.is_open.write().await;
            *open = false;
        }

        let consumer = tokio::spawn(consume(under_test.session.clone(), reader));

        writer.write_all(&encode_frames(&["dropped"])).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();

        assert!(under_test.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_terminates_a_blocked_read() {
        let under_test = build_session(false);
        let (_writer, reader) = tokio::io::duplex(4096);

        let consumer = tokio::spawn(consume(under_test.session.clone(), reader));

        // No data arrives; the cancel token must still unblock the loop.
        under_test.session.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();
    }
}
