// SPDX-License-Identifier: Apache-2.0

//! The remote telemetry sink: envelope construction, batching delivery
//! worker, and its HTTP transport.

pub mod config;
pub mod envelope;
mod tls;
pub mod transport;
mod worker;

use crate::bounded_channel::{bounded, BoundedSender};
use crate::info::ContainerInfo;
use crate::insights::config::InsightsConfig;
use crate::insights::envelope::{Envelope, EnvelopeBuilder};
use crate::insights::transport::{DeliveryError, HttpTransport, Transport};
use crate::insights::worker::DeliveryWorker;
use crate::stream::LogRecord;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote logger is closed")]
    Closed,

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Handle to one delivery worker. `log` enqueues onto the worker's bounded
/// input queue (suspending when it is full — the upstream backpressure
/// signal); `close` drains the worker and blocks until it reaches its
/// terminal state. Lifecycle: open until the first `close` call, draining
/// while the final flush runs, then closed for good.
pub struct RemoteLogger {
    builder: EnvelopeBuilder,
    tx: RwLock<Option<BoundedSender<Envelope>>>,
    drained: CancellationToken,
}

impl RemoteLogger {
    /// Builds the HTTP transport for the resolved configuration, optionally
    /// probes the endpoint, and starts the delivery worker.
    pub async fn open(config: InsightsConfig, info: &ContainerInfo) -> Result<Self, RemoteError> {
        let transport = HttpTransport::new(&config)?;
        if config.verify_connection {
            transport.verify_connection().await?;
        }
        Ok(Self::start(config, info, transport))
    }

    pub(crate) fn start<T: Transport>(
        config: InsightsConfig,
        info: &ContainerInfo,
        transport: T,
    ) -> Self {
        let builder = EnvelopeBuilder::new(config.instrumentation_key.clone(), info);
        let (tx, rx) = bounded(config.channel_capacity);
        let drained = CancellationToken::new();

        let delivery_worker = DeliveryWorker::new(transport, Arc::new(config), rx, drained.clone());
        tokio::spawn(delivery_worker.run());

        Self {
            builder,
            tx: RwLock::new(Some(tx)),
            drained,
        }
    }

    /// Builds an envelope for the record and enqueues it. Fails with
    /// [`RemoteError::Closed`] once `close` has begun; the read lock makes
    /// the check race safely against a concurrent close.
    pub async fn log(&self, record: LogRecord) -> Result<(), RemoteError> {
        let envelope = self.builder.build(&record);

        let guard = self.tx.read().await;
        match guard.as_ref() {
            None => Err(RemoteError::Closed),
            Some(tx) => tx.send(envelope).await.map_err(|_| RemoteError::Closed),
        }
    }

    /// Closes the input queue and waits for the worker's final flush.
    /// Idempotent; every concurrent caller is released together once the
    /// worker reaches its terminal state.
    pub async fn close(&self) {
        {
            let mut guard = self.tx.write().await;
            // Dropping the only sender closes the queue; the worker drains
            // what is buffered and performs the last-chance flush.
            guard.take();
        }
        self.drained.cancelled().await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::insights::config::{InsightsConfig, DEFAULT_ENDPOINT};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    pub(crate) fn test_config() -> InsightsConfig {
        InsightsConfig {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            instrumentation_key: "some token".to_string(),
            insecure_skip_verify: false,
            gzip: false,
            gzip_level: 6,
            verify_connection: false,
            batch_size: 2,
            batch_interval: Duration::from_secs(3600),
            channel_capacity: 64,
            buffer_maximum: 10,
            send_timeout: Duration::from_secs(30),
        }
    }

    /// Transport double that records every batch and fails on demand.
    #[derive(Clone)]
    pub(crate) struct RecordingTransport {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
        succeed_first: Arc<AtomicUsize>,
    }

    impl RecordingTransport {
        pub(crate) fn succeeding() -> Self {
            Self::failing_after(usize::MAX)
        }

        pub(crate) fn failing() -> Self {
            Self::failing_after(0)
        }

        /// Succeeds for the first `n` calls, fails afterwards.
        pub(crate) fn failing_after(n: usize) -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                succeed_first: Arc::new(AtomicUsize::new(n)),
            }
        }

        pub(crate) fn calls(&self) -> Arc<Mutex<Vec<Vec<String>>>> {
            self.calls.clone()
        }

        /// Flips the transport back to unconditional success.
        pub(crate) fn recover(&self) {
            self.succeed_first.store(usize::MAX, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn post_batch(&self, batch: &[Envelope]) -> Result<(), DeliveryError> {
            let messages = batch
                .iter()
                .map(|e| e.data.base_data.message.clone())
                .collect();
            self.calls.lock().unwrap().push(messages);

            let remaining = self.succeed_first.load(Ordering::SeqCst);
            if remaining == 0 {
                return Err(DeliveryError::Http("synthetic failure".to_string()));
            }
            if remaining != usize::MAX {
                self.succeed_first.store(remaining - 1, Ordering::SeqCst);
            }
            Ok(())
        }
    }
}
