// SPDX-License-Identifier: Apache-2.0

use crate::bounded_channel::BoundedReceiver;
use crate::insights::config::InsightsConfig;
use crate::insights::envelope::Envelope;
use crate::insights::transport::Transport;
use std::sync::Arc;
use tokio::select;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Background batching/retry loop, one per remote sink. Owns the receive side
/// of the input queue; the queue closing is the drain signal, and `drained` is
/// cancelled once the final flush has completed.
pub(crate) struct DeliveryWorker<T> {
    transport: T,
    config: Arc<InsightsConfig>,
    rx: BoundedReceiver<Envelope>,
    drained: CancellationToken,
}

impl<T: Transport> DeliveryWorker<T> {
    pub(crate) fn new(
        transport: T,
        config: Arc<InsightsConfig>,
        rx: BoundedReceiver<Envelope>,
        drained: CancellationToken,
    ) -> Self {
        Self {
            transport,
            config,
            rx,
            drained,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = interval_at(
            Instant::now() + self.config.batch_interval,
            self.config.batch_interval,
        );
        let mut pending: Vec<Envelope> = Vec::new();

        loop {
            select! {
                maybe = self.rx.next() => match maybe {
                    Some(envelope) => {
                        pending.push(envelope);
                        // Flush only on exact batch multiples, so a failing
                        // endpoint is not retried on every single append.
                        if pending.len() % self.config.batch_size == 0 {
                            pending = self.post_messages(pending, false).await;
                        }
                    }
                    None => {
                        // Input queue closed: mandatory final flush, then
                        // release everyone blocked in close().
                        self.post_messages(pending, true).await;
                        debug!("delivery worker drained");
                        self.drained.cancel();
                        return;
                    }
                },
                _ = ticker.tick() => {
                    pending = self.post_messages(pending, false).await;
                }
            }
        }
    }

    /// Delivers the pending buffer in chunks of at most `batch_size`,
    /// returning whatever remains pending. On a failed chunk the buffer is
    /// kept for the next flush, unless the undelivered remainder exceeds
    /// `buffer_maximum` (or this is the final flush), in which case the
    /// oldest chunks are dropped until the retained tail fits the cap, each
    /// dropped envelope serialized into the operational log.
    async fn post_messages(&self, mut pending: Vec<Envelope>, last_chance: bool) -> Vec<Envelope> {
        let total = pending.len();
        let batch_size = self.config.batch_size;
        let mut sent = 0;

        while sent < total {
            let upper = usize::min(sent + batch_size, total);
            match self.transport.post_batch(&pending[sent..upper]).await {
                Ok(()) => sent = upper,
                Err(e) => {
                    warn!(error = %e, pending = total - sent, "error while sending logs");

                    if !last_chance && total - sent <= self.config.buffer_maximum {
                        // Transient failure with room to spare; retry the
                        // whole remainder on the next flush trigger.
                        return pending.split_off(sent);
                    }

                    let mut drop_upper = if last_chance { total } else { upper };
                    while total - drop_upper > self.config.buffer_maximum {
                        drop_upper = usize::min(drop_upper + batch_size, total);
                    }

                    let tail = pending.split_off(drop_upper);
                    for envelope in pending.drain(sent..) {
                        match serde_json::to_string(&envelope) {
                            Ok(json) => error!(envelope = %json, "dropping undeliverable envelope"),
                            Err(e) => error!(error = %e, "dropping undeliverable envelope"),
                        }
                    }
                    return tail;
                }
            }
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;
    use crate::info::ContainerInfo;
    use crate::insights::envelope::EnvelopeBuilder;
    use crate::insights::test_support::{test_config, RecordingTransport};
    use crate::stream::LogRecord;
    use bytes::Bytes;
    use chrono::Utc;

    fn envelopes(n: usize) -> Vec<Envelope> {
        let builder = EnvelopeBuilder::new("t".to_string(), &ContainerInfo::default());
        (0..n)
            .map(|i| {
                builder.build(&LogRecord {
                    line: Bytes::from(format!("msg-{}", i)),
                    source: "stdout".to_string(),
                    partial: false,
                    timestamp: Utc::now(),
                    attrs: Vec::new(),
                })
            })
            .collect()
    }

    fn worker(transport: RecordingTransport, batch_size: usize, buffer_maximum: usize) -> DeliveryWorker<RecordingTransport> {
        let (_tx, rx) = bounded(1);
        let mut config = test_config();
        config.batch_size = batch_size;
        config.buffer_maximum = buffer_maximum;
        DeliveryWorker::new(transport, Arc::new(config), rx, CancellationToken::new())
    }

    #[tokio::test]
    async fn full_success_returns_empty_buffer() {
        let transport = RecordingTransport::succeeding();
        let calls = transport.calls();
        let w = worker(transport, 2, 10);

        let remaining = w.post_messages(envelopes(5), false).await;
        assert!(remaining.is_empty());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].len(), 2);
        assert_eq!(calls[1].len(), 2);
        assert_eq!(calls[2].len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_below_cap_keeps_everything() {
        let transport = RecordingTransport::failing();
        let calls = transport.calls();
        let w = worker(transport, 2, 10);

        let remaining = w.post_messages(envelopes(5), false).await;
        assert_eq!(remaining.len(), 5);
        // Stops at the first failed chunk.
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn over_cap_drops_oldest_chunks_down_to_the_cap() {
        let transport = RecordingTransport::failing();
        let w = worker(transport, 5, 10);

        let remaining = w.post_messages(envelopes(15), false).await;
        assert_eq!(remaining.len(), 10);
        assert_eq!(remaining[0].data.base_data.message, "msg-5");
        assert_eq!(remaining[9].data.base_data.message, "msg-14");
    }

    #[tokio::test]
    async fn partial_success_then_failure_returns_the_tail() {
        let transport = RecordingTransport::failing_after(1);
        let calls = transport.calls();
        let w = worker(transport, 2, 10);

        let remaining = w.post_messages(envelopes(5), false).await;
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining[0].data.base_data.message, "msg-2");
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn last_chance_drops_all_undelivered() {
        let transport = RecordingTransport::failing();
        let w = worker(transport, 2, 100);

        let remaining = w.post_messages(envelopes(5), true).await;
        assert!(remaining.is_empty());
    }
}
