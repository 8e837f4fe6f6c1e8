// SPDX-License-Identifier: Apache-2.0

//! The orchestrator: starts and stops per-container logging sessions and
//! answers `docker logs` read-back queries.

mod bridge;
mod registry;
mod session;

pub use session::Session;

use crate::errors::DriverError;
use crate::info::ContainerInfo;
use crate::insights::config::{InsightsConfig, WorkerDefaults};
use crate::insights::RemoteLogger;
use crate::store::{DurableSink, JsonFileSink, ReadConfig};
use registry::SessionRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::net::unix::pipe;
use tracing::{debug, error};

const READ_STREAM_BUFFER: usize = 64 * 1024;

pub struct LogDriver {
    registry: SessionRegistry,
    defaults: WorkerDefaults,
    log_dir: PathBuf,
}

impl LogDriver {
    pub fn new(defaults: WorkerDefaults, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            defaults,
            log_dir: log_dir.into(),
        }
    }

    /// Starts a logging session for the stream at `stream_path` (a FIFO the
    /// daemon writes framed records into). On success the consumer loop runs
    /// as an independent task; on any failure nothing is registered and no
    /// resources are left behind.
    pub async fn start_logging(
        &self,
        stream_path: &str,
        mut info: ContainerInfo,
    ) -> Result<(), DriverError> {
        if self.registry.load_by_path(stream_path).is_some() {
            return Err(DriverError::AlreadyExists(stream_path.to_string()));
        }
        if self
            .registry
            .load_by_container(&info.container_id)
            .is_some()
        {
            return Err(DriverError::AlreadyExists(info.container_id.clone()));
        }

        if info.log_path.is_empty() {
            info.log_path = self
                .log_dir
                .join(&info.container_id)
                .to_string_lossy()
                .into_owned();
        }
        let log_path = PathBuf::from(&info.log_path);

        let config = InsightsConfig::resolve(&info.config, &self.defaults)?;

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut store = JsonFileSink::open(&log_path)?;

        let info = Arc::new(info);
        let remote = match RemoteLogger::open(config, &info).await {
            Ok(remote) => remote,
            Err(e) => {
                let _ = store.close();
                return Err(e.into());
            }
        };

        let stream = match pipe::OpenOptions::new().open_receiver(stream_path) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = store.close();
                remote.close().await;
                return Err(DriverError::Io(e));
            }
        };

        debug!(
            container_id = %info.container_id,
            file = stream_path,
            log_path = %log_path.display(),
            "start logging"
        );

        let session = Arc::new(Session::new(
            stream_path.to_string(),
            info.clone(),
            Box::new(store),
            remote,
        ));

        if !self
            .registry
            .store(stream_path, &info.container_id, session.clone())
        {
            // Lost a race with a concurrent start; tear down what we built.
            let _ = session.close_store();
            session.remote.close().await;
            return Err(DriverError::AlreadyExists(stream_path.to_string()));
        }

        tokio::spawn(session::consume(session, stream));
        Ok(())
    }

    /// Stops the session for `stream_path`. A no-op for unknown paths.
    /// Cleanup is best-effort: every close runs regardless of earlier
    /// failures and the first error encountered is returned.
    pub async fn stop_logging(&self, stream_path: &str) -> Result<(), DriverError> {
        let Some(session) = self.registry.load_by_path(stream_path) else {
            debug!(file = stream_path, "stop logging for unknown stream");
            return Ok(());
        };

        debug!(file = stream_path, "stop logging");

        // Unblocks the consumer loop at its next read.
        session.cancel.cancel();

        let mut open = session.is_open.write().await;
        *open = false;

        let mut first_err: Option<DriverError> = None;
        if let Err(e) = session.close_store() {
            error!(file = stream_path, error = %e, "could not close local log store");
            first_err.get_or_insert(DriverError::Io(e));
        }
        session.remote.close().await;

        self.registry
            .delete(stream_path, &session.info.container_id);
        drop(open);

        first_err.map_or(Ok(()), Err)
    }

    /// Returns a byte stream of re-framed records from the container's
    /// durable store, fed by an independent bridging task.
    pub async fn read_logs(
        &self,
        container_id: &str,
        config: ReadConfig,
    ) -> Result<DuplexStream, DriverError> {
        let Some(session) = self.registry.load_by_container(container_id) else {
            return Err(DriverError::NotFound(container_id.to_string()));
        };

        let watcher = {
            let store = session.store.lock().unwrap_or_else(|e| e.into_inner());
            store.read_logs(&config)
        }
        .ok_or(DriverError::Unsupported)?;

        let (read_half, write_half) = tokio::io::duplex(READ_STREAM_BUFFER);
        tokio::spawn(bridge::run(watcher, write_half));
        Ok(read_half)
    }
}
