// SPDX-License-Identifier: Apache-2.0

use crate::insights::config::ConfigError;
use crate::insights::transport::DeliveryError;
use crate::insights::RemoteError;

/// Error taxonomy for the driver surface. Setup failures abort session
/// creation entirely; per-record failures never reach this type, they are
/// logged and swallowed on the dispatch path.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("logger for {0:?} already exists")]
    AlreadyExists(String),

    #[error("no active logger for container {0:?}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("local log store does not support reading")]
    Unsupported,

    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("remote logger is closed")]
    Closed,
}

impl From<RemoteError> for DriverError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Closed => DriverError::Closed,
            RemoteError::Delivery(e) => DriverError::Delivery(e),
        }
    }
}
