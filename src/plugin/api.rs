// SPDX-License-Identifier: Apache-2.0

use crate::info::ContainerInfo;
use crate::store::ReadConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct StartLoggingRequest {
    #[serde(rename = "File")]
    pub file: String,
    #[serde(rename = "Info")]
    pub info: ContainerInfo,
}

#[derive(Debug, Deserialize)]
pub struct StopLoggingRequest {
    #[serde(rename = "File")]
    pub file: String,
}

#[derive(Debug, Deserialize)]
pub struct ReadLogsRequest {
    #[serde(rename = "Info")]
    pub info: ContainerInfo,
    #[serde(rename = "Config", default)]
    pub config: ReadConfig,
}

/// The daemon treats a non-empty `Err` as the operation failing.
#[derive(Debug, Serialize)]
pub struct PluginResponse {
    #[serde(rename = "Err")]
    pub err: String,
}

impl PluginResponse {
    pub fn ok() -> Self {
        Self { err: String::new() }
    }

    pub fn error(err: impl ToString) -> Self {
        Self {
            err: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActivateResponse {
    #[serde(rename = "Implements")]
    pub implements: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CapabilitiesResponse {
    #[serde(rename = "Cap")]
    pub cap: Capability,
}

#[derive(Debug, Serialize)]
pub struct Capability {
    #[serde(rename = "ReadLogs")]
    pub read_logs: bool,
}
