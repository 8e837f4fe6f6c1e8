// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Static metadata the daemon hands over when a container's log stream is
/// started. Field names mirror the docker plugin wire format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerInfo {
    /// Driver options for this container (`--log-opt` key/value pairs).
    #[serde(rename = "Config")]
    pub config: BTreeMap<String, String>,

    #[serde(rename = "ContainerID")]
    pub container_id: String,

    #[serde(rename = "ContainerName")]
    pub container_name: String,

    #[serde(rename = "ContainerEntrypoint")]
    pub container_entrypoint: String,

    #[serde(rename = "ContainerArgs")]
    pub container_args: Vec<String>,

    #[serde(rename = "ContainerImageID")]
    pub container_image_id: String,

    #[serde(rename = "ContainerImageName")]
    pub container_image_name: String,

    #[serde(rename = "ContainerCreated")]
    pub container_created: Option<DateTime<Utc>>,

    #[serde(rename = "ContainerEnv")]
    pub container_env: Vec<String>,

    #[serde(rename = "ContainerLabels")]
    pub container_labels: BTreeMap<String, String>,

    /// Where the durable JSON store for this container lives. Resolved to a
    /// default under the daemon log directory when empty.
    #[serde(rename = "LogPath")]
    pub log_path: String,

    #[serde(rename = "DaemonName")]
    pub daemon_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_daemon_payload() {
        let raw = r#"{
            "Config": {"token": "abc"},
            "ContainerID": "deadbeef",
            "ContainerName": "/web",
            "ContainerImageName": "nginx:latest",
            "ContainerCreated": "2024-03-01T10:00:00Z",
            "ContainerLabels": {"team": "infra"},
            "DaemonName": "docker"
        }"#;

        let info: ContainerInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.container_id, "deadbeef");
        assert_eq!(info.config.get("token").unwrap(), "abc");
        assert_eq!(info.container_labels.get("team").unwrap(), "infra");
        assert!(info.log_path.is_empty());
        assert!(info.container_created.is_some());
    }
}
