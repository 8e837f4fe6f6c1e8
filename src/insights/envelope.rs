// SPDX-License-Identifier: Apache-2.0

use crate::info::ContainerInfo;
use crate::stream::LogRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

const ENVELOPE_NAME: &str = "Microsoft.ApplicationInsights.Message";
const MESSAGE_BASE_TYPE: &str = "MessageData";
const SEVERITY_VERBOSE: u8 = 0;

/// One telemetry-ready unit for the track endpoint. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub name: &'static str,
    /// UTC, second precision.
    pub time: String,
    #[serde(rename = "iKey")]
    pub i_key: String,
    pub data: Data,
}

#[derive(Debug, Clone, Serialize)]
pub struct Data {
    #[serde(rename = "baseType")]
    pub base_type: &'static str,
    #[serde(rename = "baseData")]
    pub base_data: MessageData,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageData {
    pub ver: u32,
    pub message: String,
    #[serde(rename = "severityLevel")]
    pub severity_level: u8,
    pub properties: BTreeMap<String, String>,
}

/// Builds envelopes for one session. The static container context is
/// snapshotted once at construction; per-record attributes and the source tag
/// are merged on top for every record, later keys winning on collision.
pub struct EnvelopeBuilder {
    i_key: String,
    context: BTreeMap<String, String>,
}

impl EnvelopeBuilder {
    pub fn new(i_key: String, info: &ContainerInfo) -> Self {
        Self {
            i_key,
            context: static_context(info),
        }
    }

    pub fn build(&self, record: &LogRecord) -> Envelope {
        let mut properties = self.context.clone();
        for (key, value) in &record.attrs {
            properties.insert(key.clone(), value.clone());
        }
        properties.insert("source".to_string(), record.source.clone());

        Envelope {
            name: ENVELOPE_NAME,
            time: format_time(record.timestamp),
            i_key: self.i_key.clone(),
            data: Data {
                base_type: MESSAGE_BASE_TYPE,
                base_data: MessageData {
                    ver: 2,
                    message: String::from_utf8_lossy(&record.line).into_owned(),
                    severity_level: SEVERITY_VERBOSE,
                    properties,
                },
            },
        }
    }
}

fn format_time(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn static_context(info: &ContainerInfo) -> BTreeMap<String, String> {
    let mut context = BTreeMap::new();
    let mut put = |key: &str, value: &str| {
        if !value.is_empty() {
            context.insert(key.to_string(), value.to_string());
        }
    };

    put("ContainerID", &info.container_id);
    put("ContainerName", &info.container_name);
    put("ContainerEntrypoint", &info.container_entrypoint);
    put("ContainerImageID", &info.container_image_id);
    put("ContainerImageName", &info.container_image_name);
    put("LogPath", &info.log_path);
    put("DaemonName", &info.daemon_name);

    if let Some(created) = info.container_created {
        context.insert("ContainerCreated".to_string(), created.to_rfc3339());
    }
    if !info.container_args.is_empty() {
        if let Ok(args) = serde_json::to_string(&info.container_args) {
            context.insert("ContainerArgs".to_string(), args);
        }
    }
    if !info.container_env.is_empty() {
        if let Ok(env) = serde_json::to_string(&info.container_env) {
            context.insert("ContainerEnv".to_string(), env);
        }
    }
    if !info.container_labels.is_empty() {
        if let Ok(labels) = serde_json::to_string(&info.container_labels) {
            context.insert("ContainerLabels".to_string(), labels);
        }
    }
    if !info.config.is_empty() {
        if let Ok(config) = serde_json::to_string(&info.config) {
            context.insert("Config".to_string(), config);
        }
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn record(line: &str, source: &str) -> LogRecord {
        LogRecord {
            line: Bytes::from(line.as_bytes().to_vec()),
            source: source.to_string(),
            partial: false,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 45).unwrap(),
            attrs: Vec::new(),
        }
    }

    #[test]
    fn inflates_record_with_session_context() {
        let info = ContainerInfo {
            container_id: "abc123".to_string(),
            ..Default::default()
        };
        let builder = EnvelopeBuilder::new("some token".to_string(), &info);

        let mut rec = record("hello", "stdout");
        rec.attrs.push(("Hello".to_string(), "World".to_string()));
        let envelope = builder.build(&rec);

        assert_eq!(envelope.name, "Microsoft.ApplicationInsights.Message");
        assert_eq!(envelope.i_key, "some token");
        assert_eq!(envelope.time, "2024-03-01T10:30:45Z");

        let data = &envelope.data.base_data;
        assert_eq!(data.message, "hello");
        assert_eq!(data.severity_level, 0);
        assert_eq!(data.properties.get("source").unwrap(), "stdout");
        assert_eq!(data.properties.get("ContainerID").unwrap(), "abc123");
        assert_eq!(data.properties.get("Hello").unwrap(), "World");
    }

    #[test]
    fn later_keys_win_on_collision() {
        let info = ContainerInfo {
            container_id: "abc123".to_string(),
            ..Default::default()
        };
        let builder = EnvelopeBuilder::new("t".to_string(), &info);

        // A record attribute shadows the static context; the source tag
        // shadows a record attribute of the same name.
        let mut rec = record("hello", "stderr");
        rec.attrs.push(("ContainerID".to_string(), "override".to_string()));
        rec.attrs.push(("source".to_string(), "fake".to_string()));
        let envelope = builder.build(&rec);

        let props = &envelope.data.base_data.properties;
        assert_eq!(props.get("ContainerID").unwrap(), "override");
        assert_eq!(props.get("source").unwrap(), "stderr");
    }

    #[test]
    fn serializes_contract_field_names() {
        let info = ContainerInfo::default();
        let builder = EnvelopeBuilder::new("key".to_string(), &info);
        let envelope = builder.build(&record("msg", "stdout"));

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["iKey"], "key");
        assert_eq!(json["data"]["baseType"], "MessageData");
        assert_eq!(json["data"]["baseData"]["severityLevel"], 0);
        assert_eq!(json["data"]["baseData"]["properties"]["source"], "stdout");
    }

    #[test]
    fn context_serializes_structured_fields_as_json() {
        let mut info = ContainerInfo {
            container_id: "abc".to_string(),
            container_args: vec!["--flag".to_string()],
            ..Default::default()
        };
        info.container_labels
            .insert("team".to_string(), "infra".to_string());

        let builder = EnvelopeBuilder::new("t".to_string(), &info);
        let envelope = builder.build(&record("m", "stdout"));
        let props = &envelope.data.base_data.properties;

        assert_eq!(props.get("ContainerArgs").unwrap(), r#"["--flag"]"#);
        assert_eq!(props.get("ContainerLabels").unwrap(), r#"{"team":"infra"}"#);
    }
}
