// SPDX-License-Identifier: Apache-2.0

use crate::bounded_channel::{bounded, BoundedSender};
use crate::store::{DurableSink, LogWatcher, ReadConfig};
use crate::stream::LogRecord;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio_util::sync::CancellationToken;

const WATCHER_CHANNEL_SIZE: usize = 1024;
const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Durable sink writing one JSON object per line, docker jsonfile style:
/// `{"log":"...","stream":"stdout","time":"..."}`. Supports tailing
/// read-back for `docker logs`.
pub struct JsonFileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonLogLine {
    log: String,
    stream: String,
    time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attrs: Option<BTreeMap<String, String>>,
}

impl JsonFileSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }
}

impl DurableSink for JsonFileSink {
    fn log(&mut self, record: &LogRecord) -> std::io::Result<()> {
        let line = JsonLogLine {
            log: String::from_utf8_lossy(&record.line).into_owned(),
            stream: record.source.clone(),
            time: record
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
            attrs: if record.attrs.is_empty() {
                None
            } else {
                Some(record.attrs.iter().cloned().collect())
            },
        };

        serde_json::to_writer(&mut self.writer, &line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.writer.write_all(b"\n")?;
        // Flush per record so tailers observe complete lines.
        self.writer.flush()
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    fn read_logs(&self, config: &ReadConfig) -> Option<LogWatcher> {
        let (record_tx, records) = bounded(WATCHER_CHANNEL_SIZE);
        let (error_tx, errors) = bounded(1);
        let cancel = CancellationToken::new();

        tokio::spawn(tail_file(
            self.path.clone(),
            config.clone(),
            record_tx,
            error_tx,
            cancel.clone(),
        ));

        Some(LogWatcher::new(records, errors, cancel))
    }
}

async fn tail_file(
    path: PathBuf,
    config: ReadConfig,
    record_tx: BoundedSender<LogRecord>,
    error_tx: BoundedSender<std::io::Error>,
    cancel: CancellationToken,
) {
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            let _ = error_tx.send(e).await;
            return;
        }
    };
    let mut reader = BufReader::new(file);
    let mut line = String::new();

    // Existing content first, keeping only the requested tail. A trailing
    // line without a newline is a write still in progress; it stays in the
    // buffer for the follow loop to finish.
    let mut existing: VecDeque<LogRecord> = VecDeque::new();
    loop {
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if !line.ends_with('\n') {
                    continue;
                }
                match parse_line(&line) {
                    Ok(record) => {
                        line.clear();
                        existing.push_back(record);
                        if config.tail > 0 && existing.len() > config.tail as usize {
                            existing.pop_front();
                        }
                    }
                    Err(e) => {
                        let _ = error_tx.send(e).await;
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = error_tx.send(e).await;
                return;
            }
        }
    }

    if !line.is_empty() && !config.follow {
        // End of a non-follow read: whatever is on the final line is all the
        // record there will ever be.
        match parse_line(&line) {
            Ok(record) => {
                line.clear();
                existing.push_back(record);
                if config.tail > 0 && existing.len() > config.tail as usize {
                    existing.pop_front();
                }
            }
            Err(e) => {
                let _ = error_tx.send(e).await;
                return;
            }
        }
    }

    for record in existing {
        select! {
            _ = cancel.cancelled() => return,
            sent = record_tx.send(record) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }

    if !config.follow {
        // Dropping the senders closes the channels, the watcher's clean end.
        return;
    }

    let mut poll = tokio::time::interval(FOLLOW_POLL_INTERVAL);
    loop {
        select! {
            _ = cancel.cancelled() => return,
            _ = poll.tick() => loop {
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        // Lines are written atomically with a trailing
                        // newline; anything else is a partial write still in
                        // progress, picked up on the next poll.
                        if !line.ends_with('\n') {
                            break;
                        }
                        match parse_line(&line) {
                            Ok(record) => {
                                line.clear();
                                select! {
                                    _ = cancel.cancelled() => return,
                                    sent = record_tx.send(record) => {
                                        if sent.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = error_tx.send(e).await;
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = error_tx.send(e).await;
                        return;
                    }
                }
            },
        }
    }
}

fn parse_line(line: &str) -> std::io::Result<LogRecord> {
    let parsed: JsonLogLine = serde_json::from_str(line.trim_end())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&parsed.time)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        .with_timezone(&Utc);

    Ok(LogRecord {
        line: Bytes::from(parsed.log.into_bytes()),
        source: parsed.stream,
        partial: false,
        timestamp,
        attrs: parsed
            .attrs
            .map(|attrs| attrs.into_iter().collect())
            .unwrap_or_default(),
    })
}
