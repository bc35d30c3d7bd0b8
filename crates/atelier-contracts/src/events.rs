use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Every line a batch writes to its event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchEvent {
    BatchStarted,
    TaskStarted,
    AttemptFinished,
    TaskFinished,
    TaskSkipped,
    BatchFinished,
}

impl BatchEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BatchStarted => "batch_started",
            Self::TaskStarted => "task_started",
            Self::AttemptFinished => "attempt_finished",
            Self::TaskFinished => "task_finished",
            Self::TaskSkipped => "task_skipped",
            Self::BatchFinished => "batch_finished",
        }
    }
}

impl fmt::Display for BatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only JSONL log for one batch.
///
/// Each line carries `type`, `batch_id`, `seq` and `ts`; `seq` counts from 1
/// per writer and is never reused. Payload keys may not shadow those four.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventLog>,
}

#[derive(Debug)]
struct EventLog {
    path: PathBuf,
    batch_id: String,
    next_seq: Mutex<u64>,
}

const RESERVED_KEYS: &[&str] = &["type", "batch_id", "seq", "ts"];

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, batch_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLog {
                path: path.into(),
                batch_id: batch_id.into(),
                next_seq: Mutex::new(1),
            }),
        }
    }

    pub fn emit(&self, event: BatchEvent, payload: EventPayload) -> anyhow::Result<Value> {
        if let Some(parent) = self.inner.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Holding the counter lock while appending keeps `seq` in file order.
        let mut next_seq = self
            .inner
            .next_seq
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;

        let mut record = Map::new();
        record.insert("type".to_string(), Value::String(event.as_str().to_string()));
        record.insert(
            "batch_id".to_string(),
            Value::String(self.inner.batch_id.clone()),
        );
        record.insert("seq".to_string(), Value::from(*next_seq));
        record.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                record.insert(key, value);
            }
        }

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?
            .write_all(line.as_bytes())?;
        *next_seq += 1;

        Ok(Value::Object(record))
    }
}

/// Parses an event log back into records, skipping lines that are not JSON objects.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<EventPayload>> {
    let raw = fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(record)) => Some(record),
            _ => None,
        })
        .collect())
}

/// The `type` of every record in file order.
pub fn read_event_types(path: &Path) -> anyhow::Result<Vec<String>> {
    Ok(read_events(path)?
        .iter()
        .filter_map(|record| record.get("type").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

pub(crate) fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::{json, Value};

    use super::{read_event_types, read_events, BatchEvent, EventPayload, EventWriter};

    #[test]
    fn records_carry_batch_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "batch-123");

        let mut payload = EventPayload::new();
        payload.insert("input_dir".to_string(), json!("/tmp/original"));
        let emitted = writer.emit(BatchEvent::BatchStarted, payload)?;

        let records = read_events(&path)?;
        assert_eq!(records.len(), 1);
        assert_eq!(Value::Object(records[0].clone()), emitted);
        assert_eq!(emitted["type"], json!("batch_started"));
        assert_eq!(emitted["batch_id"], json!("batch-123"));
        assert_eq!(emitted["seq"], json!(1));
        assert_eq!(emitted["input_dir"], json!("/tmp/original"));
        DateTime::parse_from_rfc3339(emitted["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn payload_cannot_shadow_reserved_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "batch-123");

        let mut payload = EventPayload::new();
        payload.insert("batch_id".to_string(), json!("other"));
        payload.insert("seq".to_string(), json!(99));
        payload.insert("image".to_string(), json!("look-01.png"));
        let emitted = writer.emit(BatchEvent::TaskStarted, payload)?;

        assert_eq!(emitted["batch_id"], json!("batch-123"));
        assert_eq!(emitted["seq"], json!(1));
        assert_eq!(emitted["image"], json!("look-01.png"));
        Ok(())
    }

    #[test]
    fn sequence_follows_file_order_across_clones() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "batch-123");
        let clone = writer.clone();

        writer.emit(BatchEvent::TaskStarted, EventPayload::new())?;
        clone.emit(BatchEvent::AttemptFinished, EventPayload::new())?;
        writer.emit(BatchEvent::TaskFinished, EventPayload::new())?;
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut file| std::io::Write::write_all(&mut file, b"not json\n"))?;

        assert_eq!(
            read_event_types(&path)?,
            vec!["task_started", "attempt_finished", "task_finished"]
        );
        let seqs = read_events(&path)?
            .iter()
            .filter_map(|record| record.get("seq").and_then(Value::as_u64))
            .collect::<Vec<u64>>();
        assert_eq!(seqs, vec![1, 2, 3]);
        Ok(())
    }
}
