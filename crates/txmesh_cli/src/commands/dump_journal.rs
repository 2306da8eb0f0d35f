//! Dump journal command implementation.

use super::{hex_encode, load, select_journals};
use serde::Serialize;
use std::path::Path;
use txmesh_protocol::JournalRecord;

const PREVIEW_BYTES: usize = 16;

/// Journal record representation for output.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Journal the record belongs to.
    pub journal: String,
    /// Offset in the journal file.
    pub offset: u64,
    /// Record kind.
    pub kind: &'static str,
    /// Transaction id.
    pub tx_id: i64,
    /// Task id.
    pub task_id: String,
    /// Payload size in bytes (committed records only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<usize>,
    /// First payload bytes, hex-encoded (committed records only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_preview: Option<String>,
}

impl RecordInfo {
    fn new(journal: &str, offset: u64, record: &JournalRecord) -> Self {
        let (kind, payload) = match record {
            JournalRecord::Committed(entry) => ("COMMITTED", Some(&entry.payload)),
            JournalRecord::RolledBack { .. } => ("ROLLED_BACK", None),
        };
        Self {
            journal: journal.to_string(),
            offset,
            kind,
            tx_id: record.tx_id().as_i64(),
            task_id: record.task_id().to_string(),
            payload_size: payload.map(Vec::len),
            payload_preview: payload.map(|p| hex_encode(&p[..PREVIEW_BYTES.min(p.len())])),
        }
    }
}

/// Runs the dump-journal command.
pub fn run(
    path: &Path,
    resource: Option<&str>,
    after: Option<i64>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut records = Vec::new();
    for (name, file) in select_journals(path, resource)? {
        records.extend(read_records(&name, file, after, limit)?);
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records);
        }
    }

    Ok(())
}

fn read_records(
    name: &str,
    file: std::path::PathBuf,
    after: Option<i64>,
    limit: Option<usize>,
) -> Result<Vec<RecordInfo>, Box<dyn std::error::Error>> {
    let snapshot = load(name.to_string(), file)?;
    let journal = snapshot.journal?;
    let max_records = limit.unwrap_or(usize::MAX);

    let mut records = Vec::new();
    for item in journal.iter()? {
        if records.len() >= max_records {
            break;
        }
        let (offset, record) = item?;
        if after.is_some_and(|after| record.tx_id().as_i64() <= after) {
            continue;
        }
        records.push(RecordInfo::new(name, offset, &record));
    }
    Ok(records)
}

fn print_text_output(records: &[RecordInfo]) {
    println!("Journal Records ({} total)", records.len());
    println!("================");
    println!();

    for record in records {
        print!(
            "{:12} [{:08}] {:11} tx={} task={}",
            record.journal, record.offset, record.kind, record.tx_id, record.task_id
        );
        if let Some(size) = record.payload_size {
            print!(" payload={} bytes", size);
        }
        if let Some(ref preview) = record.payload_preview {
            if !preview.is_empty() {
                print!(" [{}]", preview);
            }
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txmesh_protocol::{JournalEntry, ResourceId, TaskId, TxId};

    #[test]
    fn committed_record_carries_payload_preview() {
        let record = JournalRecord::Committed(JournalEntry {
            tx_id: TxId::new(4),
            resource: ResourceId::from("blocks"),
            task_id: TaskId::nil(),
            payload: (0u8..20).collect(),
        });

        let info = RecordInfo::new("blocks", 0, &record);
        assert_eq!(info.kind, "COMMITTED");
        assert_eq!(info.tx_id, 4);
        assert_eq!(info.payload_size, Some(20));
        assert_eq!(info.payload_preview.unwrap().len(), PREVIEW_BYTES * 2);
    }

    #[test]
    fn rolled_back_record_has_no_payload() {
        let record = JournalRecord::RolledBack {
            tx_id: TxId::new(2),
            task_id: TaskId::nil(),
        };

        let info = RecordInfo::new("blocks", 33, &record);
        assert_eq!(info.kind, "ROLLED_BACK");
        assert!(info.payload_size.is_none());
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("payload"));
    }
}
