//! Inspect command implementation.

use super::{load, select_journals, Snapshot};
use serde::Serialize;
use std::path::Path;

/// Summary of one journal.
#[derive(Debug, Serialize)]
pub struct JournalSummary {
    /// Journal name (resource manager id).
    pub name: String,
    /// Journal file path.
    pub path: String,
    /// File size in bytes.
    pub file_size: u64,
    /// Number of records.
    pub records: u64,
    /// Number of committed records.
    pub committed: u64,
    /// Number of rollback markers.
    pub rolled_back: u64,
    /// Highest id with every id below it journaled, -1 if none.
    pub last_complete_tx: i64,
    /// Highest journaled id, -1 if none.
    pub max_tx: i64,
    /// Ids missing between the first and the highest record.
    pub gaps: u64,
    /// Error that kept the journal from loading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal directory path.
    pub path: String,
    /// Total size of all journals in bytes.
    pub total_size: u64,
    /// Per-journal summaries.
    pub journals: Vec<JournalSummary>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let files = select_journals(path, None)?;
    if files.is_empty() {
        return Err(format!("No journals found at {:?}", path).into());
    }

    let mut result = InspectResult {
        path: path.display().to_string(),
        total_size: 0,
        journals: Vec::new(),
    };
    for (name, file) in files {
        let summary = summarize(load(name, file)?);
        result.total_size += summary.file_size;
        result.journals.push(summary);
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn summarize(snapshot: Snapshot) -> JournalSummary {
    let mut summary = JournalSummary {
        name: snapshot.name,
        path: snapshot.path.display().to_string(),
        file_size: snapshot.file_size,
        records: 0,
        committed: 0,
        rolled_back: 0,
        last_complete_tx: -1,
        max_tx: -1,
        gaps: 0,
        error: None,
    };

    let journal = match snapshot.journal {
        Ok(journal) => journal,
        Err(e) => {
            summary.error = Some(e.to_string());
            return summary;
        }
    };
    summary.last_complete_tx = journal.last_tx_id().as_i64();
    summary.max_tx = journal.max_tx_id().as_i64();

    match journal.verify() {
        Ok(report) => {
            summary.records = report.records;
            summary.committed = report.committed;
            summary.rolled_back = report.rolled_back;
            summary.gaps = report.gaps;
        }
        Err(e) => summary.error = Some(e.to_string()),
    }
    summary
}

fn print_text_output(result: &InspectResult) {
    println!("Journal Directory: {}", result.path);
    println!("==================");
    println!();
    println!("Total Size: {} bytes", result.total_size);
    println!("Journals:   {}", result.journals.len());

    for journal in &result.journals {
        println!();
        println!("{}", journal.name);
        println!("  File:          {} ({} bytes)", journal.path, journal.file_size);
        if let Some(ref error) = journal.error {
            println!("  Error:         {}", error);
            continue;
        }
        println!(
            "  Records:       {} ({} committed, {} rolled back)",
            journal.records, journal.committed, journal.rolled_back
        );
        println!("  Last complete: {}", journal.last_complete_tx);
        println!("  Highest:       {}", journal.max_tx);
        if journal.gaps > 0 {
            println!("  Gaps:          {}", journal.gaps);
        }
    }
}
