//! Verify command implementation.

use super::{load, select_journals, Snapshot};
use std::path::Path;

/// Verification result of one journal.
#[derive(Debug)]
pub struct VerifyResult {
    /// Journal name.
    pub name: String,
    /// Number of records checked.
    pub records_checked: u64,
    /// Bytes past the last complete frame.
    pub torn_bytes: u64,
    /// Ids missing between the first and the highest record.
    pub gaps: u64,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn new(name: String) -> Self {
        Self {
            name,
            records_checked: 0,
            torn_bytes: 0,
            gaps: 0,
            errors: Vec::new(),
        }
    }

    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, resource: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying journals at {:?}", path);
    println!();

    let files = select_journals(path, resource)?;
    if files.is_empty() {
        println!("No journals found (this may be normal for a new node)");
        return Ok(());
    }

    let mut failed = 0;
    for (name, file) in files {
        let result = verify_journal(load(name, file)?);
        print_result(&result);
        if !result.is_ok() {
            failed += 1;
        }
    }

    println!();
    if failed == 0 {
        println!("✓ Journal verification passed");
        Ok(())
    } else {
        println!("✗ Journal verification failed ({} journals)", failed);
        Err("Verification failed".into())
    }
}

fn verify_journal(snapshot: Snapshot) -> VerifyResult {
    let mut result = VerifyResult::new(snapshot.name);

    let journal = match snapshot.journal {
        Ok(journal) => journal,
        Err(e) => {
            result.errors.push(format!("cannot open: {}", e));
            return result;
        }
    };

    match journal.verify() {
        Ok(report) => {
            result.records_checked = report.records;
            result.gaps = report.gaps;
            // Opening cut a torn tail off the in-memory copy
            result.torn_bytes = snapshot.file_size.saturating_sub(report.bytes);
        }
        Err(e) => result.errors.push(e.to_string()),
    }
    result
}

fn print_result(result: &VerifyResult) {
    println!("{}:", result.name);
    println!("  Records checked: {}", result.records_checked);
    if result.gaps > 0 {
        println!("  Missing ids:     {} (recovered by synchronization)", result.gaps);
    }
    if result.torn_bytes > 0 {
        println!(
            "  Torn tail:       {} bytes (dropped on next open)",
            result.torn_bytes
        );
    }
    if result.is_ok() {
        println!("  Status:          OK");
    } else {
        println!("  Status:          FAILED");
        for error in &result.errors {
            println!("    - {}", error);
        }
    }
}
