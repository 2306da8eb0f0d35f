//! CLI command implementations.

pub mod dump_journal;
pub mod inspect;
pub mod verify;

use std::fs;
use std::path::{Path, PathBuf};
use txmesh_journal::{Journal, JournalDir, JournalResult, MemoryStore};

/// A journal file loaded into memory.
///
/// Opening a journal cuts off a torn trailing frame; working on a copy
/// keeps the file itself untouched.
pub struct Snapshot {
    /// File stem, usually the resource manager id.
    pub name: String,
    /// Path of the journal file.
    pub path: PathBuf,
    /// Size of the file on disk.
    pub file_size: u64,
    /// The loaded journal.
    pub journal: JournalResult<Journal>,
}

/// Lists the journals under `path`, optionally only the one of `resource`.
pub fn select_journals(
    path: &Path,
    resource: Option<&str>,
) -> Result<Vec<(String, PathBuf)>, Box<dyn std::error::Error>> {
    let dir = JournalDir::open_read_only(path)?;
    match resource {
        Some(resource) => {
            let file = dir.journal_path(resource);
            if !file.exists() {
                return Err(format!("No journal for {resource} in {:?}", path).into());
            }
            Ok(vec![(resource.to_string(), file)])
        }
        None => Ok(dir.journals()?),
    }
}

/// Reads one journal file into memory.
pub fn load(name: String, path: PathBuf) -> Result<Snapshot, Box<dyn std::error::Error>> {
    let data = fs::read(&path)?;
    let file_size = data.len() as u64;
    let journal = Journal::open(
        Box::new(MemoryStore::from_bytes(data)),
        Some(path.clone()),
    );
    Ok(Snapshot {
        name,
        path,
        file_size,
        journal,
    })
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
