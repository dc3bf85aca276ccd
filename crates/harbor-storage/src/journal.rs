//! Per-transaction commit journal.
//!
//! The journal is written into the transaction's staging directory and
//! fsynced before any destination is touched; once it is durable, the commit
//! must complete (at apply time or by replay at the next startup).

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

/// File name of the journal inside a `.transaction_<gen>` directory.
pub const JOURNAL_FILE: &str = ".journal";

/// One pending destination mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JournalAction {
    /// Rename the staged file into place at `dest`.
    Rename { staged: String, dest: String },
    /// Remove `dest` from the store.
    Remove { dest: String },
}

/// The full journal of one committing transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Journal {
    /// Write generation of the owning transaction; the commit becomes
    /// visible as `generation + 1`.
    pub generation: u64,
    pub actions: Vec<JournalAction>,
}

fn decode_error(err: bincode::Error) -> io::Error {
    match *err {
        bincode::ErrorKind::Io(inner) => inner,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Writes and fsyncs the journal. Returns only after the bytes are durable.
pub fn write_journal(path: &Path, journal: &Journal) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, journal).map_err(decode_error)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Reads a journal back. A torn or corrupt journal surfaces as
/// `InvalidData`, which recovery treats as "commit never started applying".
pub fn read_journal(path: &Path) -> io::Result<Journal> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    bincode::deserialize_from(&mut reader).map_err(decode_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn journal_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE);
        let journal = Journal {
            generation: 12,
            actions: vec![
                JournalAction::Rename {
                    staged: "stage_0".into(),
                    dest: "mooring/ctd-7/2024.dat".into(),
                },
                JournalAction::Remove {
                    dest: "mooring/ctd-7/2023.dat".into(),
                },
            ],
        };
        write_journal(&path, &journal).unwrap();
        assert_eq!(read_journal(&path).unwrap(), journal);
    }

    #[test]
    fn torn_journal_is_invalid_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE);
        let journal = Journal {
            generation: 3,
            actions: vec![JournalAction::Remove {
                dest: "a/b".into(),
            }],
        };
        write_journal(&path, &journal).unwrap();

        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 1]).unwrap();
        let err = read_journal(&path).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
        ));
    }
}
