//! Durable journal of engine mutations.
//!
//! Every entry is written before the in-memory state changes. A journal file
//! is one JSON object per line; [`JsonlJournal::load`] reads it back in order
//! so [`crate::Engine::restore`] can rebuild delta logs and version chains.
//!
//! An entry counts only once its newline is on disk. A final line without one
//! was cut off mid-write and its mutation never happened, so readers drop it.
//! Any other unreadable line is corruption and fails the load.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::delta::{DeltaRecord, StreamOutcome};
use crate::errors::EngineError;
use crate::ids::{ArtifactId, ConversationId, StreamId};
use crate::version::{ArtifactVersion, VersionStamp};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum JournalEntry {
    StreamOpened {
        stream_id: StreamId,
        conversation_id: ConversationId,
        at: DateTime<Utc>,
    },
    DeltaAppended {
        record: DeltaRecord,
    },
    StreamClosed {
        stream_id: StreamId,
        outcome: StreamOutcome,
        at: DateTime<Utc>,
    },
    StreamPurged {
        stream_id: StreamId,
    },
    VersionCommitted {
        version: ArtifactVersion,
    },
    VersionsRolledBack {
        artifact_id: ArtifactId,
        to: VersionStamp,
    },
    /// Stamp allocator state of a chain. Written by compaction so stamps of
    /// rolled-back versions stay retired.
    ChainWatermark {
        artifact_id: ArtifactId,
        next_seq: u64,
        last_at: Option<DateTime<Utc>>,
    },
}

/// Sink for durable entries. Implementations must persist before returning.
pub trait Journal: Send + Sync {
    fn record(&self, entry: &JournalEntry) -> Result<(), EngineError>;
}

/// Append-only JSONL journal file.
pub struct JsonlJournal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlJournal {
    /// Opens (or creates) the journal for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        create_parent(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(EngineError::journal)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every entry in write order. A missing file yields no entries and
    /// a torn final line is skipped.
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<JournalEntry>, EngineError> {
        Ok(scan(path.as_ref())?.entries)
    }

    /// Like [`JsonlJournal::load`], but also truncates a torn final line so the
    /// next append starts on a clean line.
    pub fn recover(path: impl AsRef<Path>) -> Result<Vec<JournalEntry>, EngineError> {
        let path = path.as_ref();
        let scanned = scan(path)?;
        if scanned.torn {
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(EngineError::journal)?;
            file.set_len(scanned.valid_len).map_err(EngineError::journal)?;
            file.sync_all().map_err(EngineError::journal)?;
            warn!(
                event = "journal.torn_tail_truncated",
                domain = "journal",
                path = %path.display(),
                valid_len = scanned.valid_len
            );
        }
        Ok(scanned.entries)
    }

    /// Replaces the file with `entries`. Writes a sibling file first and
    /// renames it over the journal, so a crash leaves either the old or the
    /// new contents.
    pub fn rewrite(path: impl AsRef<Path>, entries: &[JournalEntry]) -> Result<(), EngineError> {
        let path = path.as_ref();
        create_parent(path)?;
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".compact");
        let tmp = path.with_file_name(tmp_name);

        let file = File::create(&tmp).map_err(EngineError::journal)?;
        let mut writer = BufWriter::new(file);
        for entry in entries {
            let line = serde_json::to_string(entry).map_err(EngineError::codec)?;
            writer.write_all(line.as_bytes()).map_err(EngineError::journal)?;
            writer.write_all(b"\n").map_err(EngineError::journal)?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| EngineError::journal(e.into_error()))?;
        file.sync_all().map_err(EngineError::journal)?;
        std::fs::rename(&tmp, path).map_err(EngineError::journal)?;
        info!(
            event = "journal.rewritten",
            domain = "journal",
            path = %path.display(),
            entries = entries.len() as u64
        );
        Ok(())
    }
}

fn create_parent(path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(EngineError::journal)?;
    }
    Ok(())
}

struct Scan {
    entries: Vec<JournalEntry>,
    // Byte length of the complete, newline-terminated prefix.
    valid_len: u64,
    torn: bool,
}

fn scan(path: &Path) -> Result<Scan, EngineError> {
    let mut bytes = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut bytes).map_err(EngineError::journal)?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(EngineError::journal(err)),
    }

    let mut entries = Vec::new();
    let mut offset = 0usize;
    let mut line_no = 0usize;
    while let Some(end) = bytes[offset..].iter().position(|b| *b == b'\n') {
        line_no += 1;
        let line = &bytes[offset..offset + end];
        offset += end + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let entry = serde_json::from_slice(line).map_err(|e| {
            EngineError::Journal(format!("{}:{}: {e}", path.display(), line_no))
        })?;
        entries.push(entry);
    }

    let torn = offset < bytes.len();
    if torn {
        warn!(
            event = "journal.torn_tail",
            domain = "journal",
            path = %path.display(),
            line = (line_no + 1) as u64,
            dropped_bytes = (bytes.len() - offset) as u64
        );
    }
    Ok(Scan {
        entries,
        valid_len: offset as u64,
        torn,
    })
}

impl Journal for JsonlJournal {
    fn record(&self, entry: &JournalEntry) -> Result<(), EngineError> {
        let line = serde_json::to_string(entry).map_err(EngineError::codec)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| EngineError::Journal("journal writer poisoned".into()))?;
        write_line(&mut writer, &line).map_err(EngineError::journal)
    }
}

fn write_line(writer: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}
