// =============================================================================
// Mapping Store — durable source→destination position link
// =============================================================================
//
// The only cross-component mutable shared state in the engine. Durability is
// an append-only newline-delimited JSON log; the in-memory two-way index is
// rebuilt by replaying the log on boot. `put` enforces uniqueness at write
// time: an active mapping already present for the source key makes the write
// a `duplicate` no-op rather than a silent overwrite.
// =============================================================================

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{MappingStatus, PositionMapping};
use crate::types::AccountRef;

type SourceKey = (AccountRef, String);
type DestKey = (AccountRef, String);

/// One line of the append-only mapping log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    ts: DateTime<Utc>,
    op: LogOp,
    mapping: PositionMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogOp {
    Put,
    Close,
    Orphan,
    Delete,
}

/// Outcome of a `put` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// An active mapping already exists for this source key.
    Duplicate,
}

struct Index {
    by_source: HashMap<SourceKey, PositionMapping>,
    by_dest: HashMap<DestKey, PositionMapping>,
}

impl Index {
    fn new() -> Self {
        Self {
            by_source: HashMap::new(),
            by_dest: HashMap::new(),
        }
    }

    fn apply(&mut self, record: &LogRecord) {
        let mapping = record.mapping.clone();
        match record.op {
            LogOp::Put => {
                self.by_source.insert(mapping.source_key(), mapping.clone());
                self.by_dest.insert(mapping.dest_key(), mapping);
            }
            LogOp::Close | LogOp::Orphan => {
                if let Some(existing) = self.by_source.get_mut(&mapping.source_key()) {
                    existing.status = mapping.status;
                    existing.last_seen = mapping.last_seen;
                }
                if let Some(existing) = self.by_dest.get_mut(&mapping.dest_key()) {
                    existing.status = mapping.status;
                    existing.last_seen = mapping.last_seen;
                }
            }
            LogOp::Delete => {
                self.by_source.remove(&mapping.source_key());
                self.by_dest.remove(&mapping.dest_key());
            }
        }
    }
}

/// Durable, two-way-indexed store of position mappings.
pub struct MappingStore {
    index: RwLock<Index>,
    log_path: PathBuf,
    log_file: RwLock<File>,
}

impl MappingStore {
    /// Open a mapping store backed by a fresh temp-file log. Used by tests
    /// and by any caller that doesn't need the log to outlive the process.
    pub fn open_in_memory() -> Self {
        let path = std::env::temp_dir().join(format!(
            "copytrade-mapping-{}-{}.ndjson",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        Self::open(&path).expect("failed to open in-memory mapping store")
    }

    /// Open (or create) the mapping log at `path` and rebuild the in-memory
    /// index by replaying it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let log_path = path.as_ref().to_path_buf();

        let mut index = Index::new();
        let mut replayed = 0usize;

        if log_path.exists() {
            let file = File::open(&log_path)
                .with_context(|| format!("failed to open mapping log {}", log_path.display()))?;
            for line in BufReader::new(file).lines() {
                let line = line.context("failed to read mapping log line")?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogRecord>(&line) {
                    Ok(record) => {
                        index.apply(&record);
                        replayed += 1;
                    }
                    Err(e) => {
                        warn!(error = %e, "skipping corrupt mapping log line");
                    }
                }
            }
        }

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open mapping log {} for append", log_path.display()))?;

        info!(
            path = %log_path.display(),
            records_replayed = replayed,
            active_mappings = index.by_source.values().filter(|m| m.status == MappingStatus::Active).count(),
            "mapping store opened"
        );

        Ok(Self {
            index: RwLock::new(index),
            log_path,
            log_file: RwLock::new(log_file),
        })
    }

    fn append(&self, op: LogOp, mapping: &PositionMapping) -> Result<()> {
        let record = LogRecord {
            ts: Utc::now(),
            op,
            mapping: mapping.clone(),
        };
        let line = serde_json::to_string(&record).context("failed to serialise mapping log record")?;
        let mut file = self.log_file.write();
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to mapping log {}", self.log_path.display()))?;
        file.flush().context("failed to flush mapping log")?;
        Ok(())
    }

    /// Write a new active mapping. Fails with `Duplicate` if an active
    /// mapping already exists for `mapping`'s source key.
    pub fn put(&self, mapping: PositionMapping) -> Result<PutOutcome> {
        {
            let index = self.index.read();
            if let Some(existing) = index.by_source.get(&mapping.source_key()) {
                if existing.status == MappingStatus::Active {
                    return Ok(PutOutcome::Duplicate);
                }
            }
        }

        self.append(LogOp::Put, &mapping)?;
        let mut index = self.index.write();
        // Re-check under the write lock in case of a race between the read
        // check above and this insert.
        if let Some(existing) = index.by_source.get(&mapping.source_key()) {
            if existing.status == MappingStatus::Active {
                return Ok(PutOutcome::Duplicate);
            }
        }
        index.by_source.insert(mapping.source_key(), mapping.clone());
        index.by_dest.insert(mapping.dest_key(), mapping);
        Ok(PutOutcome::Written)
    }

    pub fn get_by_source(&self, src_acct: &AccountRef, src_pos: &str) -> Option<PositionMapping> {
        let key = (src_acct.clone(), src_pos.to_string());
        self.index.read().by_source.get(&key).cloned()
    }

    /// Look up a mapping by destination key. `hint_source_accounts`, if
    /// non-empty, bounds the scan to mappings whose source account is among
    /// the hints — with no hints this is a full scan of the dest index,
    /// acceptable because operator commands are rare.
    pub fn get_by_dest(
        &self,
        dst_acct: &AccountRef,
        dst_pos: &str,
        hint_source_accounts: &[AccountRef],
    ) -> Option<PositionMapping> {
        let key = (dst_acct.clone(), dst_pos.to_string());
        let index = self.index.read();
        let mapping = index.by_dest.get(&key)?;
        if hint_source_accounts.is_empty() || hint_source_accounts.contains(&mapping.source_account) {
            Some(mapping.clone())
        } else {
            None
        }
    }

    pub fn list_active_for_route(&self, route_id: &str) -> Vec<PositionMapping> {
        self.index
            .read()
            .by_source
            .values()
            .filter(|m| m.route_id == route_id && m.status == MappingStatus::Active)
            .cloned()
            .collect()
    }

    pub fn count_active_for_route(&self, route_id: &str) -> usize {
        self.index
            .read()
            .by_source
            .values()
            .filter(|m| m.route_id == route_id && m.status == MappingStatus::Active)
            .count()
    }

    /// Mark a mapping closed (Copy Pipeline, on confirmed destination close).
    pub fn mark_closed(&self, src_acct: &AccountRef, src_pos: &str) -> Result<bool> {
        self.transition(src_acct, src_pos, MappingStatus::Closed, LogOp::Close)
    }

    /// Mark a mapping orphaned (Orphan Reconciler, source side vanished).
    pub fn mark_orphaned(&self, src_acct: &AccountRef, src_pos: &str) -> Result<bool> {
        self.transition(src_acct, src_pos, MappingStatus::Orphaned, LogOp::Orphan)
    }

    fn transition(
        &self,
        src_acct: &AccountRef,
        src_pos: &str,
        status: MappingStatus,
        op: LogOp,
    ) -> Result<bool> {
        let key = (src_acct.clone(), src_pos.to_string());
        let updated = {
            let mut index = self.index.write();
            match index.by_source.get_mut(&key) {
                Some(mapping) => {
                    mapping.status = status;
                    mapping.last_seen = Utc::now();
                    let snapshot = mapping.clone();
                    if let Some(dest) = index.by_dest.get_mut(&snapshot.dest_key()) {
                        dest.status = status;
                        dest.last_seen = snapshot.last_seen;
                    }
                    Some(snapshot)
                }
                None => None,
            }
        };

        match updated {
            Some(mapping) => {
                self.append(op, &mapping)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete a mapping outright (operator `close-orphan` command removing a
    /// residual mapping).
    pub fn delete(&self, src_acct: &AccountRef, src_pos: &str) -> Result<bool> {
        let key = (src_acct.clone(), src_pos.to_string());
        let removed = {
            let mut index = self.index.write();
            match index.by_source.remove(&key) {
                Some(mapping) => {
                    index.by_dest.remove(&mapping.dest_key());
                    Some(mapping)
                }
                None => None,
            }
        };

        match removed {
            Some(mapping) => {
                self.append(LogOp::Delete, &mapping)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
