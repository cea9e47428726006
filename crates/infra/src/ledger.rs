//! Sync ledger: the append-only audit trail of processed actions and external
//! requests, and the idempotence check in front of every commit.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info};

use seatflow_allocation::{Action, CommitError, SyncOutcome, SyncRecord, apply};
use seatflow_core::{ActionId, ProductId, UserId};
use seatflow_inventory::{InventoryModel, SeatReservation};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt ledger {path} at line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Commit(#[from] CommitError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied(SyncRecord),
    /// The action was committed before; nothing changed.
    AlreadyApplied,
}

#[derive(Debug, Default)]
struct LedgerState {
    records: Vec<SyncRecord>,
    committed: HashSet<ActionId>,
    requests: HashSet<String>,
    file: Option<File>,
}

impl LedgerState {
    fn index(&mut self, record: &SyncRecord) {
        if record.is_committed() {
            self.committed.insert(record.action_id);
        }
        if let Some(number) = &record.request_number {
            // A provision commit or abandonment does not re-open its request.
            self.requests.insert(number.clone());
        }
    }
}

#[derive(Debug)]
pub struct SyncLedger {
    path: Option<PathBuf>,
    state: Mutex<LedgerState>,
}

impl SyncLedger {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Open (or create) a JSON-lines ledger, replaying existing rows.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| LedgerError::Io {
            path: path.clone(),
            source,
        };

        let mut state = LedgerState::default();
        match File::open(&path) {
            Ok(file) => {
                for (n, line) in BufReader::new(file).lines().enumerate() {
                    let line = line.map_err(io_err)?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let record: SyncRecord =
                        serde_json::from_str(&line).map_err(|source| LedgerError::Corrupt {
                            path: path.clone(),
                            line: n + 1,
                            source,
                        })?;
                    state.index(&record);
                    state.records.push(record);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        state.file = Some(file);
        info!(path = %path.display(), records = state.records.len(), "sync ledger opened");

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Apply `action` to the inventory exactly once.
    ///
    /// A second commit of the same action id releases `reservation` and
    /// returns `AlreadyApplied` without touching the inventory.
    pub fn commit(
        &self,
        inventory: &InventoryModel,
        action: &Action,
        reservation: SeatReservation,
    ) -> Result<CommitOutcome, LedgerError> {
        let mut state = self.lock();
        if state.committed.contains(&action.id) {
            inventory.release(reservation);
            debug!(action_id = %action.id, "action already committed");
            return Ok(CommitOutcome::AlreadyApplied);
        }
        let change = apply(inventory, action, reservation)?;
        let record = SyncRecord::committed(action, &change, Utc::now());
        self.append(&mut state, record.clone());
        Ok(CommitOutcome::Applied(record))
    }

    pub fn record_abandoned(&self, action: &Action, reason: impl Into<String>) -> SyncRecord {
        let record = SyncRecord::abandoned(action, reason, Utc::now());
        self.append(&mut self.lock(), record.clone());
        record
    }

    pub fn record_enqueued(&self, action: &Action) -> SyncRecord {
        let record = SyncRecord::enqueued(action, Utc::now());
        self.append(&mut self.lock(), record.clone());
        record
    }

    pub fn record_rejected(
        &self,
        request_number: &str,
        user_id: UserId,
        products: Vec<ProductId>,
        reason: impl Into<String>,
    ) -> SyncRecord {
        let record = SyncRecord::rejected(request_number, user_id, products, reason, Utc::now());
        self.append(&mut self.lock(), record.clone());
        record
    }

    pub fn is_committed(&self, action_id: ActionId) -> bool {
        self.lock().committed.contains(&action_id)
    }

    /// Whether an external request number was already processed.
    pub fn has_request(&self, number: &str) -> bool {
        self.lock().requests.contains(number)
    }

    pub fn records(&self) -> Vec<SyncRecord> {
        self.lock().records.clone()
    }

    pub fn abandoned(&self) -> Vec<SyncRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| matches!(r.outcome, SyncOutcome::Abandoned { .. }))
            .cloned()
            .collect()
    }

    /// Re-apply every committed row to `inventory`, typically a model freshly
    /// loaded from its snapshot. Rows already reflected change nothing.
    /// Returns the number of rows that changed a user.
    pub fn replay_into(&self, inventory: &InventoryModel) -> usize {
        let state = self.lock();
        let restored = state
            .records
            .iter()
            .filter(|r| r.is_committed())
            .filter_map(|r| r.after_state.as_ref().map(|after| (r, after)))
            .filter(|(r, after)| inventory.restore_user(&r.user_id, after, r.committed_at))
            .count();
        if restored > 0 {
            info!(restored, "committed actions replayed into inventory");
        }
        restored
    }

    /// Highest action sequence number on record (0 when empty).
    pub fn max_sequence(&self) -> u64 {
        self.lock().records.iter().map(|r| r.sequence).max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, state: &mut LedgerState, record: SyncRecord) {
        if let Some(file) = state.file.as_mut() {
            if let Err(err) = write_line(file, &record) {
                error!(
                    path = ?self.path,
                    action_id = %record.action_id,
                    error = %err,
                    "failed to append sync record"
                );
            }
        }
        state.index(&record);
        state.records.push(record);
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn write_line(file: &mut File, record: &SyncRecord) -> std::io::Result<()> {
    let line = serde_json::to_string(record)?;
    writeln!(file, "{line}")?;
    file.flush()
}
