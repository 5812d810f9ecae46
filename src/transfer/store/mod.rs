//! Transfer persistence
//!
//! The store is the storage boundary where document invariants are enforced:
//! unique transfer numbers, one line per item, unique claimed identifiers per
//! line, edits only while `draft`, and compare-and-set status transitions.

pub mod memory;
pub mod postgres;

pub use memory::MemoryTransferStore;
pub use postgres::PgTransferStore;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::TransferError;
use super::state::DocumentState;
use super::types::{DocumentId, LineId, TransferDocument, TransferLine, TransferUnit, UnitId, UnitOutcome};
use crate::validation::batch::{CheckpointEntry, CheckpointKey};

#[async_trait]
pub trait TransferStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Insert a new document; `DuplicateTransferNumber` on collision
    async fn insert_document(&self, document: &TransferDocument) -> Result<(), TransferError>;

    /// Load a document with its lines and units
    async fn get_document(&self, id: DocumentId) -> Result<Option<TransferDocument>, TransferError>;

    async fn locate_line(&self, line_id: LineId) -> Result<Option<DocumentId>, TransferError>;

    async fn locate_unit(&self, unit_id: UnitId) -> Result<Option<DocumentId>, TransferError>;

    /// Insert or update `line` and upsert `units` (matched by id) in one step
    ///
    /// Only applied while the document is `draft`; returns false otherwise.
    async fn save_line_units(
        &self,
        line: &TransferLine,
        units: &[TransferUnit],
    ) -> Result<bool, TransferError>;

    /// Delete one unit while the document is `draft`; returns false otherwise
    async fn delete_unit(
        &self,
        document_id: DocumentId,
        unit_id: UnitId,
    ) -> Result<bool, TransferError>;

    /// Atomic CAS: persist the status fields of `document` and the QC status of
    /// every line and unit, only if the stored state equals `expected`
    ///
    /// Returns true if the update succeeded.
    async fn update_status_if(
        &self,
        document: &TransferDocument,
        expected: DocumentState,
    ) -> Result<bool, TransferError>;

    /// Documents in `qc_approved` not updated for longer than `threshold`
    async fn find_stale_approved(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<TransferDocument>, TransferError>;

    /// Upsert checkpoint entries (latest result per identifier wins)
    async fn save_checkpoint(
        &self,
        key: &CheckpointKey,
        entries: &[CheckpointEntry],
    ) -> Result<(), TransferError>;

    /// Checkpoint entries recorded at or after `since`
    async fn load_checkpoint(
        &self,
        key: &CheckpointKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<CheckpointEntry>, TransferError>;

    /// Drop checkpoint entries recorded before `before`
    async fn purge_checkpoints(&self, before: DateTime<Utc>) -> Result<u64, TransferError>;
}

/// First identifier claimed twice by non-duplicate units
pub(crate) fn find_claim_conflict<'a>(
    units: impl IntoIterator<Item = &'a TransferUnit>,
) -> Option<String> {
    let mut claimed: HashSet<&str> = HashSet::new();
    for unit in units {
        if unit.outcome == UnitOutcome::Duplicate {
            continue;
        }
        let mut keys = vec![unit.identifier.as_str()];
        if let Some(canonical) = unit.canonical_identifier.as_deref()
            && canonical != unit.identifier
        {
            keys.push(canonical);
        }
        for key in keys {
            if !claimed.insert(key) {
                return Some(key.to_string());
            }
        }
    }
    None
}
