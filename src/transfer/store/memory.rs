//! In-memory transfer store for tests and local runs

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{TransferStore, find_claim_conflict};
use crate::transfer::error::TransferError;
use crate::transfer::state::DocumentState;
use crate::transfer::types::{
    DocumentId, LineId, TransferDocument, TransferLine, TransferUnit, UnitId,
};
use crate::validation::batch::{CheckpointEntry, CheckpointKey};

/// Each document lives in one DashMap entry; holding the entry guard makes
/// every write to that document atomic.
#[derive(Default)]
pub struct MemoryTransferStore {
    documents: DashMap<DocumentId, TransferDocument>,
    transfer_numbers: DashMap<String, DocumentId>,
    lines: DashMap<LineId, DocumentId>,
    units: DashMap<UnitId, DocumentId>,
    checkpoints: DashMap<CheckpointKey, HashMap<String, CheckpointEntry>>,
}

impl MemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a document's `updated_at` into the past
    #[cfg(test)]
    pub fn age_document(&self, id: DocumentId, by: Duration) {
        if let Some(mut doc) = self.documents.get_mut(&id) {
            doc.updated_at -= TimeDelta::from_std(by).unwrap_or(TimeDelta::zero());
        }
    }
}

#[async_trait]
impl TransferStore for MemoryTransferStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert_document(&self, document: &TransferDocument) -> Result<(), TransferError> {
        match self.transfer_numbers.entry(document.transfer_number.clone()) {
            Entry::Occupied(_) => {
                return Err(TransferError::DuplicateTransferNumber(
                    document.transfer_number.clone(),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(document.id);
            }
        }
        for line in &document.lines {
            self.lines.insert(line.id, document.id);
            for unit in &line.units {
                self.units.insert(unit.id, document.id);
            }
        }
        self.documents.insert(document.id, document.clone());
        Ok(())
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<TransferDocument>, TransferError> {
        Ok(self.documents.get(&id).map(|d| d.clone()))
    }

    async fn locate_line(&self, line_id: LineId) -> Result<Option<DocumentId>, TransferError> {
        Ok(self.lines.get(&line_id).map(|d| *d))
    }

    async fn locate_unit(&self, unit_id: UnitId) -> Result<Option<DocumentId>, TransferError> {
        Ok(self.units.get(&unit_id).map(|d| *d))
    }

    async fn save_line_units(
        &self,
        line: &TransferLine,
        units: &[TransferUnit],
    ) -> Result<bool, TransferError> {
        let mut doc = self
            .documents
            .get_mut(&line.document_id)
            .ok_or_else(|| TransferError::DocumentNotFound(line.document_id.to_string()))?;
        if !doc.state.is_editable() {
            return Ok(false);
        }

        let now = Utc::now();
        let mut updated = match doc.lines.iter().find(|l| l.id == line.id) {
            Some(existing) => existing.clone(),
            None => {
                if doc.lines.iter().any(|l| l.item_code == line.item_code) {
                    return Err(TransferError::DuplicateLine(line.item_code.clone()));
                }
                let mut fresh = line.clone();
                fresh.units.clear();
                fresh
            }
        };
        updated.item_description = line.item_description.clone();
        updated.updated_at = now;

        for unit in units {
            match updated.units.iter_mut().find(|u| u.id == unit.id) {
                Some(stored) => *stored = unit.clone(),
                None => updated.units.push(unit.clone()),
            }
        }
        if let Some(identifier) = find_claim_conflict(&updated.units) {
            return Err(TransferError::DuplicateUnit(identifier));
        }

        for unit in units {
            self.units.insert(unit.id, doc.id);
        }
        self.lines.insert(updated.id, doc.id);
        match doc.lines.iter_mut().find(|l| l.id == updated.id) {
            Some(slot) => *slot = updated,
            None => doc.lines.push(updated),
        }
        doc.updated_at = now;
        Ok(true)
    }

    async fn delete_unit(
        &self,
        document_id: DocumentId,
        unit_id: UnitId,
    ) -> Result<bool, TransferError> {
        let mut doc = self
            .documents
            .get_mut(&document_id)
            .ok_or_else(|| TransferError::DocumentNotFound(document_id.to_string()))?;
        if !doc.state.is_editable() {
            return Ok(false);
        }

        let line = doc
            .lines
            .iter_mut()
            .find(|l| l.units.iter().any(|u| u.id == unit_id))
            .ok_or_else(|| TransferError::UnitNotFound(unit_id.to_string()))?;
        line.units.retain(|u| u.id != unit_id);
        line.updated_at = Utc::now();
        doc.updated_at = Utc::now();
        self.units.remove(&unit_id);
        Ok(true)
    }

    async fn update_status_if(
        &self,
        document: &TransferDocument,
        expected: DocumentState,
    ) -> Result<bool, TransferError> {
        let Some(mut stored) = self.documents.get_mut(&document.id) else {
            return Err(TransferError::DocumentNotFound(document.id.to_string()));
        };
        if stored.state != expected {
            return Ok(false);
        }

        let now = Utc::now();
        stored.state = document.state;
        stored.external_reference = document.external_reference.clone();
        stored.qc_approver = document.qc_approver;
        stored.qc_at = document.qc_at;
        stored.qc_notes = document.qc_notes.clone();
        stored.posting_attempts = document.posting_attempts;
        stored.updated_at = now;

        for line in stored.lines.iter_mut() {
            let Some(source) = document.line(line.id) else {
                continue;
            };
            line.qc_status = source.qc_status;
            for unit in line.units.iter_mut() {
                if let Some(src) = source.units.iter().find(|u| u.id == unit.id) {
                    unit.qc_status = src.qc_status;
                }
            }
        }
        Ok(true)
    }

    async fn find_stale_approved(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<TransferDocument>, TransferError> {
        let cutoff = Utc::now() - TimeDelta::from_std(threshold).unwrap_or(TimeDelta::zero());
        let mut stale: Vec<TransferDocument> = self
            .documents
            .iter()
            .filter(|d| d.state == DocumentState::QcApproved && d.updated_at < cutoff)
            .map(|d| d.clone())
            .collect();
        stale.sort_by_key(|d| d.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn save_checkpoint(
        &self,
        key: &CheckpointKey,
        entries: &[CheckpointEntry],
    ) -> Result<(), TransferError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut journal = self.checkpoints.entry(key.clone()).or_default();
        for entry in entries {
            journal.insert(entry.identifier.clone(), entry.clone());
        }
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        key: &CheckpointKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<CheckpointEntry>, TransferError> {
        Ok(self
            .checkpoints
            .get(key)
            .map(|journal| {
                let mut entries: Vec<CheckpointEntry> = journal
                    .values()
                    .filter(|e| e.recorded_at >= since)
                    .cloned()
                    .collect();
                entries.sort_by_key(|e| e.recorded_at);
                entries
            })
            .unwrap_or_default())
    }

    async fn purge_checkpoints(&self, before: DateTime<Utc>) -> Result<u64, TransferError> {
        let mut purged = 0u64;
        for mut journal in self.checkpoints.iter_mut() {
            let len = journal.len();
            journal.retain(|_, e| e.recorded_at >= before);
            purged += (len - journal.len()) as u64;
        }
        self.checkpoints.retain(|_, journal| !journal.is_empty());
        Ok(purged)
    }
}
