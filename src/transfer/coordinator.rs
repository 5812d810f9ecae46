//! Transfer Coordinator
//!
//! Drives every document operation: input checks, authorization against the
//! transition table, batch validation, reconciliation and posting.
//!
//! Two locks, never nested the other way round:
//! - a validation guard per `(document, item)`; a second validation of the
//!   same line fails fast with `ValidationInProgress`
//! - a mutex per document, held only for the commit phase of an edit and for
//!   whole status transitions
//!
//! The store's compare-and-set is the final arbiter; losing it surfaces as
//! `StateConflict` with the state actually found.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{LineBlocker, TransferError};
use super::state::{DocumentAction, DocumentState, QcStatus, TransitionDenied, next_state, roles_for};
use super::store::TransferStore;
use super::types::{
    AddLineUnits, AddUnitsReport, ApprovalOutcome, DocumentId, LineId, NewDocument,
    TransferDocument, TransferLine, TransferUnit, UnitEntry, UnitId, UnitOutcome,
    generate_transfer_number,
};
use crate::core_types::{Actor, Role};
use crate::posting::{PostingAdapter, PostingOutcome};
use crate::validation::batch::{
    BatchValidator, CheckpointEntry, CheckpointKey, Resolution, ValidationRequest, ValidationRun,
};
use crate::validation::reconcile::Reconciliation;

const MAX_WAREHOUSE_LEN: usize = 10;
const MAX_ITEM_CODE_LEN: usize = 50;
const TRANSFER_NUMBER_ATTEMPTS: usize = 3;

/// Releases the per-line validation slot on drop, including when the
/// validating future is cancelled.
struct ValidationGuard {
    active: Arc<DashMap<CheckpointKey, ()>>,
    key: CheckpointKey,
}

impl Drop for ValidationGuard {
    fn drop(&mut self) {
        self.active.remove(&self.key);
    }
}

fn apply_resolution(unit: &mut TransferUnit, resolution: &Resolution) {
    let now = Utc::now();
    match resolution {
        Resolution::Valid(confirmed) => {
            unit.outcome = UnitOutcome::Valid;
            unit.canonical_identifier = Some(confirmed.canonical_identifier.clone());
            unit.dates = confirmed.dates;
            unit.reason = None;
        }
        Resolution::Invalid { reason } => {
            unit.outcome = UnitOutcome::Invalid;
            unit.canonical_identifier = None;
            unit.reason = Some(reason.clone());
        }
        Resolution::Duplicate { reason } => {
            unit.outcome = UnitOutcome::Duplicate;
            unit.reason = Some(reason.clone());
        }
        Resolution::AlreadyValid(_) => return,
    }
    unit.validated_at = Some(now);
    unit.updated_at = now;
}

/// Upsert `changes` into `units` by id
fn merge_units(units: &mut Vec<TransferUnit>, changes: &[TransferUnit]) {
    for change in changes {
        match units.iter_mut().find(|u| u.id == change.id) {
            Some(stored) => *stored = change.clone(),
            None => units.push(change.clone()),
        }
    }
}

fn report_message(
    item_code: &str,
    reconciliation: Reconciliation,
    valid_quantity: u32,
    expected: u32,
    duplicates: &[String],
) -> String {
    let mut message = match reconciliation {
        Reconciliation::Complete => {
            format!("{}: {}/{} valid, line complete", item_code, valid_quantity, expected)
        }
        Reconciliation::Short { missing } => format!(
            "{}: {}/{} valid, needs {} more valid unit(s)",
            item_code, valid_quantity, expected, missing
        ),
        Reconciliation::Excess { remove } => format!(
            "{}: submission rejected, {} valid unit(s) exceed expected quantity {}; remove {} identifier(s) and resubmit",
            item_code, valid_quantity, expected, remove
        ),
    };
    if !duplicates.is_empty() {
        message.push_str(&format!("; duplicates: {}", duplicates.join(", ")));
    }
    message
}

fn check_warehouse(code: &str) -> Result<(), TransferError> {
    let code = code.trim();
    if code.is_empty() || code.chars().count() > MAX_WAREHOUSE_LEN {
        return Err(TransferError::InvalidWarehouse(code.to_string()));
    }
    Ok(())
}

/// Transfer Coordinator - orchestrates document processing
pub struct TransferCoordinator {
    store: Arc<dyn TransferStore>,
    validator: BatchValidator,
    posting: Arc<dyn PostingAdapter>,
    document_locks: DashMap<DocumentId, Arc<Mutex<()>>>,
    validations: Arc<DashMap<CheckpointKey, ()>>,
}

impl TransferCoordinator {
    pub fn new(
        store: Arc<dyn TransferStore>,
        validator: BatchValidator,
        posting: Arc<dyn PostingAdapter>,
    ) -> Self {
        Self {
            store,
            validator,
            posting,
            document_locks: DashMap::new(),
            validations: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TransferStore> {
        &self.store
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_document(&self, id: DocumentId) -> Result<TransferDocument, TransferError> {
        self.store
            .get_document(id)
            .await?
            .ok_or_else(|| TransferError::DocumentNotFound(id.to_string()))
    }

    /// Checkpointed validation outcomes of a line, oldest first
    pub async fn checkpoint(&self, line_id: LineId) -> Result<Vec<CheckpointEntry>, TransferError> {
        let document_id = self
            .store
            .locate_line(line_id)
            .await?
            .ok_or_else(|| TransferError::LineNotFound(line_id.to_string()))?;
        let document = self.get_document(document_id).await?;
        let line = document
            .line(line_id)
            .ok_or_else(|| TransferError::LineNotFound(line_id.to_string()))?;

        let key = CheckpointKey {
            document_id,
            item_code: line.item_code.clone(),
        };
        self.store
            .load_checkpoint(&key, chrono::DateTime::<Utc>::MIN_UTC)
            .await
    }

    // ========================================================================
    // Draft editing
    // ========================================================================

    pub async fn create_document(
        &self,
        actor: &Actor,
        request: NewDocument,
    ) -> Result<DocumentId, TransferError> {
        if !matches!(actor.role, Role::Submitter | Role::Admin) {
            return Err(TransferError::Forbidden {
                role: actor.role,
                action: "create".to_string(),
            });
        }
        check_warehouse(&request.source_warehouse)?;
        check_warehouse(&request.destination_warehouse)?;
        if request
            .source_warehouse
            .trim()
            .eq_ignore_ascii_case(request.destination_warehouse.trim())
        {
            return Err(TransferError::SameWarehouse);
        }

        let mut document = TransferDocument::new(actor.user_id, &request);
        for attempt in 1..=TRANSFER_NUMBER_ATTEMPTS {
            match self.store.insert_document(&document).await {
                Ok(()) => {
                    info!(
                        document_id = %document.id,
                        transfer_number = %document.transfer_number,
                        created_by = actor.user_id,
                        "Transfer document created: {} -> {}",
                        document.source_warehouse,
                        document.destination_warehouse
                    );
                    return Ok(document.id);
                }
                Err(TransferError::DuplicateTransferNumber(number))
                    if attempt < TRANSFER_NUMBER_ATTEMPTS =>
                {
                    debug!(transfer_number = %number, attempt, "Transfer number collision, regenerating");
                    document.transfer_number = generate_transfer_number(Utc::now());
                }
                Err(e) => return Err(e),
            }
        }
        Err(TransferError::DuplicateTransferNumber(document.transfer_number))
    }

    /// Validate identifiers for one item and commit the outcomes to its line
    ///
    /// The line is created on first use. Valid units of a call that would
    /// push the line over its expected quantity are not committed; the
    /// report carries `Reconciliation::Excess` with the count to remove.
    pub async fn add_line_units(
        &self,
        actor: &Actor,
        document_id: DocumentId,
        request: AddLineUnits,
        cancel: &CancellationToken,
    ) -> Result<AddUnitsReport, TransferError> {
        let item_code = request.item_code.trim().to_string();
        if item_code.is_empty() || item_code.chars().count() > MAX_ITEM_CODE_LEN {
            return Err(TransferError::InvalidItemCode(item_code));
        }
        if request.expected_quantity == 0 {
            return Err(TransferError::InvalidExpectedQuantity);
        }
        if request.entries.is_empty() {
            return Err(TransferError::EmptySubmission);
        }

        let document = self.get_document(document_id).await?;
        Self::authorize_edit(actor, &document)?;

        let key = CheckpointKey {
            document_id,
            item_code: item_code.clone(),
        };
        let _guard = self.begin_validation(&key)?;

        // Reload under the guard so the stored units include the last commit
        let document = self.get_document(document_id).await?;
        Self::authorize_edit(actor, &document)?;
        Self::check_existing_line(&document, &item_code, &request)?;

        let stored = document
            .line_for_item(&item_code)
            .map(|l| l.units.as_slice())
            .unwrap_or(&[]);
        let run = self
            .validator
            .validate(
                self.store.as_ref(),
                ValidationRequest {
                    key: &key,
                    source_warehouse: &document.source_warehouse,
                    tracking: request.tracking,
                    entries: &request.entries,
                    stored,
                    revalidate: request.revalidate,
                },
                cancel,
            )
            .await?;

        // Commit phase
        let lock = self.document_lock(document_id);
        let _lock = lock.lock().await;
        let document = self.get_document(document_id).await?;
        if !document.state.is_editable() {
            return Err(TransferError::NotEditable {
                actual: document.state,
            });
        }
        let mut line = match document.line_for_item(&item_code) {
            Some(line) => line.clone(),
            None => TransferLine::new(document_id, &request),
        };

        let mut changes: Vec<TransferUnit> = Vec::new();
        let mut duplicates: Vec<String> = Vec::new();
        for entry in &run.entries {
            match &entry.resolution {
                Resolution::AlreadyValid(_) => continue,
                Resolution::Duplicate { .. } => {
                    if !duplicates.contains(&entry.identifier) {
                        duplicates.push(entry.identifier.clone());
                    }
                }
                Resolution::Valid(confirmed) => {
                    if line.item_description.is_empty()
                        && let Some(description) = &confirmed.item_description
                    {
                        line.item_description = description.clone();
                    }
                }
                Resolution::Invalid { .. } => {}
            }

            let mut unit = match entry
                .target
                .and_then(|id| line.units.iter().find(|u| u.id == id))
            {
                Some(stored) => stored.clone(),
                None => TransferUnit::new(line.id, &entry.identifier, entry.quantity),
            };
            unit.quantity = entry.quantity;
            apply_resolution(&mut unit, &entry.resolution);
            changes.push(unit);
        }

        let mut projected = line.clone();
        merge_units(&mut projected.units, &changes);
        let reconciliation = projected.reconciliation();
        let projected_valid = projected.valid_quantity();

        if let Reconciliation::Excess { remove } = reconciliation {
            let withheld = changes
                .iter()
                .filter(|u| u.outcome == UnitOutcome::Valid)
                .count();
            warn!(
                document_id = %document_id,
                item_code = %item_code,
                valid = projected_valid,
                expected = line.expected_quantity,
                remove,
                withheld,
                "Excess submission, valid units not committed"
            );
            changes.retain(|u| u.outcome != UnitOutcome::Valid);
        }

        if !self.store.save_line_units(&line, &changes).await? {
            let actual = self.get_document(document_id).await?.state;
            return Err(TransferError::NotEditable { actual });
        }
        merge_units(&mut line.units, &changes);

        let message = report_message(
            &item_code,
            reconciliation,
            projected_valid,
            line.expected_quantity,
            &duplicates,
        );
        info!(
            document_id = %document_id,
            line_id = %line.id,
            valid = run.valid_count(),
            invalid = run.invalid_count(),
            duplicate = run.duplicate_count(),
            already_valid = run.already_valid(),
            line_valid = line.valid_quantity(),
            expected = line.expected_quantity,
            "Line units committed"
        );

        Ok(AddUnitsReport {
            document_id,
            line_id: line.id,
            valid_count: run.valid_count(),
            invalid_count: run.invalid_count(),
            duplicate_count: run.duplicate_count(),
            already_valid: run.already_valid(),
            skipped: run.skipped,
            line_valid_quantity: line.valid_quantity(),
            expected_quantity: line.expected_quantity,
            reconciliation,
            duplicates,
            message,
        })
    }

    /// Validate identifiers for a line without committing anything to it
    ///
    /// Outcomes still land in the checkpoint journal, so a following
    /// `add_line_units` with the same identifiers reuses them.
    pub async fn preview_units(
        &self,
        actor: &Actor,
        document_id: DocumentId,
        request: AddLineUnits,
        cancel: &CancellationToken,
    ) -> Result<ValidationRun, TransferError> {
        let item_code = request.item_code.trim().to_string();
        if item_code.is_empty() || item_code.chars().count() > MAX_ITEM_CODE_LEN {
            return Err(TransferError::InvalidItemCode(item_code));
        }
        if request.entries.is_empty() {
            return Err(TransferError::EmptySubmission);
        }

        let document = self.get_document(document_id).await?;
        Self::authorize_edit(actor, &document)?;

        let key = CheckpointKey {
            document_id,
            item_code: item_code.clone(),
        };
        let _guard = self.begin_validation(&key)?;

        let document = self.get_document(document_id).await?;
        if let Some(line) = document.line_for_item(&item_code)
            && line.tracking != request.tracking
        {
            return Err(TransferError::TrackingMismatch {
                item_code,
                expected: line.tracking,
            });
        }
        let stored = document
            .line_for_item(&item_code)
            .map(|l| l.units.as_slice())
            .unwrap_or(&[]);

        let run = self
            .validator
            .validate(
                self.store.as_ref(),
                ValidationRequest {
                    key: &key,
                    source_warehouse: &document.source_warehouse,
                    tracking: request.tracking,
                    entries: &request.entries,
                    stored,
                    revalidate: request.revalidate,
                },
                cancel,
            )
            .await?;

        debug!(
            document_id = %document_id,
            item_code = %item_code,
            valid = run.valid_count(),
            invalid = run.invalid_count(),
            duplicate = run.duplicate_count(),
            "Units previewed"
        );
        Ok(run)
    }

    /// Re-check one stored unit against the authority
    ///
    /// A confirmation that would push the line over its expected quantity
    /// is not applied; the unit is recorded invalid with the reason.
    pub async fn revalidate_unit(
        &self,
        actor: &Actor,
        unit_id: UnitId,
    ) -> Result<UnitOutcome, TransferError> {
        let document_id = self
            .store
            .locate_unit(unit_id)
            .await?
            .ok_or_else(|| TransferError::UnitNotFound(unit_id.to_string()))?;
        let document = self.get_document(document_id).await?;
        Self::authorize_edit(actor, &document)?;
        let (line, _) = document
            .unit(unit_id)
            .ok_or_else(|| TransferError::UnitNotFound(unit_id.to_string()))?;

        let key = CheckpointKey {
            document_id,
            item_code: line.item_code.clone(),
        };
        let _guard = self.begin_validation(&key)?;

        let document = self.get_document(document_id).await?;
        Self::authorize_edit(actor, &document)?;
        let (line, unit) = document
            .unit(unit_id)
            .ok_or_else(|| TransferError::UnitNotFound(unit_id.to_string()))?;

        let others: Vec<TransferUnit> = line
            .units
            .iter()
            .filter(|u| u.id != unit_id)
            .cloned()
            .collect();
        if unit.outcome == UnitOutcome::Duplicate
            && others.iter().any(|u| {
                u.outcome != UnitOutcome::Duplicate
                    && (u.identifier == unit.identifier
                        || u.canonical_identifier.as_deref() == Some(unit.identifier.as_str()))
            })
        {
            return Ok(UnitOutcome::Duplicate);
        }

        let entries = [UnitEntry::batch(&unit.identifier, unit.quantity)];
        let run = self
            .validator
            .validate(
                self.store.as_ref(),
                ValidationRequest {
                    key: &key,
                    source_warehouse: &document.source_warehouse,
                    tracking: line.tracking,
                    entries: &entries,
                    stored: &others,
                    revalidate: true,
                },
                &CancellationToken::new(),
            )
            .await?;
        let resolution = run
            .entries
            .into_iter()
            .next()
            .map(|e| e.resolution)
            .unwrap_or_else(|| Resolution::Invalid {
                reason: "validation error: not processed".to_string(),
            });

        let lock = self.document_lock(document_id);
        let _lock = lock.lock().await;
        let document = self.get_document(document_id).await?;
        if !document.state.is_editable() {
            return Err(TransferError::NotEditable {
                actual: document.state,
            });
        }
        let (line, unit) = document
            .unit(unit_id)
            .ok_or_else(|| TransferError::UnitNotFound(unit_id.to_string()))?;

        let others_valid: u32 = line
            .valid_units()
            .filter(|u| u.id != unit_id)
            .fold(0, |total, u| total.saturating_add(u.quantity));
        let mut updated = unit.clone();
        apply_resolution(&mut updated, &resolution);
        if updated.outcome == UnitOutcome::Valid
            && others_valid.saturating_add(updated.quantity) > line.expected_quantity
        {
            updated.outcome = UnitOutcome::Invalid;
            updated.reason = Some(format!(
                "confirmed, but line already has {}/{} valid unit(s); remove a unit first",
                others_valid, line.expected_quantity
            ));
        }

        if !self
            .store
            .save_line_units(line, std::slice::from_ref(&updated))
            .await?
        {
            let actual = self.get_document(document_id).await?.state;
            return Err(TransferError::NotEditable { actual });
        }

        info!(
            document_id = %document_id,
            unit_id = %unit_id,
            identifier = %updated.identifier,
            before = %unit.outcome,
            after = %updated.outcome,
            "Unit revalidated"
        );
        Ok(updated.outcome)
    }

    pub async fn remove_unit(&self, actor: &Actor, unit_id: UnitId) -> Result<(), TransferError> {
        let document_id = self
            .store
            .locate_unit(unit_id)
            .await?
            .ok_or_else(|| TransferError::UnitNotFound(unit_id.to_string()))?;
        let document = self.get_document(document_id).await?;
        Self::authorize_edit(actor, &document)?;
        let (line, unit) = document
            .unit(unit_id)
            .ok_or_else(|| TransferError::UnitNotFound(unit_id.to_string()))?;

        let key = CheckpointKey {
            document_id,
            item_code: line.item_code.clone(),
        };
        let _guard = self.begin_validation(&key)?;

        let lock = self.document_lock(document_id);
        let _lock = lock.lock().await;
        if !self.store.delete_unit(document_id, unit_id).await? {
            let actual = self.get_document(document_id).await?.state;
            return Err(TransferError::NotEditable { actual });
        }

        info!(
            document_id = %document_id,
            unit_id = %unit_id,
            identifier = %unit.identifier,
            outcome = %unit.outcome,
            removed_by = actor.user_id,
            "Unit removed"
        );
        Ok(())
    }

    // ========================================================================
    // Status transitions
    // ========================================================================

    pub async fn submit_document(&self, actor: &Actor, id: DocumentId) -> Result<(), TransferError> {
        let lock = self.document_lock(id);
        let _lock = lock.lock().await;
        let mut document = self.get_document(id).await?;
        let next = Self::authorize(actor, &document, DocumentAction::Submit)?;

        let blockers: Vec<LineBlocker> = document
            .lines
            .iter()
            .filter(|l| !l.is_ready())
            .map(|l| LineBlocker {
                item_code: l.item_code.clone(),
                valid_quantity: l.valid_quantity(),
                expected_quantity: l.expected_quantity,
                unvalidated: l.unvalidated_count(),
            })
            .collect();
        if document.lines.is_empty() || !blockers.is_empty() {
            return Err(TransferError::SubmissionBlocked(blockers));
        }

        document.state = next;
        self.commit(&document, DocumentState::Draft, DocumentAction::Submit)
            .await?;
        info!(document_id = %id, submitted_by = actor.user_id, "Document submitted");
        Ok(())
    }

    /// Approve and post to the ERP
    ///
    /// `PostingFailure` means the ERP refused the document and it is back in
    /// `rejected`. `PostingPending` means the outcome is unknown and the
    /// recovery worker owns the document from here.
    pub async fn approve_document(
        &self,
        actor: &Actor,
        id: DocumentId,
        notes: Option<&str>,
    ) -> Result<ApprovalOutcome, TransferError> {
        let lock = self.document_lock(id);
        let _lock = lock.lock().await;
        let mut document = self.get_document(id).await?;
        let next = Self::authorize(actor, &document, DocumentAction::Approve)?;

        document.state = next;
        document.qc_approver = Some(actor.user_id);
        document.qc_at = Some(Utc::now());
        document.qc_notes = notes
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        for line in document.lines.iter_mut() {
            line.qc_status = QcStatus::Approved;
            for unit in line.units.iter_mut() {
                if unit.outcome == UnitOutcome::Valid {
                    unit.qc_status = QcStatus::Approved;
                }
            }
        }
        self.commit(&document, DocumentState::Submitted, DocumentAction::Approve)
            .await?;
        info!(document_id = %id, approver = actor.user_id, posting = self.posting.name(), "Document approved, posting");

        let outcome = self.posting.post(&document).await;
        self.settle_posting(&mut document, &outcome, None).await?;

        match outcome {
            PostingOutcome::Posted { reference } => Ok(ApprovalOutcome::Posted { reference }),
            PostingOutcome::Rejected { error } => Err(TransferError::PostingFailure(error)),
            PostingOutcome::Unknown { error } => Ok(ApprovalOutcome::PostingPending { error }),
        }
    }

    pub async fn reject_document(
        &self,
        actor: &Actor,
        id: DocumentId,
        notes: &str,
    ) -> Result<(), TransferError> {
        let notes = notes.trim();
        let lock = self.document_lock(id);
        let _lock = lock.lock().await;
        let mut document = self.get_document(id).await?;
        let next = Self::authorize(actor, &document, DocumentAction::Reject)?;
        if notes.is_empty() {
            return Err(TransferError::NotesRequired);
        }

        document.state = next;
        document.qc_approver = Some(actor.user_id);
        document.qc_at = Some(Utc::now());
        document.qc_notes = Some(notes.to_string());
        for line in document.lines.iter_mut() {
            line.qc_status = QcStatus::Rejected;
        }
        self.commit(&document, DocumentState::Submitted, DocumentAction::Reject)
            .await?;
        info!(document_id = %id, rejected_by = actor.user_id, "Document rejected by QC");
        Ok(())
    }

    pub async fn reopen_document(&self, actor: &Actor, id: DocumentId) -> Result<(), TransferError> {
        let lock = self.document_lock(id);
        let _lock = lock.lock().await;
        let mut document = self.get_document(id).await?;
        let next = Self::authorize(actor, &document, DocumentAction::Reopen)?;

        document.state = next;
        document.qc_approver = None;
        document.qc_at = None;
        document.qc_notes = None;
        document.external_reference = None;
        document.posting_attempts = 0;
        Self::reset_qc(&mut document);
        self.commit(&document, DocumentState::Rejected, DocumentAction::Reopen)
            .await?;
        info!(document_id = %id, reopened_by = actor.user_id, "Document reopened");
        Ok(())
    }

    /// One recovery step for a document stuck in `qc_approved`
    ///
    /// Probes the ERP first so a post that landed earlier is never sent
    /// twice. Returns the resulting state, or `None` if the document had
    /// already left `qc_approved`.
    pub async fn recover_posting(
        &self,
        id: DocumentId,
        max_attempts: u32,
    ) -> Result<Option<DocumentState>, TransferError> {
        let lock = self.document_lock(id);
        let _lock = lock.lock().await;
        let mut document = self.get_document(id).await?;
        if document.state != DocumentState::QcApproved {
            return Ok(None);
        }

        let outcome = match self.posting.lookup(&document.transfer_number).await {
            Ok(Some(reference)) => {
                info!(
                    document_id = %id,
                    reference = %reference,
                    "Found earlier posting in ERP"
                );
                PostingOutcome::Posted { reference }
            }
            Ok(None) => {
                debug!(document_id = %id, attempts = document.posting_attempts, "Re-posting document");
                self.posting.post(&document).await
            }
            Err(e) => PostingOutcome::Unknown {
                error: e.to_string(),
            },
        };

        self.settle_posting(&mut document, &outcome, Some(max_attempts))
            .await?;
        Ok(Some(document.state))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn document_lock(&self, id: DocumentId) -> Arc<Mutex<()>> {
        self.document_locks.entry(id).or_default().clone()
    }

    fn begin_validation(&self, key: &CheckpointKey) -> Result<ValidationGuard, TransferError> {
        match self.validations.entry(key.clone()) {
            Entry::Occupied(_) => Err(TransferError::ValidationInProgress(key.item_code.clone())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(ValidationGuard {
                    active: self.validations.clone(),
                    key: key.clone(),
                })
            }
        }
    }

    /// Tracking and expected quantity are fixed once a line exists
    fn check_existing_line(
        document: &TransferDocument,
        item_code: &str,
        request: &AddLineUnits,
    ) -> Result<(), TransferError> {
        let Some(line) = document.line_for_item(item_code) else {
            return Ok(());
        };
        if line.tracking != request.tracking {
            return Err(TransferError::TrackingMismatch {
                item_code: item_code.to_string(),
                expected: line.tracking,
            });
        }
        if line.expected_quantity != request.expected_quantity {
            return Err(TransferError::ExpectedQuantityMismatch {
                item_code: item_code.to_string(),
                existing: line.expected_quantity,
                requested: request.expected_quantity,
            });
        }
        Ok(())
    }

    fn check_owner(actor: &Actor, document: &TransferDocument, action: &str) -> Result<(), TransferError> {
        if actor.role == Role::Submitter && document.created_by != actor.user_id {
            return Err(TransferError::Forbidden {
                role: actor.role,
                action: format!("{} another user's document", action),
            });
        }
        Ok(())
    }

    /// Owner or admin, document still in `draft`
    fn authorize_edit(actor: &Actor, document: &TransferDocument) -> Result<(), TransferError> {
        match actor.role {
            Role::Submitter => Self::check_owner(actor, document, "edit")?,
            Role::Admin => {}
            role => {
                return Err(TransferError::Forbidden {
                    role,
                    action: "edit".to_string(),
                });
            }
        }
        if !document.state.is_editable() {
            return Err(TransferError::NotEditable {
                actual: document.state,
            });
        }
        Ok(())
    }

    fn authorize(
        actor: &Actor,
        document: &TransferDocument,
        action: DocumentAction,
    ) -> Result<DocumentState, TransferError> {
        let forbidden = || TransferError::Forbidden {
            role: actor.role,
            action: action.to_string(),
        };
        if !roles_for(action).contains(&actor.role) {
            return Err(forbidden());
        }
        if matches!(action, DocumentAction::Submit | DocumentAction::Reopen) {
            Self::check_owner(actor, document, action.as_str())?;
        }
        next_state(document.state, action, actor.role).map_err(|denied| match denied {
            TransitionDenied::RoleNotAllowed => forbidden(),
            TransitionDenied::IllegalFromState => TransferError::StateConflict {
                action,
                actual: document.state,
            },
        })
    }

    async fn commit(
        &self,
        document: &TransferDocument,
        expected: DocumentState,
        action: DocumentAction,
    ) -> Result<(), TransferError> {
        if self.store.update_status_if(document, expected).await? {
            return Ok(());
        }
        // Lost the CAS - report what is actually stored
        match self.store.get_document(document.id).await? {
            Some(current) => Err(TransferError::StateConflict {
                action,
                actual: current.state,
            }),
            None => {
                error!(
                    document_id = %document.id,
                    "Document not found after CAS failure (data corruption?)"
                );
                Err(TransferError::DocumentNotFound(document.id.to_string()))
            }
        }
    }

    fn reset_qc(document: &mut TransferDocument) {
        for line in document.lines.iter_mut() {
            line.qc_status = QcStatus::Pending;
            for unit in line.units.iter_mut() {
                unit.qc_status = QcStatus::Pending;
            }
        }
    }

    /// Apply a posting outcome to a `qc_approved` document
    ///
    /// With `max_attempts`, an unknown outcome that reaches the limit demotes
    /// the document.
    async fn settle_posting(
        &self,
        document: &mut TransferDocument,
        outcome: &PostingOutcome,
        max_attempts: Option<u32>,
    ) -> Result<(), TransferError> {
        let system = Actor::system();
        match outcome {
            PostingOutcome::Posted { reference } => {
                document.state =
                    Self::authorize(&system, document, DocumentAction::PostingSucceeded)?;
                document.external_reference = Some(reference.clone());
                self.commit(document, DocumentState::QcApproved, DocumentAction::PostingSucceeded)
                    .await?;
                info!(
                    document_id = %document.id,
                    reference = %reference,
                    "Document posted"
                );
            }
            PostingOutcome::Rejected { error } => {
                self.demote(document, error.clone()).await?;
            }
            PostingOutcome::Unknown { error } => {
                document.posting_attempts += 1;
                match max_attempts {
                    Some(max) if document.posting_attempts >= max => {
                        let notes = format!(
                            "posting unresolved after {} attempts: {}",
                            document.posting_attempts, error
                        );
                        self.demote(document, notes).await?;
                    }
                    _ => {
                        self.commit(document, DocumentState::QcApproved, DocumentAction::PostingFailed)
                            .await?;
                        warn!(
                            document_id = %document.id,
                            attempts = document.posting_attempts,
                            error = %error,
                            "Posting outcome unknown, left for recovery"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn demote(&self, document: &mut TransferDocument, notes: String) -> Result<(), TransferError> {
        document.state = Self::authorize(&Actor::system(), document, DocumentAction::PostingFailed)?;
        document.qc_notes = Some(notes);
        Self::reset_qc(document);
        self.commit(document, DocumentState::QcApproved, DocumentAction::PostingFailed)
            .await?;
        warn!(
            document_id = %document.id,
            notes = document.qc_notes.as_deref().unwrap_or_default(),
            "Posting failed, document demoted to rejected"
        );
        Ok(())
    }
}
