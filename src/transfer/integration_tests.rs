//! Integration Tests for Transfer Documents
//!
//! These tests drive the coordinator end to end against the in-memory store,
//! with MockAuthority and MockPosting simulating the ERP.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::authority::MockAuthority;
use crate::core_types::Actor;
use crate::posting::MockPosting;
use crate::transfer::coordinator::TransferCoordinator;
use crate::transfer::error::TransferError;
use crate::transfer::state::{DocumentAction, DocumentState, QcStatus};
use crate::transfer::store::{MemoryTransferStore, TransferStore};
use crate::transfer::types::{
    AddLineUnits, ApprovalOutcome, DocumentId, LineId, NewDocument, Tracking, TransferDocument,
    TransferLine, TransferUnit, UnitEntry, UnitId, UnitOutcome,
};
use crate::transfer::worker::{PostingRecoveryWorker, WorkerConfig};
use crate::validation::batch::{BatchValidator, CheckpointEntry, CheckpointKey, ValidatorConfig};
use crate::validation::chunking::{ChunkingPolicy, RetryPolicy};
use crate::validation::reconcile::Reconciliation;

const OWNER: i64 = 7;
const QC: i64 = 9;

fn validator_config(min: usize, max: usize) -> ValidatorConfig {
    ValidatorConfig {
        chunking: ChunkingPolicy {
            min_chunk_size: min,
            max_chunk_size: max,
            target_chunks: 10,
        },
        retry: RetryPolicy::immediate(1),
        concurrency: 4,
        call_timeout: Duration::from_secs(2),
        checkpoint_ttl: Duration::from_secs(900),
    }
}

fn assert_send<T: Send>(_: T) {}

/// Helper bundling a coordinator with its mocks
struct TestHarness {
    coordinator: Arc<TransferCoordinator>,
    store: Arc<MemoryTransferStore>,
    authority: Arc<MockAuthority>,
    posting: Arc<MockPosting>,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_chunking(10, 100)
    }

    fn with_chunking(min: usize, max: usize) -> Self {
        let store = Arc::new(MemoryTransferStore::new());
        let authority = Arc::new(MockAuthority::new());
        let posting = Arc::new(MockPosting::new());

        let validator = BatchValidator::new(authority.clone(), validator_config(min, max));
        let coordinator = Arc::new(TransferCoordinator::new(
            store.clone(),
            validator,
            posting.clone(),
        ));

        Self {
            coordinator,
            store,
            authority,
            posting,
        }
    }

    fn owner(&self) -> Actor {
        Actor::submitter(OWNER)
    }

    fn qc(&self) -> Actor {
        Actor::qc(QC)
    }

    fn worker(&self, max_posting_attempts: u32) -> PostingRecoveryWorker {
        PostingRecoveryWorker::new(
            self.coordinator.clone(),
            WorkerConfig {
                scan_interval: Duration::from_secs(1),
                stale_threshold: Duration::from_secs(60),
                max_posting_attempts,
                batch_size: 10,
            },
            Duration::from_secs(900),
        )
    }

    async fn create(&self) -> DocumentId {
        self.coordinator
            .create_document(&self.owner(), NewDocument::new("WH01", "WH02"))
            .await
            .unwrap()
    }

    async fn add(
        &self,
        id: DocumentId,
        item_code: &str,
        expected: u32,
        serials: &[&str],
    ) -> Result<crate::transfer::types::AddUnitsReport, TransferError> {
        self.coordinator
            .add_line_units(
                &self.owner(),
                id,
                AddLineUnits::serials(item_code, expected, serials),
                &CancellationToken::new(),
            )
            .await
    }

    /// Draft document with one complete line
    async fn ready_document(&self) -> DocumentId {
        self.authority.stock_serials("SN-ITEM", "WH01", &["A"]);
        let id = self.create().await;
        self.add(id, "SN-ITEM", 1, &["A"]).await.unwrap();
        id
    }

    async fn document_in(&self, state: DocumentState) -> DocumentId {
        let id = self.ready_document().await;
        if state == DocumentState::Draft {
            return id;
        }
        self.coordinator.submit_document(&self.owner(), id).await.unwrap();
        match state {
            DocumentState::Submitted => {}
            DocumentState::Rejected => {
                self.coordinator
                    .reject_document(&self.qc(), id, "wrong pallet")
                    .await
                    .unwrap();
            }
            DocumentState::QcApproved => {
                self.posting.unknown_next("connection reset");
                self.coordinator.approve_document(&self.qc(), id, None).await.unwrap();
            }
            DocumentState::Posted => {
                self.coordinator.approve_document(&self.qc(), id, None).await.unwrap();
            }
            DocumentState::Draft => unreachable!(),
        }
        assert_eq!(self.coordinator.get_document(id).await.unwrap().state, state);
        id
    }
}

// ========================================================================
// Validation & Reconciliation
// ========================================================================

/// Line expects 3, submission ["A","B","B","C"]: both B's duplicate, 2 valid
#[tokio::test]
async fn test_duplicate_entries_scenario() {
    let harness = TestHarness::new();
    harness.authority.stock_serials("SN-ITEM", "WH01", &["A", "B", "C"]);
    let id = harness.create().await;

    let report = harness
        .add(id, "SN-ITEM", 3, &["A", "B", "B", "C"])
        .await
        .unwrap();

    assert_eq!(report.valid_count, 2);
    assert_eq!(report.duplicate_count, 2);
    assert_eq!(report.invalid_count, 0);
    assert_eq!(report.line_valid_quantity, 2);
    assert_eq!(report.reconciliation, Reconciliation::Short { missing: 1 });
    assert_eq!(report.duplicates, vec!["B".to_string()]);
    assert!(report.message.contains("needs 1 more valid unit(s)"));
    assert_eq!(harness.authority.calls_for("B"), 0);

    let document = harness.coordinator.get_document(id).await.unwrap();
    let line = &document.lines[0];
    assert_eq!(line.units.len(), 4);
    assert_eq!(line.count(UnitOutcome::Duplicate), 2);
    assert_eq!(line.count(UnitOutcome::Valid), 2);

    let result = harness.coordinator.submit_document(&harness.owner(), id).await;
    match result {
        Err(TransferError::SubmissionBlocked(blockers)) => {
            assert_eq!(blockers.len(), 1);
            assert_eq!(blockers[0].valid_quantity, 2);
            assert_eq!(blockers[0].expected_quantity, 3);
        }
        other => panic!("unexpected {:?}", other),
    }
}

/// Exact submission is ready; resubmitting makes no authority calls
#[tokio::test]
async fn test_exact_match_idempotent() {
    let harness = TestHarness::new();
    harness.authority.stock_serials("SN-ITEM", "WH01", &["A", "B", "C"]);
    let id = harness.create().await;

    let report = harness.add(id, "SN-ITEM", 3, &["A", "B", "C"]).await.unwrap();
    assert_eq!(report.reconciliation, Reconciliation::Complete);
    assert_eq!(harness.authority.total_calls(), 3);

    let again = harness.add(id, "SN-ITEM", 3, &["A", "B", "C"]).await.unwrap();
    assert_eq!(again.already_valid, 3);
    assert_eq!(again.valid_count, 0);
    assert_eq!(again.reconciliation, Reconciliation::Complete);
    assert_eq!(harness.authority.total_calls(), 3);

    let document = harness.coordinator.get_document(id).await.unwrap();
    assert_eq!(document.lines[0].units.len(), 3);
    harness
        .coordinator
        .submit_document(&harness.owner(), id)
        .await
        .unwrap();
}

/// Over-quota call commits none of its valid units
#[tokio::test]
async fn test_excess_rejects_whole_call() {
    let harness = TestHarness::new();
    harness.authority.stock_serials("SN-ITEM", "WH01", &["A", "B", "C"]);
    let id = harness.create().await;

    let report = harness
        .add(id, "SN-ITEM", 2, &["A", "B", "C", "X"])
        .await
        .unwrap();
    assert!(report.is_rejected());
    assert_eq!(report.reconciliation, Reconciliation::Excess { remove: 1 });
    assert_eq!(report.line_valid_quantity, 0);
    assert!(report.message.contains("remove 1 identifier(s)"));

    let document = harness.coordinator.get_document(id).await.unwrap();
    let line = &document.lines[0];
    assert_eq!(line.valid_quantity(), 0);
    assert_eq!(line.units.len(), 1);
    assert_eq!(line.units[0].identifier, "X");
    assert_eq!(line.units[0].outcome, UnitOutcome::Invalid);

    // Corrected resubmission reuses the checkpointed outcomes
    let calls = harness.authority.total_calls();
    let report = harness.add(id, "SN-ITEM", 2, &["A", "B"]).await.unwrap();
    assert_eq!(report.reconciliation, Reconciliation::Complete);
    assert_eq!(harness.authority.total_calls(), calls);
}

/// Chunk 2 of 3 fails irrecoverably; chunks 1 and 3 stay validated
#[tokio::test]
async fn test_checkpoint_durability() {
    let harness = TestHarness::with_chunking(2, 2);
    let serials = ["S0", "S1", "S2", "S3", "S4", "S5"];
    harness.authority.stock_serials("SN-ITEM", "WH01", &serials);
    harness.authority.set_down_for(&["S2", "S3"]);
    let id = harness.create().await;

    let report = harness.add(id, "SN-ITEM", 6, &serials).await.unwrap();
    assert_eq!(report.valid_count, 4);
    assert_eq!(report.invalid_count, 2);

    let document = harness.coordinator.get_document(id).await.unwrap();
    let line = &document.lines[0];
    assert_eq!(line.unvalidated_count(), 0);
    for unit in line.units.iter().filter(|u| u.outcome == UnitOutcome::Invalid) {
        assert!(unit.reason.as_deref().unwrap().starts_with("validation error:"));
    }

    let journal = harness.coordinator.checkpoint(line.id).await.unwrap();
    assert_eq!(journal.len(), 6);
    let valid: Vec<&str> = journal
        .iter()
        .filter(|e| e.outcome == UnitOutcome::Valid)
        .map(|e| e.identifier.as_str())
        .collect();
    assert!(valid.contains(&"S0") && valid.contains(&"S1"));
    assert!(journal.iter().filter(|e| e.transient).count() == 2);

    // Authority back: revalidating in place completes the line
    harness.authority.clear_down();
    let report = harness
        .coordinator
        .add_line_units(
            &harness.owner(),
            id,
            AddLineUnits::serials("SN-ITEM", 6, &["S2", "S3"]).with_revalidate(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.reconciliation, Reconciliation::Complete);
    let document = harness.coordinator.get_document(id).await.unwrap();
    assert_eq!(document.lines[0].units.len(), 6);
}

#[tokio::test]
async fn test_concurrent_validation_of_same_line_rejected() {
    let harness = TestHarness::new();
    harness.authority.stock_serials("SN-ITEM", "WH01", &["A", "B"]);
    harness.authority.stock_serials("SN-OTHER", "WH01", &["Z"]);
    harness.authority.set_delay(Duration::from_millis(200));
    let id = harness.create().await;

    let coordinator = harness.coordinator.clone();
    let owner = harness.owner();
    let first = tokio::spawn(async move {
        coordinator
            .add_line_units(
                &owner,
                id,
                AddLineUnits::serials("SN-ITEM", 2, &["A", "B"]),
                &CancellationToken::new(),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = harness.add(id, "SN-ITEM", 2, &["A", "B"]).await;
    assert!(matches!(second, Err(TransferError::ValidationInProgress(_))));

    // Other lines validate independently
    let other = harness.add(id, "SN-OTHER", 1, &["Z"]).await.unwrap();
    assert_eq!(other.reconciliation, Reconciliation::Complete);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.reconciliation, Reconciliation::Complete);
    assert!(harness.add(id, "SN-ITEM", 2, &["A"]).await.is_ok());
}

/// Memory store that parks the first `get_document` after `arm()` until released
struct GatedStore {
    inner: MemoryTransferStore,
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl GatedStore {
    fn new() -> Self {
        Self {
            inner: MemoryTransferStore::new(),
            armed: AtomicBool::new(false),
            reached: Notify::new(),
            release: Notify::new(),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransferStore for GatedStore {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn insert_document(&self, document: &TransferDocument) -> Result<(), TransferError> {
        self.inner.insert_document(document).await
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<TransferDocument>, TransferError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        self.inner.get_document(id).await
    }

    async fn locate_line(&self, line_id: LineId) -> Result<Option<DocumentId>, TransferError> {
        self.inner.locate_line(line_id).await
    }

    async fn locate_unit(&self, unit_id: UnitId) -> Result<Option<DocumentId>, TransferError> {
        self.inner.locate_unit(unit_id).await
    }

    async fn save_line_units(
        &self,
        line: &TransferLine,
        units: &[TransferUnit],
    ) -> Result<bool, TransferError> {
        self.inner.save_line_units(line, units).await
    }

    async fn delete_unit(
        &self,
        document_id: DocumentId,
        unit_id: UnitId,
    ) -> Result<bool, TransferError> {
        self.inner.delete_unit(document_id, unit_id).await
    }

    async fn update_status_if(
        &self,
        document: &TransferDocument,
        expected: DocumentState,
    ) -> Result<bool, TransferError> {
        self.inner.update_status_if(document, expected).await
    }

    async fn find_stale_approved(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<TransferDocument>, TransferError> {
        self.inner.find_stale_approved(threshold, limit).await
    }

    async fn save_checkpoint(
        &self,
        key: &CheckpointKey,
        entries: &[CheckpointEntry],
    ) -> Result<(), TransferError> {
        self.inner.save_checkpoint(key, entries).await
    }

    async fn load_checkpoint(
        &self,
        key: &CheckpointKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<CheckpointEntry>, TransferError> {
        self.inner.load_checkpoint(key, since).await
    }

    async fn purge_checkpoints(&self, before: DateTime<Utc>) -> Result<u64, TransferError> {
        self.inner.purge_checkpoints(before).await
    }
}

/// A commit landing between a call's first read and its line guard is seen
#[tokio::test]
async fn test_validation_sees_units_committed_before_guard() {
    let store = Arc::new(GatedStore::new());
    let authority = Arc::new(MockAuthority::new());
    authority.stock_serials("SN-ITEM", "WH01", &["A", "B"]);
    let coordinator = Arc::new(TransferCoordinator::new(
        store.clone(),
        BatchValidator::new(authority.clone(), validator_config(10, 100)),
        Arc::new(MockPosting::new()),
    ));
    let owner = Actor::submitter(OWNER);
    let id = coordinator
        .create_document(&owner, NewDocument::new("WH01", "WH02"))
        .await
        .unwrap();

    store.arm();
    let late = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .add_line_units(
                    &owner,
                    id,
                    AddLineUnits::serials("SN-ITEM", 2, &["A", "B"]),
                    &CancellationToken::new(),
                )
                .await
        })
    };
    store.reached.notified().await;

    let early = coordinator
        .add_line_units(
            &owner,
            id,
            AddLineUnits::serials("SN-ITEM", 2, &["A"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(early.valid_count, 1);
    store.release.notify_one();

    let late = late.await.unwrap().unwrap();
    assert_eq!(late.already_valid, 1);
    assert_eq!(late.valid_count, 1);
    assert_eq!(late.reconciliation, Reconciliation::Complete);
    assert_eq!(authority.calls_for("A"), 1);
}

#[test]
fn test_coordinator_futures_are_send() {
    let harness = TestHarness::new();
    let owner = harness.owner();
    let cancel = CancellationToken::new();
    let id = DocumentId::new();

    assert_send(harness.coordinator.add_line_units(
        &owner,
        id,
        AddLineUnits::serials("SN-ITEM", 1, &["A"]),
        &cancel,
    ));
    assert_send(harness.coordinator.preview_units(
        &owner,
        id,
        AddLineUnits::serials("SN-ITEM", 1, &["A"]),
        &cancel,
    ));
    assert_send(harness.coordinator.revalidate_unit(&owner, UnitId::new()));
    assert_send(harness.coordinator.approve_document(&harness.qc(), id, None));
    assert_send(harness.worker(3).scan_and_recover());
}

/// Preview commits nothing; the following add reuses its answers
#[tokio::test]
async fn test_preview_units_leaves_line_untouched() {
    let harness = TestHarness::new();
    harness.authority.stock_serials("SN-ITEM", "WH01", &["A"]);
    let id = harness.create().await;

    let run = harness
        .coordinator
        .preview_units(
            &harness.owner(),
            id,
            AddLineUnits::serials("SN-ITEM", 2, &["A", "GHOST"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(run.valid_count(), 1);
    assert_eq!(run.invalid_count(), 1);
    assert!(harness.coordinator.get_document(id).await.unwrap().lines.is_empty());

    let report = harness.add(id, "SN-ITEM", 2, &["A", "GHOST"]).await.unwrap();
    assert_eq!(report.valid_count, 1);
    assert_eq!(report.invalid_count, 1);
    assert_eq!(harness.authority.calls_for("A"), 1);
    assert_eq!(harness.authority.calls_for("GHOST"), 1);

    let stranger = Actor::submitter(OWNER + 1);
    let denied = harness
        .coordinator
        .preview_units(
            &stranger,
            id,
            AddLineUnits::serials("SN-ITEM", 2, &["A"]),
            &CancellationToken::new(),
        )
        .await;
    assert!(matches!(denied, Err(TransferError::Forbidden { .. })));
}

#[tokio::test]
async fn test_cancelled_validation_keeps_checkpoint_and_releases_line() {
    let harness = TestHarness::with_chunking(1, 1);
    harness.authority.stock_serials("SN-ITEM", "WH01", &["A", "B", "C"]);
    harness.authority.set_delay(Duration::from_millis(100));
    let id = harness.create().await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let result = harness
        .coordinator
        .add_line_units(
            &harness.owner(),
            id,
            AddLineUnits::serials("SN-ITEM", 3, &["A", "B", "C"]),
            &cancel,
        )
        .await;
    assert!(matches!(result, Err(TransferError::Cancelled { checkpointed: 1 })));

    harness.authority.set_delay(Duration::ZERO);
    let calls = harness.authority.total_calls();
    let report = harness.add(id, "SN-ITEM", 3, &["A", "B", "C"]).await.unwrap();
    assert_eq!(report.reconciliation, Reconciliation::Complete);
    assert_eq!(harness.authority.total_calls(), calls + 2);
}

#[tokio::test]
async fn test_line_tracking_and_quantity_fixed_after_creation() {
    let harness = TestHarness::new();
    harness.authority.stock_serials("SN-ITEM", "WH01", &["A", "B"]);
    let id = harness.create().await;
    harness.add(id, "SN-ITEM", 2, &["A"]).await.unwrap();

    let result = harness.add(id, "SN-ITEM", 3, &["B"]).await;
    assert!(matches!(
        result,
        Err(TransferError::ExpectedQuantityMismatch { existing: 2, requested: 3, .. })
    ));

    let batch = AddLineUnits {
        item_code: "SN-ITEM".into(),
        expected_quantity: 2,
        tracking: Tracking::Batch,
        item_description: None,
        unit_of_measure: None,
        entries: vec![UnitEntry::batch("B", 1)],
        revalidate: false,
    };
    let result = harness
        .coordinator
        .add_line_units(&harness.owner(), id, batch, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(TransferError::TrackingMismatch { .. })));
}

#[tokio::test]
async fn test_batch_line_counts_quantities() {
    let harness = TestHarness::new();
    harness.authority.stock_batch("RM-100", "WH01", "LOT-1", 10);
    harness.authority.stock_batch("RM-100", "WH01", "LOT-2", 3);
    let id = harness.create().await;

    let request = AddLineUnits {
        item_code: "RM-100".into(),
        expected_quantity: 8,
        tracking: Tracking::Batch,
        item_description: None,
        unit_of_measure: Some("KG".into()),
        entries: vec![UnitEntry::batch("LOT-1", 6), UnitEntry::batch("LOT-2", 5)],
        revalidate: false,
    };
    let report = harness
        .coordinator
        .add_line_units(&harness.owner(), id, request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.valid_count, 1);
    assert_eq!(report.invalid_count, 1);
    assert_eq!(report.line_valid_quantity, 6);
    assert_eq!(report.reconciliation, Reconciliation::Short { missing: 2 });

    let document = harness.coordinator.get_document(id).await.unwrap();
    let lot2 = document.lines[0]
        .units
        .iter()
        .find(|u| u.identifier == "LOT-2")
        .unwrap();
    assert!(lot2.reason.as_deref().unwrap().contains("only 3 available"));
}

// ========================================================================
// Unit maintenance
// ========================================================================

#[tokio::test]
async fn test_revalidate_not_applied_over_expected_quantity() {
    let harness = TestHarness::new();
    harness.authority.stock_serials("SN-ITEM", "WH01", &["A"]);
    let id = harness.create().await;
    harness.add(id, "SN-ITEM", 1, &["A", "X"]).await.unwrap();

    let document = harness.coordinator.get_document(id).await.unwrap();
    let a = document.lines[0].units.iter().find(|u| u.identifier == "A").unwrap().id;
    let x = document.lines[0].units.iter().find(|u| u.identifier == "X").unwrap().id;

    // X now exists, but the line is already complete
    harness.authority.stock_serials("SN-ITEM", "WH01", &["X"]);
    let outcome = harness
        .coordinator
        .revalidate_unit(&harness.owner(), x)
        .await
        .unwrap();
    assert_eq!(outcome, UnitOutcome::Invalid);
    let document = harness.coordinator.get_document(id).await.unwrap();
    let (line, unit) = document.unit(x).unwrap();
    assert!(unit.reason.as_deref().unwrap().contains("remove a unit first"));
    assert_eq!(line.valid_quantity(), 1);

    harness.coordinator.remove_unit(&harness.owner(), a).await.unwrap();
    let outcome = harness
        .coordinator
        .revalidate_unit(&harness.owner(), x)
        .await
        .unwrap();
    assert_eq!(outcome, UnitOutcome::Valid);
    let document = harness.coordinator.get_document(id).await.unwrap();
    assert!(document.lines[0].is_ready());
}

#[tokio::test]
async fn test_revalidate_after_remote_move() {
    let harness = TestHarness::new();
    let id = harness.ready_document().await;
    let unit_id = harness.coordinator.get_document(id).await.unwrap().lines[0].units[0].id;

    harness.authority.move_to("A", "WH09");
    let outcome = harness
        .coordinator
        .revalidate_unit(&harness.owner(), unit_id)
        .await
        .unwrap();
    assert_eq!(outcome, UnitOutcome::Invalid);

    let document = harness.coordinator.get_document(id).await.unwrap();
    let (_, unit) = document.unit(unit_id).unwrap();
    assert!(unit.reason.as_deref().unwrap().contains("WH09"));
    assert!(matches!(
        harness.coordinator.submit_document(&harness.owner(), id).await,
        Err(TransferError::SubmissionBlocked(_))
    ));
}

#[tokio::test]
async fn test_edits_refused_outside_draft() {
    let harness = TestHarness::new();
    let id = harness.document_in(DocumentState::Submitted).await;
    let unit_id = harness.coordinator.get_document(id).await.unwrap().lines[0].units[0].id;

    assert!(matches!(
        harness.add(id, "SN-ITEM", 1, &["A"]).await,
        Err(TransferError::NotEditable { actual: DocumentState::Submitted })
    ));
    assert!(matches!(
        harness.coordinator.remove_unit(&harness.owner(), unit_id).await,
        Err(TransferError::NotEditable { .. })
    ));
    assert!(matches!(
        harness.coordinator.revalidate_unit(&harness.owner(), unit_id).await,
        Err(TransferError::NotEditable { .. })
    ));
}

// ========================================================================
// State Machine
// ========================================================================

/// From every state only the listed transitions succeed
#[tokio::test]
async fn test_state_machine_soundness() {
    let states = [
        DocumentState::Draft,
        DocumentState::Submitted,
        DocumentState::QcApproved,
        DocumentState::Posted,
        DocumentState::Rejected,
    ];
    let actions = [
        DocumentAction::Submit,
        DocumentAction::Approve,
        DocumentAction::Reject,
        DocumentAction::Reopen,
    ];
    let allowed = [
        (DocumentState::Draft, DocumentAction::Submit),
        (DocumentState::Submitted, DocumentAction::Approve),
        (DocumentState::Submitted, DocumentAction::Reject),
        (DocumentState::Rejected, DocumentAction::Reopen),
    ];

    for state in states {
        for action in actions {
            let harness = TestHarness::new();
            let id = harness.document_in(state).await;
            let before = harness.coordinator.get_document(id).await.unwrap();

            let result = match action {
                DocumentAction::Submit => {
                    harness.coordinator.submit_document(&harness.owner(), id).await
                }
                DocumentAction::Approve => harness
                    .coordinator
                    .approve_document(&harness.qc(), id, Some("ok"))
                    .await
                    .map(|_| ()),
                DocumentAction::Reject => {
                    harness.coordinator.reject_document(&harness.qc(), id, "no").await
                }
                DocumentAction::Reopen => {
                    harness.coordinator.reopen_document(&harness.owner(), id).await
                }
                _ => unreachable!(),
            };

            if allowed.contains(&(state, action)) {
                assert!(result.is_ok(), "{} --{}--> failed: {:?}", state, action, result);
            } else {
                assert!(
                    matches!(result, Err(TransferError::StateConflict { actual, .. }) if actual == state),
                    "{} --{}--> should conflict, got {:?}",
                    state,
                    action,
                    result
                );
                let after = harness.coordinator.get_document(id).await.unwrap();
                assert_eq!(after.state, before.state);
                assert_eq!(after.qc_notes, before.qc_notes);
                assert_eq!(after.updated_at, before.updated_at);
            }
        }
    }
}

/// Racing QC decisions on one document: exactly one wins
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_simultaneous_approve_and_reject_one_wins() {
    let harness = TestHarness::new();
    let id = harness.document_in(DocumentState::Submitted).await;

    let approve = {
        let coordinator = harness.coordinator.clone();
        let qc = harness.qc();
        tokio::spawn(async move { coordinator.approve_document(&qc, id, None).await.map(|_| ()) })
    };
    let reject = {
        let coordinator = harness.coordinator.clone();
        let qc = harness.qc();
        tokio::spawn(async move { coordinator.reject_document(&qc, id, "damaged").await })
    };
    let approve = approve.await.unwrap();
    let reject = reject.await.unwrap();

    let document = harness.coordinator.get_document(id).await.unwrap();
    match (&approve, &reject) {
        (Ok(()), Err(TransferError::StateConflict { actual, .. })) => {
            assert_eq!(document.state, DocumentState::Posted);
            assert_eq!(*actual, DocumentState::Posted);
        }
        (Err(TransferError::StateConflict { actual, .. }), Ok(())) => {
            assert_eq!(document.state, DocumentState::Rejected);
            assert_eq!(*actual, DocumentState::Rejected);
            assert_eq!(harness.posting.post_calls(), 0);
        }
        other => panic!("expected exactly one winner, got {:?}", other),
    }
}

#[tokio::test]
async fn test_role_and_owner_checks() {
    let harness = TestHarness::new();
    let id = harness.ready_document().await;

    assert!(matches!(
        harness.coordinator.submit_document(&Actor::submitter(99), id).await,
        Err(TransferError::Forbidden { .. })
    ));
    assert!(matches!(
        harness.coordinator.submit_document(&harness.qc(), id).await,
        Err(TransferError::Forbidden { .. })
    ));
    // Admin may act for the owner
    harness.coordinator.submit_document(&Actor::admin(1), id).await.unwrap();

    assert!(matches!(
        harness.coordinator.approve_document(&harness.owner(), id, None).await,
        Err(TransferError::Forbidden { .. })
    ));
    assert!(matches!(
        harness.coordinator.reject_document(&harness.qc(), id, "   ").await,
        Err(TransferError::NotesRequired)
    ));
    assert_eq!(
        harness.coordinator.get_document(id).await.unwrap().state,
        DocumentState::Submitted
    );
}

#[tokio::test]
async fn test_reopen_resets_qc() {
    let harness = TestHarness::new();
    let id = harness.document_in(DocumentState::Rejected).await;

    let rejected = harness.coordinator.get_document(id).await.unwrap();
    assert_eq!(rejected.qc_approver, Some(QC));
    assert_eq!(rejected.qc_notes.as_deref(), Some("wrong pallet"));
    assert_eq!(rejected.lines[0].qc_status, QcStatus::Rejected);

    harness.coordinator.reopen_document(&harness.owner(), id).await.unwrap();

    let document = harness.coordinator.get_document(id).await.unwrap();
    assert_eq!(document.state, DocumentState::Draft);
    assert!(document.qc_approver.is_none());
    assert!(document.qc_at.is_none());
    assert!(document.qc_notes.is_none());
    for line in &document.lines {
        assert_eq!(line.qc_status, QcStatus::Pending);
        assert!(line.units.iter().all(|u| u.qc_status == QcStatus::Pending));
    }
}

// ========================================================================
// Posting
// ========================================================================

#[tokio::test]
async fn test_approve_posts_document() {
    let harness = TestHarness::new();
    let id = harness.document_in(DocumentState::Submitted).await;

    let outcome = harness
        .coordinator
        .approve_document(&harness.qc(), id, Some("looks good"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ApprovalOutcome::Posted {
            reference: "1000".into()
        }
    );

    let document = harness.coordinator.get_document(id).await.unwrap();
    assert_eq!(document.state, DocumentState::Posted);
    assert_eq!(document.external_reference.as_deref(), Some("1000"));
    assert_eq!(document.qc_notes.as_deref(), Some("looks good"));
    assert_eq!(document.lines[0].qc_status, QcStatus::Approved);
    assert_eq!(document.lines[0].units[0].qc_status, QcStatus::Approved);
    assert_eq!(harness.posting.post_calls(), 1);
}

#[tokio::test]
async fn test_posting_rejection_demotes_document() {
    let harness = TestHarness::new();
    let id = harness.document_in(DocumentState::Submitted).await;
    let erp_error = "-10: Quantity falls into negative inventory";
    harness.posting.reject_next(erp_error);

    let result = harness.coordinator.approve_document(&harness.qc(), id, None).await;
    assert!(matches!(result, Err(TransferError::PostingFailure(ref e)) if e == erp_error));

    let document = harness.coordinator.get_document(id).await.unwrap();
    assert_eq!(document.state, DocumentState::Rejected);
    assert_eq!(document.qc_notes.as_deref(), Some(erp_error));
    assert!(document.external_reference.is_none());
    assert_eq!(document.lines[0].qc_status, QcStatus::Pending);
    assert_eq!(document.lines[0].units[0].qc_status, QcStatus::Pending);

    // Operator fixes and resubmits
    harness.coordinator.reopen_document(&harness.owner(), id).await.unwrap();
    harness.coordinator.submit_document(&harness.owner(), id).await.unwrap();
}

/// The ERP accepted an earlier post whose answer was lost
#[tokio::test]
async fn test_unknown_posting_resolved_by_lookup() {
    let harness = TestHarness::new();
    let id = harness.document_in(DocumentState::Submitted).await;
    harness.posting.unknown_next("operation timed out");

    let outcome = harness.coordinator.approve_document(&harness.qc(), id, None).await.unwrap();
    assert!(matches!(outcome, ApprovalOutcome::PostingPending { .. }));
    let document = harness.coordinator.get_document(id).await.unwrap();
    assert_eq!(document.state, DocumentState::QcApproved);
    assert_eq!(document.posting_attempts, 1);

    harness.posting.insert_erp_document(&document.transfer_number, "2001");
    let worker = harness.worker(5);

    // Not stale yet
    assert_eq!(worker.scan_and_recover().await.unwrap().scanned, 0);

    harness.store.age_document(id, Duration::from_secs(120));
    let summary = worker.scan_and_recover().await.unwrap();
    assert_eq!(summary.posted, 1);
    assert_eq!(harness.posting.post_calls(), 1);
    assert_eq!(harness.posting.lookup_calls(), 1);

    let document = harness.coordinator.get_document(id).await.unwrap();
    assert_eq!(document.state, DocumentState::Posted);
    assert_eq!(document.external_reference.as_deref(), Some("2001"));
}

#[tokio::test]
async fn test_unknown_posting_reposted_by_worker() {
    let harness = TestHarness::new();
    let id = harness.document_in(DocumentState::QcApproved).await;

    harness.store.age_document(id, Duration::from_secs(120));
    let summary = harness.worker(5).scan_and_recover().await.unwrap();
    assert_eq!(summary.posted, 1);
    assert_eq!(harness.posting.post_calls(), 2);

    let document = harness.coordinator.get_document(id).await.unwrap();
    assert_eq!(document.state, DocumentState::Posted);
}

#[tokio::test]
async fn test_unresolved_posting_demoted_after_max_attempts() {
    let harness = TestHarness::new();
    let id = harness.document_in(DocumentState::QcApproved).await;
    let worker = harness.worker(3);

    // Lookup failures never re-post
    harness.posting.set_lookup_fails(true);
    harness.store.age_document(id, Duration::from_secs(120));
    let summary = worker.scan_and_recover().await.unwrap();
    assert_eq!(summary.pending, 1);
    assert_eq!(harness.posting.post_calls(), 1);
    assert_eq!(
        harness.coordinator.get_document(id).await.unwrap().posting_attempts,
        2
    );

    harness.posting.set_lookup_fails(false);
    harness.posting.unknown_next("502 Bad Gateway");
    harness.store.age_document(id, Duration::from_secs(120));
    let summary = worker.scan_and_recover().await.unwrap();
    assert_eq!(summary.demoted, 1);

    let document = harness.coordinator.get_document(id).await.unwrap();
    assert_eq!(document.state, DocumentState::Rejected);
    assert_eq!(
        document.qc_notes.as_deref(),
        Some("posting unresolved after 3 attempts: 502 Bad Gateway")
    );
    assert_eq!(document.lines[0].qc_status, QcStatus::Pending);
}
