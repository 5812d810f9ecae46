//! Serial/Batch Transfer Documents
//!
//! A document moves serial- or batch-tracked stock from one warehouse to
//! another. Its lines are filled through batch validation against the
//! inventory authority, then the document goes through QC and is posted to
//! the ERP.
//!
//! # State Machine
//!
//! ```text
//! DRAFT → SUBMITTED → QC_APPROVED → POSTED
//!   ↑         ↓            ↓
//!   └──── REJECTED ←───────┘ (ERP refused / posting unresolved)
//! ```
//!
//! # Invariants
//!
//! 1. **Single Table**: every transition is looked up in `state::next_state`
//! 2. **CAS Commit**: a transition persists document, line and unit QC status
//!    together, or nothing
//! 3. **Exact Quantity**: a line proceeds only with exactly `expected_quantity`
//!    valid units; an over-quota call commits none of its valid units
//! 4. **No Limbo**: no unit is left `unvalidated` by a validation run, and no
//!    document stays `qc_approved` forever

pub mod coordinator;
pub mod error;
pub mod state;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use coordinator::TransferCoordinator;
pub use error::TransferError;
pub use state::{DocumentAction, DocumentState, QcStatus};
pub use store::{MemoryTransferStore, PgTransferStore, TransferStore};
pub use types::{
    AddLineUnits, AddUnitsReport, ApprovalOutcome, DocumentId, LineId, NewDocument, Priority,
    Tracking, TransferDocument, TransferLine, TransferUnit, UnitEntry, UnitId, UnitOutcome,
};
pub use worker::{PostingRecoveryWorker, ScanSummary, WorkerConfig};
