//! Transfer Error Types
//!
//! Every rejected operation carries the detail an operator needs to act on it.

use std::fmt;

use thiserror::Error;

use super::state::{DocumentAction, DocumentState};
use crate::core_types::Role;

/// Why one line blocks document submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineBlocker {
    pub item_code: String,
    pub valid_quantity: u32,
    pub expected_quantity: u32,
    pub unvalidated: usize,
}

impl fmt::Display for LineBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid_quantity < self.expected_quantity {
            write!(
                f,
                "{}: needs {} more valid unit(s) ({}/{})",
                self.item_code,
                self.expected_quantity - self.valid_quantity,
                self.valid_quantity,
                self.expected_quantity
            )?;
        } else if self.valid_quantity > self.expected_quantity {
            write!(
                f,
                "{}: remove {} unit(s) ({}/{})",
                self.item_code,
                self.valid_quantity - self.expected_quantity,
                self.valid_quantity,
                self.expected_quantity
            )?;
        } else {
            write!(f, "{}", self.item_code)?;
        }
        if self.unvalidated > 0 {
            write!(f, ", {} unit(s) not validated", self.unvalidated)?;
        }
        Ok(())
    }
}

fn join_blockers(blockers: &[LineBlocker]) -> String {
    if blockers.is_empty() {
        return "document has no lines".to_string();
    }
    blockers
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Transfer error types
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    // === Authorization ===
    #[error("Role {role} may not {action}")]
    Forbidden { role: Role, action: String },

    // === Input Validation ===
    #[error("Source and destination warehouse cannot be the same")]
    SameWarehouse,

    #[error("Invalid warehouse code: {0}")]
    InvalidWarehouse(String),

    #[error("Expected quantity must be at least 1")]
    InvalidExpectedQuantity,

    #[error("Invalid item code: {0}")]
    InvalidItemCode(String),

    #[error("No identifiers submitted")]
    EmptySubmission,

    #[error("Line {item_code} is {expected:?}-tracked, submission does not match")]
    TrackingMismatch {
        item_code: String,
        expected: super::types::Tracking,
    },

    #[error("Line {item_code} expects {existing} unit(s), submission declared {requested}")]
    ExpectedQuantityMismatch {
        item_code: String,
        existing: u32,
        requested: u32,
    },

    // === Lookup ===
    #[error("Transfer document not found: {0}")]
    DocumentNotFound(String),

    #[error("Transfer line not found: {0}")]
    LineNotFound(String),

    #[error("Transfer unit not found: {0}")]
    UnitNotFound(String),

    // === Storage Invariants ===
    #[error("Item {0} already has a line in this document")]
    DuplicateLine(String),

    #[error("Identifier {0} is already claimed on this line")]
    DuplicateUnit(String),

    #[error("Transfer number collision: {0}")]
    DuplicateTransferNumber(String),

    // === Concurrency / State ===
    #[error("Validation already in progress for item {0}")]
    ValidationInProgress(String),

    #[error("Cannot {action} a document in state {actual}")]
    StateConflict {
        action: DocumentAction,
        actual: DocumentState,
    },

    #[error("Document in state {actual} cannot be edited")]
    NotEditable { actual: DocumentState },

    #[error("Submission blocked: {}", join_blockers(.0))]
    SubmissionBlocked(Vec<LineBlocker>),

    #[error("QC notes are required to reject a document")]
    NotesRequired,

    // === Posting ===
    #[error("Posting rejected by ERP: {0}")]
    PostingFailure(String),

    // === Cancellation ===
    #[error("Validation cancelled after {checkpointed} checkpointed unit(s)")]
    Cancelled { checkpointed: usize },

    // === System Errors ===
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Internal system error: {0}")]
    SystemError(String),
}

impl TransferError {
    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::Forbidden { .. } => "FORBIDDEN",
            TransferError::SameWarehouse => "SAME_WAREHOUSE",
            TransferError::InvalidWarehouse(_) => "INVALID_WAREHOUSE",
            TransferError::InvalidExpectedQuantity => "INVALID_EXPECTED_QUANTITY",
            TransferError::InvalidItemCode(_) => "INVALID_ITEM_CODE",
            TransferError::EmptySubmission => "EMPTY_SUBMISSION",
            TransferError::TrackingMismatch { .. } => "TRACKING_MISMATCH",
            TransferError::ExpectedQuantityMismatch { .. } => "EXPECTED_QUANTITY_MISMATCH",
            TransferError::DocumentNotFound(_) => "DOCUMENT_NOT_FOUND",
            TransferError::LineNotFound(_) => "LINE_NOT_FOUND",
            TransferError::UnitNotFound(_) => "UNIT_NOT_FOUND",
            TransferError::DuplicateLine(_) => "DUPLICATE_LINE",
            TransferError::DuplicateUnit(_) => "DUPLICATE_UNIT",
            TransferError::DuplicateTransferNumber(_) => "DUPLICATE_TRANSFER_NUMBER",
            TransferError::ValidationInProgress(_) => "VALIDATION_IN_PROGRESS",
            TransferError::StateConflict { .. } => "STATE_CONFLICT",
            TransferError::NotEditable { .. } => "NOT_EDITABLE",
            TransferError::SubmissionBlocked(_) => "SUBMISSION_BLOCKED",
            TransferError::NotesRequired => "NOTES_REQUIRED",
            TransferError::PostingFailure(_) => "POSTING_FAILURE",
            TransferError::Cancelled { .. } => "CANCELLED",
            TransferError::DatabaseError(_) => "DATABASE_ERROR",
            TransferError::SystemError(_) => "SYSTEM_ERROR",
        }
    }

    /// HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::Forbidden { .. } => 403,
            TransferError::SameWarehouse
            | TransferError::InvalidWarehouse(_)
            | TransferError::InvalidExpectedQuantity
            | TransferError::InvalidItemCode(_)
            | TransferError::EmptySubmission
            | TransferError::TrackingMismatch { .. }
            | TransferError::NotesRequired => 400,
            TransferError::DocumentNotFound(_)
            | TransferError::LineNotFound(_)
            | TransferError::UnitNotFound(_) => 404,
            TransferError::DuplicateLine(_)
            | TransferError::DuplicateUnit(_)
            | TransferError::DuplicateTransferNumber(_)
            | TransferError::ExpectedQuantityMismatch { .. }
            | TransferError::ValidationInProgress(_)
            | TransferError::StateConflict { .. }
            | TransferError::NotEditable { .. } => 409,
            TransferError::SubmissionBlocked(_) => 422,
            TransferError::PostingFailure(_) => 502,
            TransferError::Cancelled { .. } => 499,
            TransferError::DatabaseError(_) | TransferError::SystemError(_) => 500,
        }
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        TransferError::DatabaseError(e.to_string())
    }
}

impl From<anyhow::Error> for TransferError {
    fn from(e: anyhow::Error) -> Self {
        TransferError::SystemError(e.to_string())
    }
}
