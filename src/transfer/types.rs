//! Transfer Core Types
//!
//! Documents, lines and units as they are persisted and handed to adapters.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::state::{DocumentState, QcStatus};
use crate::core_types::UserId;
use crate::validation::reconcile::{Reconciliation, reconcile};

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(ulid::Ulid);

        impl $name {
            pub fn new() -> Self {
                Self(ulid::Ulid::new())
            }

            pub fn inner(&self) -> ulid::Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(ulid::Ulid::from_string(s)?))
            }
        }
    };
}

ulid_id!(
    /// Transfer document ID (ULID, also the DB primary key)
    DocumentId
);
ulid_id!(
    /// Transfer line ID, scoped to its document
    LineId
);
ulid_id!(
    /// Transfer unit ID (one serial, or one batch/quantity pair)
    UnitId
);

/// Generate a human-readable transfer number: `SIT-<UTC timestamp>-<suffix>`
///
/// The random suffix separates documents created within the same second;
/// uniqueness is still enforced at the storage boundary.
pub fn generate_transfer_number(now: DateTime<Utc>) -> String {
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("SIT-{}-{}", now.format("%Y%m%d%H%M%S"), suffix)
}

/// Document priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::Urgent),
            _ => None,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" | "" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// How an item is tracked by the inventory authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum Tracking {
    /// One unit per serial number, quantity always 1
    #[default]
    Serial = 1,
    /// One unit per batch, carrying the moved quantity
    Batch = 2,
}

impl Tracking {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(Tracking::Serial),
            2 => Some(Tracking::Batch),
            _ => None,
        }
    }
}

/// Validation outcome of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum UnitOutcome {
    Unvalidated = 0,
    Valid = 1,
    Invalid = 2,
    Duplicate = 3,
}

impl UnitOutcome {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(UnitOutcome::Unvalidated),
            1 => Some(UnitOutcome::Valid),
            2 => Some(UnitOutcome::Invalid),
            3 => Some(UnitOutcome::Duplicate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitOutcome::Unvalidated => "unvalidated",
            UnitOutcome::Valid => "valid",
            UnitOutcome::Invalid => "invalid",
            UnitOutcome::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Optional lot dates returned by the authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnitDates {
    pub manufacture: Option<NaiveDate>,
    pub expiry: Option<NaiveDate>,
    pub admission: Option<NaiveDate>,
}

/// Transfer document header with its lines
#[derive(Debug, Clone, Serialize)]
pub struct TransferDocument {
    pub id: DocumentId,
    pub transfer_number: String,
    pub created_by: UserId,
    pub source_warehouse: String,
    pub destination_warehouse: String,
    pub priority: Priority,
    pub notes: String,
    pub state: DocumentState,
    /// ERP document number, set when posted
    pub external_reference: Option<String>,
    pub qc_approver: Option<UserId>,
    pub qc_at: Option<DateTime<Utc>>,
    pub qc_notes: Option<String>,
    /// Posting calls that ended with an unknown outcome
    pub posting_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lines: Vec<TransferLine>,
}

impl TransferDocument {
    pub fn new(created_by: UserId, request: &NewDocument) -> Self {
        let now = Utc::now();
        Self {
            id: DocumentId::new(),
            transfer_number: generate_transfer_number(now),
            created_by,
            source_warehouse: request.source_warehouse.trim().to_string(),
            destination_warehouse: request.destination_warehouse.trim().to_string(),
            priority: request.priority,
            notes: request.notes.clone(),
            state: DocumentState::Draft,
            external_reference: None,
            qc_approver: None,
            qc_at: None,
            qc_notes: None,
            posting_attempts: 0,
            created_at: now,
            updated_at: now,
            lines: Vec::new(),
        }
    }

    pub fn line(&self, line_id: LineId) -> Option<&TransferLine> {
        self.lines.iter().find(|l| l.id == line_id)
    }

    pub fn line_for_item(&self, item_code: &str) -> Option<&TransferLine> {
        self.lines.iter().find(|l| l.item_code == item_code)
    }

    /// Locate a unit and its line
    pub fn unit(&self, unit_id: UnitId) -> Option<(&TransferLine, &TransferUnit)> {
        self.lines
            .iter()
            .find_map(|l| l.units.iter().find(|u| u.id == unit_id).map(|u| (l, u)))
    }
}

/// One item-level entry of a document
#[derive(Debug, Clone, Serialize)]
pub struct TransferLine {
    pub id: LineId,
    pub document_id: DocumentId,
    pub item_code: String,
    pub item_description: String,
    pub expected_quantity: u32,
    pub unit_of_measure: String,
    pub tracking: Tracking,
    pub qc_status: QcStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub units: Vec<TransferUnit>,
}

impl TransferLine {
    pub fn new(document_id: DocumentId, spec: &AddLineUnits) -> Self {
        let now = Utc::now();
        Self {
            id: LineId::new(),
            document_id,
            item_code: spec.item_code.trim().to_string(),
            item_description: spec.item_description.clone().unwrap_or_default(),
            expected_quantity: spec.expected_quantity,
            unit_of_measure: spec
                .unit_of_measure
                .clone()
                .unwrap_or_else(|| "EA".to_string()),
            tracking: spec.tracking,
            qc_status: QcStatus::Pending,
            created_at: now,
            updated_at: now,
            units: Vec::new(),
        }
    }

    /// Quantity carried by valid units (serial units count 1)
    pub fn valid_quantity(&self) -> u32 {
        self.units
            .iter()
            .filter(|u| u.outcome == UnitOutcome::Valid)
            .fold(0u32, |total, u| total.saturating_add(u.quantity))
    }

    pub fn unvalidated_count(&self) -> usize {
        self.units
            .iter()
            .filter(|u| u.outcome == UnitOutcome::Unvalidated)
            .count()
    }

    pub fn count(&self, outcome: UnitOutcome) -> usize {
        self.units.iter().filter(|u| u.outcome == outcome).count()
    }

    pub fn reconciliation(&self) -> Reconciliation {
        reconcile(self.valid_quantity(), self.expected_quantity)
    }

    /// Ready for document submission
    pub fn is_ready(&self) -> bool {
        self.reconciliation().is_complete() && self.unvalidated_count() == 0
    }

    pub fn valid_units(&self) -> impl Iterator<Item = &TransferUnit> {
        self.units.iter().filter(|u| u.outcome == UnitOutcome::Valid)
    }

    /// Non-duplicate units keyed by the identifier they claim on this line
    pub fn claimed_identifiers(&self) -> HashMap<&str, &TransferUnit> {
        let mut claimed = HashMap::new();
        for unit in self.units.iter().filter(|u| u.outcome != UnitOutcome::Duplicate) {
            claimed.insert(unit.identifier.as_str(), unit);
            if let Some(canonical) = unit.canonical_identifier.as_deref() {
                claimed.insert(canonical, unit);
            }
        }
        claimed
    }
}

/// One serial number, or one batch/quantity pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferUnit {
    pub id: UnitId,
    pub line_id: LineId,
    /// Identifier as entered (trimmed)
    pub identifier: String,
    /// Identifier as known to the authority
    pub canonical_identifier: Option<String>,
    pub quantity: u32,
    pub outcome: UnitOutcome,
    pub reason: Option<String>,
    pub qc_status: QcStatus,
    pub dates: UnitDates,
    pub validated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferUnit {
    pub fn new(line_id: LineId, identifier: &str, quantity: u32) -> Self {
        let now = Utc::now();
        Self {
            id: UnitId::new(),
            line_id,
            identifier: identifier.to_string(),
            canonical_identifier: None,
            quantity,
            outcome: UnitOutcome::Unvalidated,
            reason: None,
            qc_status: QcStatus::Pending,
            dates: UnitDates::default(),
            validated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Identifier sent to the ERP when posting
    pub fn posting_identifier(&self) -> &str {
        self.canonical_identifier
            .as_deref()
            .unwrap_or(&self.identifier)
    }
}

// ============================================================================
// Operation inputs and outputs
// ============================================================================

/// Input of `create_document`
#[derive(Debug, Clone, Deserialize)]
pub struct NewDocument {
    pub source_warehouse: String,
    pub destination_warehouse: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub notes: String,
}

impl NewDocument {
    pub fn new(source_warehouse: &str, destination_warehouse: &str) -> Self {
        Self {
            source_warehouse: source_warehouse.to_string(),
            destination_warehouse: destination_warehouse.to_string(),
            priority: Priority::Normal,
            notes: String::new(),
        }
    }
}

/// One submitted identifier
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnitEntry {
    pub identifier: String,
    /// Batch quantity; serial entries always carry 1
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

impl UnitEntry {
    pub fn serial(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            quantity: 1,
        }
    }

    pub fn batch(identifier: &str, quantity: u32) -> Self {
        Self {
            identifier: identifier.to_string(),
            quantity,
        }
    }
}

/// Input of `add_line_units`
#[derive(Debug, Clone, Deserialize)]
pub struct AddLineUnits {
    pub item_code: String,
    pub expected_quantity: u32,
    #[serde(default)]
    pub tracking: Tracking,
    #[serde(default)]
    pub item_description: Option<String>,
    #[serde(default)]
    pub unit_of_measure: Option<String>,
    pub entries: Vec<UnitEntry>,
    /// Re-check identifiers already stored as valid or invalid
    #[serde(default)]
    pub revalidate: bool,
}

impl AddLineUnits {
    /// Serial-tracked submission from raw identifiers
    pub fn serials<S: AsRef<str>>(item_code: &str, expected_quantity: u32, raw: &[S]) -> Self {
        Self {
            item_code: item_code.to_string(),
            expected_quantity,
            tracking: Tracking::Serial,
            item_description: None,
            unit_of_measure: None,
            entries: raw.iter().map(|s| UnitEntry::serial(s.as_ref())).collect(),
            revalidate: false,
        }
    }

    pub fn with_revalidate(mut self) -> Self {
        self.revalidate = true;
        self
    }
}

/// Result of `add_line_units`
#[derive(Debug, Clone, Serialize)]
pub struct AddUnitsReport {
    pub document_id: DocumentId,
    pub line_id: LineId,
    /// Units of this call confirmed valid
    pub valid_count: usize,
    pub invalid_count: usize,
    pub duplicate_count: usize,
    /// Entries matching units already valid on the line (no-op)
    pub already_valid: usize,
    /// Blank entries dropped
    pub skipped: usize,
    /// Valid quantity on the line after this call
    pub line_valid_quantity: u32,
    pub expected_quantity: u32,
    pub reconciliation: Reconciliation,
    /// Identifiers marked duplicate by this call
    pub duplicates: Vec<String>,
    pub message: String,
}

impl AddUnitsReport {
    /// The call's valid units were not committed because of excess
    pub fn is_rejected(&self) -> bool {
        matches!(self.reconciliation, Reconciliation::Excess { .. })
    }
}

/// Result of `approve_document`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    /// Posted; carries the ERP document number
    Posted { reference: String },
    /// Approved but the ERP outcome is unknown; the recovery worker resolves it
    PostingPending { error: String },
}
