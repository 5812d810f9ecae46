//! Quantity reconciliation
//!
//! Compares the validated quantity of a line with the operator's declared
//! quantity. Excess is never truncated; the operator is told how many
//! identifiers to remove.

use std::fmt;

use serde::Serialize;

/// Reconciliation outcome of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reconciliation {
    /// Valid quantity matches the expected quantity
    Complete,
    /// More valid units are needed
    Short { missing: u32 },
    /// Too many valid units were submitted
    Excess { remove: u32 },
}

impl Reconciliation {
    #[inline]
    pub fn is_complete(&self) -> bool {
        matches!(self, Reconciliation::Complete)
    }
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reconciliation::Complete => write!(f, "complete"),
            Reconciliation::Short { missing } => {
                write!(f, "incomplete, needs {} more valid unit(s)", missing)
            }
            Reconciliation::Excess { remove } => {
                write!(f, "excess, remove {} identifier(s)", remove)
            }
        }
    }
}

pub fn reconcile(valid_quantity: u32, expected_quantity: u32) -> Reconciliation {
    match valid_quantity.cmp(&expected_quantity) {
        std::cmp::Ordering::Equal => Reconciliation::Complete,
        std::cmp::Ordering::Less => Reconciliation::Short {
            missing: expected_quantity - valid_quantity,
        },
        std::cmp::Ordering::Greater => Reconciliation::Excess {
            remove: valid_quantity - expected_quantity,
        },
    }
}
