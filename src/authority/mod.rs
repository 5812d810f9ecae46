//! Inventory Authority Client
//!
//! Adapters that ask the system of record whether a serial or batch number
//! exists, belongs to the item, and is physically available in the source
//! warehouse.
//!
//! A positive verdict requires all three checks. A unit that exists for the
//! item but sits elsewhere is a soft rejection (the unit becomes `invalid`),
//! never an error. Errors are reserved for transport trouble and are always
//! retryable.

pub mod service_layer;

pub use service_layer::ServiceLayerAuthority;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::transfer::types::{Tracking, UnitDates};

/// One identifier to check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitQuery {
    pub identifier: String,
    pub item_code: String,
    pub source_warehouse: String,
    pub tracking: Tracking,
    /// Requested batch quantity (1 for serials)
    pub quantity: u32,
}

/// Raw answer of the authority for one identifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorityVerdict {
    pub exists: bool,
    pub item_matches: bool,
    pub available_in_source: bool,
    /// Identifier as stored in the system of record
    pub canonical_identifier: Option<String>,
    /// Item the identifier actually belongs to, when it exists
    pub actual_item: Option<String>,
    /// Warehouse currently holding the unit, when known
    pub located_in: Option<String>,
    /// Batch stock in the source warehouse
    pub available_quantity: Option<u32>,
    pub item_description: Option<String>,
    pub dates: UnitDates,
}

impl AuthorityVerdict {
    pub fn not_found() -> Self {
        Self::default()
    }

    /// Apply the business rules to this verdict
    pub fn judge(&self, query: &UnitQuery) -> Result<ConfirmedUnit, RejectReason> {
        if !self.exists {
            return Err(RejectReason::NotFound);
        }
        if !self.item_matches {
            return Err(RejectReason::WrongItem {
                actual: self.actual_item.clone(),
            });
        }
        if !self.available_in_source {
            return Err(RejectReason::NotInSourceWarehouse {
                warehouse: query.source_warehouse.clone(),
                located_in: self.located_in.clone(),
            });
        }
        if query.tracking == Tracking::Batch {
            let available = self.available_quantity.unwrap_or(0);
            if available < query.quantity {
                return Err(RejectReason::InsufficientBatchQuantity {
                    available,
                    requested: query.quantity,
                });
            }
        }

        Ok(ConfirmedUnit {
            canonical_identifier: self
                .canonical_identifier
                .clone()
                .unwrap_or_else(|| query.identifier.clone()),
            item_description: self.item_description.clone(),
            dates: self.dates,
        })
    }
}

/// A unit the authority confirmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedUnit {
    pub canonical_identifier: String,
    pub item_description: Option<String>,
    pub dates: UnitDates,
}

/// Business-rule rejection (never retried automatically)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NotFound,
    WrongItem {
        actual: Option<String>,
    },
    NotInSourceWarehouse {
        warehouse: String,
        located_in: Option<String>,
    },
    InsufficientBatchQuantity {
        available: u32,
        requested: u32,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotFound => write!(f, "not found in inventory system"),
            RejectReason::WrongItem { actual: Some(item) } => {
                write!(f, "belongs to item {}", item)
            }
            RejectReason::WrongItem { actual: None } => {
                write!(f, "does not belong to this item")
            }
            RejectReason::NotInSourceWarehouse {
                warehouse,
                located_in: Some(other),
            } => write!(f, "not available in warehouse {} (located in {})", warehouse, other),
            RejectReason::NotInSourceWarehouse {
                warehouse,
                located_in: None,
            } => write!(f, "not available in warehouse {}", warehouse),
            RejectReason::InsufficientBatchQuantity {
                available,
                requested,
            } => write!(
                f,
                "only {} available in source warehouse, {} requested",
                available, requested
            ),
        }
    }
}

/// Transport-level failure talking to the authority
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorityError {
    /// Unreachable, timed out, throttled or 5xx
    #[error("authority unavailable: {0}")]
    Transient(String),

    /// Response could not be understood
    #[error("malformed authority response: {0}")]
    Malformed(String),
}

/// Classified result of validating one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    /// Business rule said no
    Rejected(RejectReason),
    /// Authority could not answer
    Transient(AuthorityError),
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationFailure::Rejected(reason) => write!(f, "{}", reason),
            ValidationFailure::Transient(e) => write!(f, "validation error: {}", e),
        }
    }
}

/// Inventory authority trait
///
/// Implementations carry their own configuration; nothing is shared through
/// process-wide state.
#[async_trait]
pub trait InventoryAuthority: Send + Sync {
    /// Get authority name for logging
    fn name(&self) -> &'static str;

    /// Validate one identifier
    async fn validate(&self, query: &UnitQuery) -> Result<AuthorityVerdict, AuthorityError>;

    /// Whether `validate_bulk` answers a whole chunk in one round trip
    fn supports_bulk(&self) -> bool {
        false
    }

    /// Validate many identifiers at once, one verdict per query in order
    async fn validate_bulk(
        &self,
        queries: &[UnitQuery],
    ) -> Result<Vec<AuthorityVerdict>, AuthorityError> {
        let mut verdicts = Vec::with_capacity(queries.len());
        for query in queries {
            verdicts.push(self.validate(query).await?);
        }
        Ok(verdicts)
    }
}


#[cfg(test)]
pub use mock::MockAuthority;
