//! WMS Transfer - Serial/Batch Stock Transfer Engine
//!
//! Validates serial and batch numbers against the ERP, reconciles them with
//! the declared quantity, and drives transfer documents through QC approval
//! into ERP posting.
//!
//! # Modules
//!
//! - [`core_types`] - Actor and role types
//! - [`authority`] - Inventory authority trait and Service Layer client
//! - [`validation`] - Chunked, checkpointed batch validation and reconciliation
//! - [`transfer`] - Documents, state machine, store, coordinator, recovery worker
//! - [`posting`] - Posting adapter trait and Service Layer stock transfers
//! - [`erp`] - Service Layer session and HTTP plumbing
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup

// Core types - must be first!
pub mod core_types;

pub mod authority;
pub mod config;
pub mod erp;
pub mod logging;
pub mod posting;
pub mod transfer;
pub mod validation;

// Convenient re-exports at crate root
pub use authority::{AuthorityError, AuthorityVerdict, InventoryAuthority, UnitQuery};
pub use core_types::{Actor, Role, UserId};
pub use posting::{PostingAdapter, PostingOutcome};
pub use transfer::{
    DocumentState, PostingRecoveryWorker, TransferCoordinator, TransferError, TransferStore,
};
pub use validation::{BatchValidator, Reconciliation};
