//! Core types used throughout the system
//!
//! Identity is supplied by the surrounding application. This crate never
//! authenticates; it only authorizes transitions against the role it is given.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// User ID as issued by the identity/session layer.
pub type UserId = i64;

/// Role of the acting user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Warehouse operator that creates and submits documents
    Submitter,
    /// Quality control approver
    QcApprover,
    /// May act as submitter or QC on any document
    Admin,
    /// Internal actor for posting results and recovery
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Submitter => "submitter",
            Role::QcApprover => "qc-approver",
            Role::Admin => "admin",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "submitter" | "user" | "operator" => Ok(Role::Submitter),
            "qc-approver" | "qc" | "qc_approver" => Ok(Role::QcApprover),
            "admin" | "manager" => Ok(Role::Admin),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// The acting user for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn submitter(user_id: UserId) -> Self {
        Self::new(user_id, Role::Submitter)
    }

    pub fn qc(user_id: UserId) -> Self {
        Self::new(user_id, Role::QcApprover)
    }

    pub fn admin(user_id: UserId) -> Self {
        Self::new(user_id, Role::Admin)
    }

    /// Actor used for posting adapter results (user id 0 is never issued)
    pub fn system() -> Self {
        Self::new(0, Role::System)
    }
}
