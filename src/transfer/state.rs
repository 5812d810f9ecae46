//! Transfer Document State Definitions
//!
//! State IDs are stored as SMALLINT. The transition table below is the only
//! place that decides which `(state, action, role)` combinations are legal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core_types::Role;

/// Transfer document lifecycle states
///
/// Terminal: POSTED (30). REJECTED (-10) is re-openable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum DocumentState {
    /// Being edited by the submitter
    Draft = 0,

    /// Waiting for QC decision
    Submitted = 10,

    /// Approved by QC, posting to the ERP in progress
    QcApproved = 20,

    /// Terminal: accepted by the ERP, external reference recorded
    Posted = 30,

    /// Rejected by QC or by the ERP, may be reopened
    Rejected = -10,
}

impl DocumentState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentState::Posted)
    }

    /// Only drafts accept line and unit edits
    #[inline]
    pub fn is_editable(&self) -> bool {
        matches!(self, DocumentState::Draft)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(DocumentState::Draft),
            10 => Some(DocumentState::Submitted),
            20 => Some(DocumentState::QcApproved),
            30 => Some(DocumentState::Posted),
            -10 => Some(DocumentState::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentState::Draft => "draft",
            DocumentState::Submitted => "submitted",
            DocumentState::QcApproved => "qc_approved",
            DocumentState::Posted => "posted",
            DocumentState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for DocumentState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        DocumentState::from_id(value).ok_or(())
    }
}

/// Actions that move a document between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentAction {
    Submit,
    Approve,
    Reject,
    Reopen,
    PostingSucceeded,
    PostingFailed,
}

impl DocumentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentAction::Submit => "submit",
            DocumentAction::Approve => "approve",
            DocumentAction::Reject => "reject",
            DocumentAction::Reopen => "reopen",
            DocumentAction::PostingSucceeded => "posting_succeeded",
            DocumentAction::PostingFailed => "posting_failed",
        }
    }
}

impl fmt::Display for DocumentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the transition table
struct Transition {
    from: DocumentState,
    action: DocumentAction,
    roles: &'static [Role],
    to: DocumentState,
}

const TRANSITIONS: &[Transition] = &[
    Transition {
        from: DocumentState::Draft,
        action: DocumentAction::Submit,
        roles: &[Role::Submitter, Role::Admin],
        to: DocumentState::Submitted,
    },
    Transition {
        from: DocumentState::Submitted,
        action: DocumentAction::Approve,
        roles: &[Role::QcApprover, Role::Admin],
        to: DocumentState::QcApproved,
    },
    Transition {
        from: DocumentState::Submitted,
        action: DocumentAction::Reject,
        roles: &[Role::QcApprover, Role::Admin],
        to: DocumentState::Rejected,
    },
    Transition {
        from: DocumentState::Rejected,
        action: DocumentAction::Reopen,
        roles: &[Role::Submitter, Role::Admin],
        to: DocumentState::Draft,
    },
    Transition {
        from: DocumentState::QcApproved,
        action: DocumentAction::PostingSucceeded,
        roles: &[Role::System],
        to: DocumentState::Posted,
    },
    Transition {
        from: DocumentState::QcApproved,
        action: DocumentAction::PostingFailed,
        roles: &[Role::System],
        to: DocumentState::Rejected,
    },
];

/// Why a transition lookup was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionDenied {
    /// No row for `(state, action)`
    IllegalFromState,
    /// Row exists but the role is not listed
    RoleNotAllowed,
}

/// Resolve the next state for `(state, action, role)`
pub fn next_state(
    state: DocumentState,
    action: DocumentAction,
    role: Role,
) -> Result<DocumentState, TransitionDenied> {
    let row = TRANSITIONS
        .iter()
        .find(|t| t.from == state && t.action == action)
        .ok_or(TransitionDenied::IllegalFromState)?;

    if row.roles.contains(&role) {
        Ok(row.to)
    } else {
        Err(TransitionDenied::RoleNotAllowed)
    }
}

/// Roles allowed to trigger an action, whatever the source state
pub fn roles_for(action: DocumentAction) -> &'static [Role] {
    TRANSITIONS
        .iter()
        .find(|t| t.action == action)
        .map(|t| t.roles)
        .unwrap_or(&[])
}

/// QC sub-status of a line or unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum QcStatus {
    Pending = 0,
    Approved = 1,
    Rejected = 2,
}

impl QcStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(QcStatus::Pending),
            1 => Some(QcStatus::Approved),
            2 => Some(QcStatus::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QcStatus::Pending => "pending",
            QcStatus::Approved => "approved",
            QcStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for QcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
