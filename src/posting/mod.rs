//! Posting Adapter
//!
//! Hands a QC-approved document to the ERP as one stock transfer.
//!
//! Only the adapter knows whether a failure means "the ERP said no" or "we
//! never heard back". The coordinator demotes the document on the first and
//! leaves the second to the recovery worker, which probes with `lookup`
//! before re-posting.

pub mod service_layer;

pub use service_layer::ServiceLayerPosting;

use async_trait::async_trait;
use thiserror::Error;

use crate::transfer::types::TransferDocument;

/// Result of one posting attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostingOutcome {
    /// ERP accepted; carries the ERP document number
    Posted { reference: String },
    /// ERP refused the document; nothing was posted
    Rejected { error: String },
    /// No reliable answer; the document may or may not exist in the ERP
    Unknown { error: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PostingError {
    #[error("ERP unreachable: {0}")]
    Transport(String),

    #[error("malformed ERP response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait PostingAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn post(&self, document: &TransferDocument) -> PostingOutcome;

    /// Find an ERP document already created for `transfer_number`
    async fn lookup(&self, transfer_number: &str) -> Result<Option<String>, PostingError>;
}


#[cfg(test)]
pub use mock::MockPosting;
