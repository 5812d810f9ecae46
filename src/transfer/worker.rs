//! Posting Recovery Worker
//!
//! Background worker that resolves documents left in `qc_approved` after a
//! posting call with an unknown outcome, and purges expired checkpoints.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::coordinator::TransferCoordinator;
use super::error::TransferError;
use super::state::DocumentState;

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan for stuck documents
    pub scan_interval: Duration,
    /// How long a document must sit in `qc_approved` to be picked up
    pub stale_threshold: Duration,
    /// Unknown posting outcomes tolerated before demotion to `rejected`
    pub max_posting_attempts: u32,
    /// Maximum documents to process per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            max_posting_attempts: 5,
            batch_size: 100,
        }
    }
}

/// Result of one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub scanned: usize,
    pub posted: usize,
    pub demoted: usize,
    pub pending: usize,
    pub purged_checkpoints: u64,
}

pub struct PostingRecoveryWorker {
    coordinator: Arc<TransferCoordinator>,
    config: WorkerConfig,
    /// Checkpoint entries older than this are purged
    checkpoint_ttl: Duration,
}

impl PostingRecoveryWorker {
    pub fn new(
        coordinator: Arc<TransferCoordinator>,
        config: WorkerConfig,
        checkpoint_ttl: Duration,
    ) -> Self {
        Self {
            coordinator,
            config,
            checkpoint_ttl,
        }
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            max_posting_attempts = self.config.max_posting_attempts,
            "Starting posting recovery worker"
        );

        loop {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.scan_interval) => {}
            }
        }

        info!("Posting recovery worker stopped");
    }

    /// Run a single scan and recovery cycle
    pub async fn scan_and_recover(&self) -> Result<ScanSummary, TransferError> {
        let mut summary = ScanSummary::default();
        let store = self.coordinator.store();

        let ttl = TimeDelta::from_std(self.checkpoint_ttl).unwrap_or(TimeDelta::MAX);
        if let Some(before) = Utc::now().checked_sub_signed(ttl) {
            summary.purged_checkpoints = store.purge_checkpoints(before).await?;
            if summary.purged_checkpoints > 0 {
                debug!(count = summary.purged_checkpoints, "Purged expired checkpoint entries");
            }
        }

        let stale = store
            .find_stale_approved(self.config.stale_threshold, self.config.batch_size)
            .await?;
        if stale.is_empty() {
            debug!("No documents awaiting posting");
            return Ok(summary);
        }

        info!(count = stale.len(), "Found documents awaiting posting");

        for document in &stale {
            summary.scanned += 1;
            debug!(
                document_id = %document.id,
                transfer_number = %document.transfer_number,
                attempts = document.posting_attempts,
                "Recovering posting"
            );

            match self
                .coordinator
                .recover_posting(document.id, self.config.max_posting_attempts)
                .await
            {
                Ok(Some(DocumentState::Posted)) => summary.posted += 1,
                Ok(Some(DocumentState::Rejected)) => {
                    warn!(
                        document_id = %document.id,
                        transfer_number = %document.transfer_number,
                        "Posting never resolved, document demoted"
                    );
                    summary.demoted += 1;
                }
                Ok(Some(_)) => summary.pending += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(
                        document_id = %document.id,
                        error = %e,
                        "Failed to recover posting"
                    );
                }
            }
        }

        info!(
            posted = summary.posted,
            demoted = summary.demoted,
            pending = summary.pending,
            "Recovery scan finished"
        );
        Ok(summary)
    }
}
