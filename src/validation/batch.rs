//! Batch Validator
//!
//! Validates the identifiers of one submission against the inventory
//! authority:
//!
//! 1. trim, drop blanks
//! 2. duplicate pre-pass (no authority calls for duplicates)
//! 3. reuse fresh checkpoint entries
//! 4. adaptive chunking, bounded concurrency inside a chunk
//! 5. checkpoint after each chunk, sub-chunk retry for transient failures
//! 6. canonical-identifier duplicate detection
//!
//! No entry leaves the validator unresolved: an identifier the authority
//! never answered for becomes `invalid` with a `validation error` reason.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunking::{ChunkingPolicy, RetryPolicy};
use crate::authority::{
    AuthorityError, AuthorityVerdict, ConfirmedUnit, InventoryAuthority, UnitQuery,
    ValidationFailure,
};
use crate::transfer::error::TransferError;
use crate::transfer::store::TransferStore;
use crate::transfer::types::{
    DocumentId, Tracking, TransferUnit, UnitDates, UnitEntry, UnitId, UnitOutcome,
};

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub chunking: ChunkingPolicy,
    pub retry: RetryPolicy,
    /// Concurrent authority calls within one chunk
    pub concurrency: usize,
    /// Deadline for one authority call
    pub call_timeout: Duration,
    /// How long a checkpoint entry may be reused
    pub checkpoint_ttl: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingPolicy::default(),
            retry: RetryPolicy::default(),
            concurrency: 8,
            call_timeout: Duration::from_secs(10),
            checkpoint_ttl: Duration::from_secs(900),
        }
    }
}

/// Checkpoint journal key; the line may not exist yet
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub document_id: DocumentId,
    pub item_code: String,
}

/// One validated identifier recorded in the checkpoint journal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointEntry {
    pub identifier: String,
    pub quantity: u32,
    /// `valid` or `invalid`
    pub outcome: UnitOutcome,
    pub canonical_identifier: Option<String>,
    pub item_description: Option<String>,
    pub reason: Option<String>,
    pub dates: UnitDates,
    /// The authority never answered; not reusable
    pub transient: bool,
    pub recorded_at: DateTime<Utc>,
}

impl CheckpointEntry {
    fn new(query: &UnitQuery, resolution: &Resolution, transient: bool) -> Self {
        let mut entry = Self {
            identifier: query.identifier.clone(),
            quantity: query.quantity,
            outcome: UnitOutcome::Invalid,
            canonical_identifier: None,
            item_description: None,
            reason: None,
            dates: UnitDates::default(),
            transient,
            recorded_at: Utc::now(),
        };
        match resolution {
            Resolution::Valid(confirmed) => {
                entry.outcome = UnitOutcome::Valid;
                entry.canonical_identifier = Some(confirmed.canonical_identifier.clone());
                entry.item_description = confirmed.item_description.clone();
                entry.dates = confirmed.dates;
            }
            Resolution::Invalid { reason } | Resolution::Duplicate { reason } => {
                entry.reason = Some(reason.clone());
            }
            Resolution::AlreadyValid(_) => {}
        }
        entry
    }

    fn reusable(&self, quantity: u32, since: DateTime<Utc>) -> bool {
        !self.transient
            && self.quantity == quantity
            && self.recorded_at >= since
            && matches!(self.outcome, UnitOutcome::Valid | UnitOutcome::Invalid)
    }

    fn resolution(&self) -> Resolution {
        match self.outcome {
            UnitOutcome::Valid => Resolution::Valid(ConfirmedUnit {
                canonical_identifier: self
                    .canonical_identifier
                    .clone()
                    .unwrap_or_else(|| self.identifier.clone()),
                item_description: self.item_description.clone(),
                dates: self.dates,
            }),
            _ => Resolution::Invalid {
                reason: self.reason.clone().unwrap_or_default(),
            },
        }
    }
}

/// Final decision for one submitted identifier
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Matches a unit already valid on the line; nothing to do
    AlreadyValid(UnitId),
    Duplicate { reason: String },
    Valid(ConfirmedUnit),
    Invalid { reason: String },
}

impl Resolution {
    pub fn outcome(&self) -> UnitOutcome {
        match self {
            Resolution::AlreadyValid(_) | Resolution::Valid(_) => UnitOutcome::Valid,
            Resolution::Duplicate { .. } => UnitOutcome::Duplicate,
            Resolution::Invalid { .. } => UnitOutcome::Invalid,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryResult {
    pub identifier: String,
    pub quantity: u32,
    /// Stored unit being re-validated in place
    pub target: Option<UnitId>,
    pub resolution: Resolution,
}

/// Outcome of one validation run, entries in submission order
#[derive(Debug, Clone, Default)]
pub struct ValidationRun {
    pub entries: Vec<EntryResult>,
    pub skipped: usize,
    /// Entries answered from the checkpoint journal
    pub reused: usize,
    /// Identifiers sent to the authority, retries included
    pub authority_calls: usize,
    pub chunks: usize,
}

impl ValidationRun {
    fn count(&self, f: impl Fn(&Resolution) -> bool) -> usize {
        self.entries.iter().filter(|e| f(&e.resolution)).count()
    }

    pub fn valid_count(&self) -> usize {
        self.count(|r| matches!(r, Resolution::Valid(_)))
    }

    pub fn invalid_count(&self) -> usize {
        self.count(|r| matches!(r, Resolution::Invalid { .. }))
    }

    pub fn duplicate_count(&self) -> usize {
        self.count(|r| matches!(r, Resolution::Duplicate { .. }))
    }

    pub fn already_valid(&self) -> usize {
        self.count(|r| matches!(r, Resolution::AlreadyValid(_)))
    }
}

/// Input of one validation run
pub struct ValidationRequest<'a> {
    pub key: &'a CheckpointKey,
    pub source_warehouse: &'a str,
    pub tracking: Tracking,
    pub entries: &'a [UnitEntry],
    /// Units already stored on the line
    pub stored: &'a [TransferUnit],
    pub revalidate: bool,
}

/// Claim on an identifier during duplicate detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Stored(UnitId),
    Entry(usize),
}

type Answer = Result<AuthorityVerdict, AuthorityError>;

fn timeout_error(after: Duration) -> AuthorityError {
    AuthorityError::Transient(format!("timed out after {}ms", after.as_millis()))
}

fn resolve(query: &UnitQuery, answer: &Answer) -> Resolution {
    match answer {
        Ok(verdict) => match verdict.judge(query) {
            Ok(confirmed) => Resolution::Valid(confirmed),
            Err(reason) => Resolution::Invalid {
                reason: ValidationFailure::Rejected(reason).to_string(),
            },
        },
        Err(e) => Resolution::Invalid {
            reason: ValidationFailure::Transient(e.clone()).to_string(),
        },
    }
}

pub struct BatchValidator {
    authority: Arc<dyn InventoryAuthority>,
    config: ValidatorConfig,
}

impl BatchValidator {
    pub fn new(authority: Arc<dyn InventoryAuthority>, config: ValidatorConfig) -> Self {
        Self { authority, config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub async fn validate(
        &self,
        store: &dyn TransferStore,
        request: ValidationRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ValidationRun, TransferError> {
        let key = request.key;
        let mut run = ValidationRun::default();

        // Normalize
        let mut normalized: Vec<(String, u32)> = Vec::with_capacity(request.entries.len());
        for entry in request.entries {
            let identifier = entry.identifier.trim();
            if identifier.is_empty() {
                run.skipped += 1;
                continue;
            }
            let quantity = match request.tracking {
                Tracking::Serial => 1,
                Tracking::Batch => entry.quantity,
            };
            normalized.push((identifier.to_string(), quantity));
        }

        // Duplicate pre-pass
        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        for (identifier, _) in &normalized {
            *occurrences.entry(identifier.as_str()).or_default() += 1;
        }

        let mut claimed: HashMap<&str, &TransferUnit> = HashMap::new();
        let mut duplicate_rows: HashSet<&str> = HashSet::new();
        for unit in request.stored {
            if unit.outcome == UnitOutcome::Duplicate {
                duplicate_rows.insert(unit.identifier.as_str());
                continue;
            }
            claimed.insert(unit.identifier.as_str(), unit);
            if let Some(canonical) = unit.canonical_identifier.as_deref() {
                claimed.insert(canonical, unit);
            }
        }

        let mut slots: Vec<Option<Resolution>> = vec![None; normalized.len()];
        let mut targets: Vec<Option<UnitId>> = vec![None; normalized.len()];
        let mut pending: Vec<usize> = Vec::new();
        let mut targeted: HashSet<UnitId> = HashSet::new();

        for (slot, (identifier, quantity)) in normalized.iter().enumerate() {
            let seen = occurrences[identifier.as_str()];
            if seen > 1 {
                slots[slot] = Some(Resolution::Duplicate {
                    reason: format!("appears {} times in this submission", seen),
                });
                continue;
            }
            if request.tracking == Tracking::Batch && *quantity == 0 {
                slots[slot] = Some(Resolution::Invalid {
                    reason: "batch quantity must be at least 1".to_string(),
                });
                continue;
            }

            if let Some(unit) = claimed.get(identifier.as_str()) {
                match (unit.outcome, request.revalidate) {
                    (UnitOutcome::Valid, false) => {
                        slots[slot] = Some(Resolution::AlreadyValid(unit.id));
                        targets[slot] = Some(unit.id);
                    }
                    (UnitOutcome::Invalid, false) => {
                        slots[slot] = Some(Resolution::Duplicate {
                            reason: format!(
                                "already recorded as invalid: {}",
                                unit.reason.as_deref().unwrap_or("no reason")
                            ),
                        });
                    }
                    _ if !targeted.insert(unit.id) => {
                        slots[slot] = Some(Resolution::Duplicate {
                            reason: format!("same unit as {}", unit.identifier),
                        });
                    }
                    _ => {
                        targets[slot] = Some(unit.id);
                        pending.push(slot);
                    }
                }
            } else if duplicate_rows.contains(identifier.as_str()) {
                slots[slot] = Some(Resolution::Duplicate {
                    reason: "already recorded as duplicate".to_string(),
                });
            } else {
                pending.push(slot);
            }
        }

        // Checkpoint reuse
        if !request.revalidate && !pending.is_empty() {
            let ttl = TimeDelta::from_std(self.config.checkpoint_ttl).unwrap_or(TimeDelta::MAX);
            let since = Utc::now()
                .checked_sub_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let journal = store.load_checkpoint(key, since).await?;
            let by_identifier: HashMap<&str, &CheckpointEntry> = journal
                .iter()
                .map(|e| (e.identifier.as_str(), e))
                .collect();

            pending.retain(|&slot| {
                let (identifier, quantity) = &normalized[slot];
                match by_identifier.get(identifier.as_str()) {
                    Some(entry) if entry.reusable(*quantity, since) => {
                        slots[slot] = Some(entry.resolution());
                        run.reused += 1;
                        false
                    }
                    _ => true,
                }
            });
        }

        let queries: Vec<UnitQuery> = pending
            .iter()
            .map(|&slot| {
                let (identifier, quantity) = &normalized[slot];
                UnitQuery {
                    identifier: identifier.clone(),
                    item_code: key.item_code.clone(),
                    source_warehouse: request.source_warehouse.to_string(),
                    tracking: request.tracking,
                    quantity: *quantity,
                }
            })
            .collect();

        let ranges = self.config.chunking.ranges(queries.len());
        run.chunks = ranges.len();
        let mut checkpointed = 0usize;

        if !queries.is_empty() {
            info!(
                document_id = %key.document_id,
                item_code = %key.item_code,
                authority = self.authority.name(),
                total = queries.len(),
                reused = run.reused,
                chunk_size = self.config.chunking.chunk_size(queries.len()),
                chunks = ranges.len(),
                "Starting batch validation"
            );
        }

        for (chunk_index, range) in ranges.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled { checkpointed });
            }

            let chunk = &queries[range.clone()];
            let mut answers = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled { checkpointed }),
                answers = self.run_chunk(chunk) => answers,
            };
            run.authority_calls += chunk.len();

            let resolved: Vec<CheckpointEntry> = chunk
                .iter()
                .zip(&answers)
                .filter(|(_, answer)| answer.is_ok())
                .map(|(query, answer)| CheckpointEntry::new(query, &resolve(query, answer), false))
                .collect();
            store.save_checkpoint(key, &resolved).await?;
            checkpointed += resolved.len();

            for attempt in 0..self.config.retry.max_retries {
                let failed: Vec<usize> = answers
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| a.is_err())
                    .map(|(i, _)| i)
                    .collect();
                if failed.is_empty() {
                    break;
                }

                let delay = self.config.retry.delay_for_attempt(attempt);
                let sub_chunk = self.config.retry.sub_chunk_size(chunk.len());
                warn!(
                    document_id = %key.document_id,
                    chunk = chunk_index + 1,
                    failed = failed.len(),
                    attempt = attempt + 1,
                    sub_chunk,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying transient failures in sub-chunks"
                );

                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled { checkpointed }),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                let mut recovered = Vec::new();
                for group in failed.chunks(sub_chunk) {
                    let sub_queries: Vec<UnitQuery> =
                        group.iter().map(|&i| chunk[i].clone()).collect();
                    let sub_answers = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled { checkpointed }),
                        answers = self.run_chunk(&sub_queries) => answers,
                    };
                    run.authority_calls += group.len();

                    for (&i, answer) in group.iter().zip(sub_answers) {
                        if answer.is_ok() {
                            recovered.push(CheckpointEntry::new(
                                &chunk[i],
                                &resolve(&chunk[i], &answer),
                                false,
                            ));
                        }
                        answers[i] = answer;
                    }
                }
                store.save_checkpoint(key, &recovered).await?;
                checkpointed += recovered.len();
            }

            let exhausted: Vec<CheckpointEntry> = chunk
                .iter()
                .zip(&answers)
                .filter(|(_, answer)| answer.is_err())
                .map(|(query, answer)| CheckpointEntry::new(query, &resolve(query, answer), true))
                .collect();
            if !exhausted.is_empty() {
                warn!(
                    document_id = %key.document_id,
                    chunk = chunk_index + 1,
                    count = exhausted.len(),
                    "Identifiers still failing after retries, marking invalid"
                );
                store.save_checkpoint(key, &exhausted).await?;
                checkpointed += exhausted.len();
            }

            for (offset, answer) in answers.iter().enumerate() {
                let index = range.start + offset;
                slots[pending[index]] = Some(resolve(&queries[index], answer));
            }

            debug!(
                document_id = %key.document_id,
                chunk = chunk_index + 1,
                size = chunk.len(),
                checkpointed,
                "Chunk checkpointed"
            );
        }

        // Canonical duplicates, in submission order
        let mut claims: HashMap<String, Owner> = HashMap::new();
        for unit in request.stored {
            if unit.outcome == UnitOutcome::Duplicate {
                continue;
            }
            claims.insert(unit.identifier.clone(), Owner::Stored(unit.id));
            if let Some(canonical) = &unit.canonical_identifier {
                claims.insert(canonical.clone(), Owner::Stored(unit.id));
            }
        }

        for (slot, resolution) in slots.iter_mut().enumerate() {
            let Some(current) = resolution.as_ref() else {
                continue;
            };
            let canonical = match current {
                Resolution::Valid(confirmed) => Some(confirmed.canonical_identifier.clone()),
                Resolution::Invalid { .. } => None,
                Resolution::AlreadyValid(_) | Resolution::Duplicate { .. } => continue,
            };

            let owner = match targets[slot] {
                Some(unit_id) => Owner::Stored(unit_id),
                None => Owner::Entry(slot),
            };
            let raw = normalized[slot].0.clone();
            let mut keys = vec![raw];
            if let Some(canonical) = canonical
                && canonical != keys[0]
            {
                keys.push(canonical);
            }

            let clash = keys
                .iter()
                .find(|k| claims.get(k.as_str()).is_some_and(|o| *o != owner));
            if let Some(clash) = clash {
                debug!(identifier = %normalized[slot].0, clash = %clash, "Canonical duplicate");
                *resolution = Some(Resolution::Duplicate {
                    reason: format!("same unit as {}", clash),
                });
            } else {
                for k in keys {
                    claims.insert(k, owner);
                }
            }
        }

        run.entries = normalized
            .into_iter()
            .zip(slots)
            .zip(targets)
            .map(|(((identifier, quantity), resolution), target)| EntryResult {
                identifier,
                quantity,
                target,
                resolution: resolution.unwrap_or_else(|| Resolution::Invalid {
                    reason: "validation error: not processed".to_string(),
                }),
            })
            .collect();

        info!(
            document_id = %key.document_id,
            item_code = %key.item_code,
            valid = run.valid_count(),
            invalid = run.invalid_count(),
            duplicate = run.duplicate_count(),
            already_valid = run.already_valid(),
            reused = run.reused,
            authority_calls = run.authority_calls,
            "Batch validation finished"
        );

        Ok(run)
    }

    /// One answer per query, in order
    async fn run_chunk(&self, chunk: &[UnitQuery]) -> Vec<Answer> {
        let call_timeout = self.config.call_timeout;

        if self.authority.supports_bulk() {
            return match tokio::time::timeout(call_timeout, self.authority.validate_bulk(chunk)).await
            {
                Ok(Ok(verdicts)) if verdicts.len() == chunk.len() => {
                    verdicts.into_iter().map(Ok).collect()
                }
                Ok(Ok(verdicts)) => {
                    let e = AuthorityError::Malformed(format!(
                        "bulk answer carried {} verdicts for {} queries",
                        verdicts.len(),
                        chunk.len()
                    ));
                    vec![Err(e); chunk.len()]
                }
                Ok(Err(e)) => vec![Err(e); chunk.len()],
                Err(_) => vec![Err(timeout_error(call_timeout)); chunk.len()],
            };
        }

        // Owned futures keep the whole validation future Send
        let calls: Vec<_> = chunk
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, query)| {
                let authority = Arc::clone(&self.authority);
                async move {
                    let answer =
                        match tokio::time::timeout(call_timeout, authority.validate(&query)).await {
                            Ok(answer) => answer,
                            Err(_) => Err(timeout_error(call_timeout)),
                        };
                    (i, answer)
                }
            })
            .collect();

        let mut answers: Vec<Option<Answer>> = vec![None; chunk.len()];
        let mut calls = stream::iter(calls).buffer_unordered(self.config.concurrency.max(1));

        while let Some((i, answer)) = calls.next().await {
            answers[i] = Some(answer);
        }

        answers
            .into_iter()
            .map(|a| a.unwrap_or_else(|| Err(AuthorityError::Transient("no answer".into()))))
            .collect()
    }
}
