//! Chunk sizing and retry policy for batch validation.
//!
//! One `RetryPolicy` drives every retry the validator performs, so retry
//! behavior can be tested without an authority or a store.

use std::time::Duration;

/// Adaptive chunk sizing
///
/// Small submissions use small chunks to keep checkpoints frequent; large
/// submissions use large chunks to amortize round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingPolicy {
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    /// Chunks a submission is divided into before clamping
    pub target_chunks: usize,
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self {
            min_chunk_size: 10,
            max_chunk_size: 200,
            target_chunks: 10,
        }
    }
}

impl ChunkingPolicy {
    /// `clamp(ceil(total / target_chunks), min, max)`
    pub fn chunk_size(&self, total: usize) -> usize {
        let target = self.target_chunks.max(1);
        let raw = total.div_ceil(target);
        raw.clamp(self.min_chunk_size.max(1), self.max_chunk_size.max(1))
    }

    /// Split `0..total` into chunk ranges
    pub fn ranges(&self, total: usize) -> Vec<std::ops::Range<usize>> {
        if total == 0 {
            return Vec::new();
        }
        let size = self.chunk_size(total);
        (0..total)
            .step_by(size)
            .map(|start| start..(start + size).min(total))
            .collect()
    }
}

/// Retry policy for transient authority failures
///
/// # Default Values
///
/// - `max_retries`: 1 (one sub-chunk retry round)
/// - `initial_delay`: 250ms
/// - `max_delay`: 5 seconds
/// - `multiplier`: 2.0
/// - `sub_chunk_divisor`: 4 (retry in quarter-size sub-chunks)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub sub_chunk_divisor: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            sub_chunk_divisor: 4,
        }
    }
}

impl RetryPolicy {
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
            sub_chunk_divisor: None,
        }
    }

    /// Policy with no waiting between rounds
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before retry round `attempt` (0-based), capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }

    /// Sub-chunk size used when retrying a chunk of `chunk_size`
    pub fn sub_chunk_size(&self, chunk_size: usize) -> usize {
        (chunk_size / self.sub_chunk_divisor.max(1)).max(1)
    }
}

/// Builder for [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<usize>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    sub_chunk_divisor: Option<usize>,
}

impl RetryPolicyBuilder {
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    pub const fn sub_chunk_divisor(mut self, divisor: usize) -> Self {
        self.sub_chunk_divisor = Some(divisor);
        self
    }

    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            sub_chunk_divisor: self.sub_chunk_divisor.unwrap_or(defaults.sub_chunk_divisor),
        }
    }
}
