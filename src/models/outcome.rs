use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Closed taxonomy of item-level failures surfaced to the orchestrator and
/// the reporting layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The input file is unsupported, unreadable, or malformed.
    Validation,
    /// The credential's monthly quota is spent. A scheduling signal, not a
    /// service-health signal.
    QuotaExceeded,
    /// The service rejected the credential itself.
    InvalidCredential,
    /// Network or server-side trouble; retried with backoff before being
    /// reported.
    Transient,
    /// Local filesystem trouble (permissions, space). Fatal for the item,
    /// the batch continues.
    FileSystem,
    /// Unclassifiable; treated as Transient once, then reported.
    Unknown,
}

impl ErrorKind {
    /// Failures that say something about the health of the remote service
    /// and should feed the circuit breaker and rate observer.
    pub fn is_service_signal(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Unknown)
    }
}

/// Why an item was never dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    QuotaExhausted,
    OperatorLimit,
}

/// Terminal outcome for one work item. Produced exactly once per item.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Success {
        original_size: u64,
        result_size: u64,
        result_path: PathBuf,
        elapsed: Duration,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
    Skipped {
        reason: SkipReason,
    },
    /// Dry-run placeholder: the item validated and this is where the result
    /// would have been installed. No remote call was made.
    Planned {
        destination: PathBuf,
    },
}

/// Outcome paired with the item it belongs to, in completion order.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub source: PathBuf,
    pub outcome: ProcessingOutcome,
}

/// Aggregate result of a batch run, built incrementally as outcomes arrive.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub outcomes: Vec<ItemOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub planned: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub duration: Duration,
    pub peak_concurrency: usize,
    pub average_concurrency: f64,
    pub credential_name: String,
    pub credential_used: u32,
    pub credential_limit: u32,
}

impl BatchResult {
    pub fn new(credential_name: impl Into<String>, credential_limit: u32) -> Self {
        Self {
            outcomes: Vec::new(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            planned: 0,
            bytes_before: 0,
            bytes_after: 0,
            duration: Duration::ZERO,
            peak_concurrency: 0,
            average_concurrency: 0.0,
            credential_name: credential_name.into(),
            credential_used: 0,
            credential_limit,
        }
    }

    pub fn record(&mut self, item: ItemOutcome) {
        match &item.outcome {
            ProcessingOutcome::Success {
                original_size,
                result_size,
                ..
            } => {
                self.succeeded += 1;
                self.bytes_before += original_size;
                self.bytes_after += result_size;
            }
            ProcessingOutcome::Failure { .. } => self.failed += 1,
            ProcessingOutcome::Skipped { .. } => self.skipped += 1,
            ProcessingOutcome::Planned { .. } => self.planned += 1,
        }
        self.outcomes.push(item);
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }

    /// Fraction of input bytes saved across successful items, 0.0..=1.0.
    pub fn savings_ratio(&self) -> f64 {
        if self.bytes_before == 0 {
            0.0
        } else {
            self.bytes_saved() as f64 / self.bytes_before as f64
        }
    }
}
