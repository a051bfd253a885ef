use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;

use crate::models::credential::{CredentialSelector, CredentialStatus};
use crate::models::item::WorkItem;
use crate::models::outcome::{
    BatchResult, ErrorKind, ItemOutcome, ProcessingOutcome, SkipReason,
};
use crate::progress::ProgressCounters;
use crate::services::breaker::CircuitBreaker;
use crate::services::governor::ConcurrencyGovernor;
use crate::services::processor::{ItemProcessor, Processed};
use crate::services::rate::RateObserver;
use crate::services::registry::{CredentialRegistry, SelectError};

/// Operator-facing knobs for one batch run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Process at most this many items; the rest are skipped.
    pub max_items: Option<usize>,
    /// Outstanding tasks are capped at `max_concurrent * chunk_multiplier`
    /// to bound peak memory on very large batches.
    pub chunk_multiplier: usize,
    /// Validate and plan only; no remote calls, no file writes.
    pub dry_run: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_items: None,
            chunk_multiplier: 4,
            dry_run: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Credentials(#[from] SelectError),
}

/// Fans work items out through the concurrency governor, collects per-item
/// outcomes, and aggregates batch metrics.
///
/// Quota exhaustion mid-run stops new dispatch; in-flight items always drain
/// to a terminal outcome. Items never dispatched are recorded as skipped, in
/// their original order.
pub struct BatchOrchestrator {
    registry: Arc<CredentialRegistry>,
    governor: Arc<ConcurrencyGovernor>,
    breaker: Arc<CircuitBreaker>,
    rate: Arc<RateObserver>,
    processor: Arc<ItemProcessor>,
    progress: Arc<ProgressCounters>,
}

impl BatchOrchestrator {
    pub fn new(
        registry: Arc<CredentialRegistry>,
        governor: Arc<ConcurrencyGovernor>,
        breaker: Arc<CircuitBreaker>,
        rate: Arc<RateObserver>,
        processor: Arc<ItemProcessor>,
        progress: Arc<ProgressCounters>,
    ) -> Self {
        Self {
            registry,
            governor,
            breaker,
            rate,
            processor,
            progress,
        }
    }

    pub fn progress(&self) -> Arc<ProgressCounters> {
        Arc::clone(&self.progress)
    }

    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        selector: &CredentialSelector,
        options: &BatchOptions,
    ) -> Result<BatchResult, BatchError> {
        self.registry.reset_if_new_period(Utc::now());

        let credential = match selector {
            CredentialSelector::Named(name) => self.registry.select_named(name)?,
            // Prefer a credential that can cover the whole batch; otherwise
            // take the one with the most room and skip the overflow.
            CredentialSelector::Best => self
                .registry
                .select_best(items.len() as u32)
                .or_else(|_| self.registry.select_best(1))?,
        };
        tracing::info!(
            credential = %credential.name,
            remaining = credential.remaining(),
            items = items.len(),
            dry_run = options.dry_run,
            "Starting batch"
        );

        if options.dry_run {
            return Ok(self.plan(items, &credential.name, credential.limit, options).await);
        }

        let mut result = BatchResult::new(credential.name.clone(), credential.limit);
        let wall = Instant::now();

        // Dispatch budget: how many more calls this credential may make.
        // Decremented at dispatch time so concurrent items cannot overshoot
        // the quota; items that finish without being billed refund their
        // unit. The authoritative count still comes from the service.
        let budget = Arc::new(AtomicI64::new(credential.remaining() as i64));
        let halt = Arc::new(AtomicBool::new(false));
        let busy_ms = Arc::new(AtomicU64::new(0));

        let chunk_size = (self.governor.limit() * options.chunk_multiplier.max(1)).max(1);
        let mut join_set: JoinSet<Processed> = JoinSet::new();
        let mut sources: HashMap<tokio::task::Id, PathBuf> = HashMap::new();
        let mut dispatched = 0usize;

        for item in items {
            let mut skip_reason = None;
            if options.max_items.is_some_and(|cap| dispatched >= cap) {
                skip_reason = Some(SkipReason::OperatorLimit);
            } else {
                loop {
                    if halt.load(Ordering::Acquire) {
                        skip_reason = Some(SkipReason::QuotaExhausted);
                        break;
                    }
                    if budget.load(Ordering::Acquire) > 0 {
                        // This loop is the only decrementer; tasks only
                        // refund, so the budget cannot go negative here.
                        budget.fetch_sub(1, Ordering::AcqRel);
                        break;
                    }
                    if join_set.is_empty() {
                        skip_reason = Some(SkipReason::QuotaExhausted);
                        break;
                    }
                    // An in-flight item may still refund its unbilled unit;
                    // wait for one to finish before calling the quota spent.
                    self.collect_next(&mut join_set, &mut sources, &mut result).await;
                }
            }

            if let Some(reason) = skip_reason {
                self.progress.record_skip();
                result.record(ItemOutcome {
                    source: item.source,
                    outcome: ProcessingOutcome::Skipped { reason },
                });
                continue;
            }

            dispatched += 1;
            let source = item.source.clone();
            let handle = join_set.spawn(self.spawn_item(
                item,
                credential.name.clone(),
                credential.token.clone(),
                Arc::clone(&halt),
                Arc::clone(&budget),
                Arc::clone(&busy_ms),
            ));
            sources.insert(handle.id(), source);

            while join_set.len() >= chunk_size {
                self.collect_next(&mut join_set, &mut sources, &mut result).await;
            }
        }

        // Guaranteed drain: every in-flight item reaches a terminal state.
        while !join_set.is_empty() {
            self.collect_next(&mut join_set, &mut sources, &mut result).await;
        }

        result.duration = wall.elapsed();
        result.peak_concurrency = self.progress.peak_in_flight();
        let wall_ms = result.duration.as_millis() as u64;
        result.average_concurrency = if wall_ms == 0 {
            0.0
        } else {
            busy_ms.load(Ordering::Relaxed) as f64 / wall_ms as f64
        };
        if let Some(updated) = self
            .registry
            .snapshot()
            .into_iter()
            .find(|c| c.name == credential.name)
        {
            result.credential_used = updated.used_count;
        }

        tracing::info!(
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            bytes_saved = result.bytes_saved(),
            peak_concurrency = result.peak_concurrency,
            duration_ms = result.duration.as_millis() as u64,
            "Batch finished"
        );
        Ok(result)
    }

    /// One item's full lifecycle as a spawned task: slot, process, feed the
    /// observers and the registry.
    fn spawn_item(
        &self,
        item: WorkItem,
        credential_name: String,
        token: String,
        halt: Arc<AtomicBool>,
        budget: Arc<AtomicI64>,
        busy_ms: Arc<AtomicU64>,
    ) -> impl std::future::Future<Output = Processed> + Send + 'static {
        let governor = Arc::clone(&self.governor);
        let processor = Arc::clone(&self.processor);
        let registry = Arc::clone(&self.registry);
        let breaker = Arc::clone(&self.breaker);
        let rate = Arc::clone(&self.rate);
        let progress = Arc::clone(&self.progress);

        async move {
            let slot = governor.acquire().await;
            progress.enter_flight();
            let started = Instant::now();
            let processed = processor.process(&item, &token).await;
            progress.leave_flight();
            busy_ms.fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
            drop(slot);

            match &processed.outcome {
                ProcessingOutcome::Success {
                    original_size,
                    result_size,
                    elapsed,
                    ..
                } => {
                    rate.record_success(*elapsed);
                    breaker.record_success();
                    progress.record_success(original_size.saturating_sub(*result_size));
                    metrics::histogram!("optimize_request_seconds").record(elapsed.as_secs_f64());
                }
                ProcessingOutcome::Failure { kind, .. } => {
                    if kind.is_service_signal() {
                        rate.record_failure();
                        breaker.record_failure();
                    } else {
                        // Local failures say nothing about service health;
                        // if this item held the half-open trial, release it.
                        breaker.record_neutral();
                    }
                    match kind {
                        ErrorKind::QuotaExceeded => {
                            halt.store(true, Ordering::Release);
                        }
                        ErrorKind::InvalidCredential => {
                            registry.mark_invalid(&credential_name);
                            halt.store(true, Ordering::Release);
                        }
                        _ => {}
                    }
                    progress.record_failure();
                }
                _ => {}
            }

            // Usage updates serialize through the registry mutex in response
            // arrival order, even though transforms run concurrently.
            if let Some(count) = processed.reported_usage {
                if let Some(status) = registry.record_usage(&credential_name, count) {
                    if status != CredentialStatus::Active {
                        halt.store(true, Ordering::Release);
                    }
                }
            } else if matches!(processed.outcome, ProcessingOutcome::Failure { .. }) {
                // Nothing was billed for this item; return its dispatch unit
                // so later items are not skipped on phantom quota spend.
                budget.fetch_add(1, Ordering::AcqRel);
            }

            processed
        }
    }

    async fn collect_next(
        &self,
        join_set: &mut JoinSet<Processed>,
        sources: &mut HashMap<tokio::task::Id, PathBuf>,
        result: &mut BatchResult,
    ) {
        match join_set.join_next_with_id().await {
            Some(Ok((id, processed))) => {
                let source = sources.remove(&id).unwrap_or_default();
                result.record(ItemOutcome {
                    source,
                    outcome: processed.outcome,
                });
            }
            Some(Err(join_err)) => {
                let source = sources.remove(&join_err.id()).unwrap_or_default();
                tracing::error!(error = %join_err, file = %source.display(), "Item task aborted");
                self.progress.record_failure();
                result.record(ItemOutcome {
                    source,
                    outcome: ProcessingOutcome::Failure {
                        kind: ErrorKind::Unknown,
                        message: format!("worker task aborted: {join_err}"),
                    },
                });
            }
            None => {}
        }
    }

    async fn plan(
        &self,
        items: Vec<WorkItem>,
        credential_name: &str,
        credential_limit: u32,
        options: &BatchOptions,
    ) -> BatchResult {
        let mut result = BatchResult::new(credential_name, credential_limit);
        let wall = Instant::now();
        for (index, item) in items.into_iter().enumerate() {
            if options.max_items.is_some_and(|cap| index >= cap) {
                result.record(ItemOutcome {
                    source: item.source,
                    outcome: ProcessingOutcome::Skipped {
                        reason: SkipReason::OperatorLimit,
                    },
                });
                continue;
            }
            let outcome = match self.processor.validate(&item).await {
                Ok(()) => ProcessingOutcome::Planned {
                    destination: item.destination(),
                },
                Err(message) => ProcessingOutcome::Failure {
                    kind: ErrorKind::Validation,
                    message,
                },
            };
            result.record(ItemOutcome {
                source: item.source,
                outcome,
            });
        }
        result.duration = wall.elapsed();
        result
    }
}
