//! Test helpers: a scriptable in-memory optimize service and engine wiring.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use shrinkray::models::credential::{period_of, Credential};
use shrinkray::models::item::{TargetOptions, WorkItem};
use shrinkray::progress::ProgressCounters;
use shrinkray::services::breaker::CircuitBreaker;
use shrinkray::services::governor::ConcurrencyGovernor;
use shrinkray::services::orchestrator::BatchOrchestrator;
use shrinkray::services::processor::ItemProcessor;
use shrinkray::services::rate::RateObserver;
use shrinkray::services::registry::CredentialRegistry;
use shrinkray::services::remote::{OptimizeService, ServiceError, TransformOutput};

/// How the mock service answers every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    Succeed,
    FailConnection,
    FailAccount,
}

/// In-memory stand-in for the remote compression service. Tracks call
/// concurrency and mimics the cumulative usage counter.
pub struct MockService {
    pub behavior: MockBehavior,
    pub delay: Duration,
    usage: AtomicU32,
    limit: Option<u32>,
    pub calls: AtomicU32,
    concurrent: AtomicUsize,
    peak: AtomicUsize,
}

impl MockService {
    pub fn succeeding() -> Self {
        Self::new(MockBehavior::Succeed, Duration::from_millis(5), 0, None)
    }

    pub fn new(
        behavior: MockBehavior,
        delay: Duration,
        initial_usage: u32,
        limit: Option<u32>,
    ) -> Self {
        Self {
            behavior,
            delay,
            usage: AtomicU32::new(initial_usage),
            limit,
            calls: AtomicU32::new(0),
            concurrent: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OptimizeService for MockService {
    async fn optimize(
        &self,
        _token: &str,
        input: Vec<u8>,
        _options: &TargetOptions,
    ) -> Result<TransformOutput, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        match self.behavior {
            MockBehavior::FailConnection => {
                return Err(ServiceError::Connection("connection reset".to_string()))
            }
            MockBehavior::FailAccount => {
                return Err(ServiceError::AccountInvalid("bad token".to_string()))
            }
            MockBehavior::Succeed => {}
        }

        if let Some(limit) = self.limit {
            if self.usage.load(Ordering::SeqCst) >= limit {
                return Err(ServiceError::QuotaExhausted);
            }
        }
        let usage = self.usage.fetch_add(1, Ordering::SeqCst) + 1;

        // "Compress" to half the input size.
        let bytes = vec![0x42u8; (input.len() / 2).max(1)];
        Ok(TransformOutput {
            bytes,
            usage_count: Some(usage),
        })
    }
}

/// A fully wired engine over a mock service and a temp backup directory.
pub struct TestEngine {
    pub registry: Arc<CredentialRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub orchestrator: BatchOrchestrator,
}

pub struct EngineParams {
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_attempts: 1,
            failure_threshold: 5,
            cooldown: Duration::from_millis(100),
        }
    }
}

pub fn build_engine(
    service: Arc<MockService>,
    credentials: Vec<Credential>,
    backup_dir: PathBuf,
    params: EngineParams,
) -> TestEngine {
    let registry = Arc::new(CredentialRegistry::new(credentials));
    let breaker = Arc::new(CircuitBreaker::new(params.failure_threshold, params.cooldown));
    let rate = Arc::new(RateObserver::new(Duration::ZERO, Duration::from_millis(50)));
    let governor = Arc::new(ConcurrencyGovernor::new(
        params.max_concurrent,
        Arc::clone(&breaker),
        Arc::clone(&rate),
    ));
    let processor = Arc::new(ItemProcessor::new(
        service,
        backup_dir,
        params.max_attempts,
        Duration::from_millis(1),
        64 * 1024 * 1024,
    ));
    let orchestrator = BatchOrchestrator::new(
        Arc::clone(&registry),
        governor,
        Arc::clone(&breaker),
        rate,
        processor,
        Arc::new(ProgressCounters::new()),
    );
    TestEngine {
        registry,
        breaker,
        orchestrator,
    }
}

/// Credential stamped with the current billing period so the orchestrator's
/// period reset leaves its usage counter alone.
pub fn credential_with_usage(name: &str, used: u32, limit: u32) -> Credential {
    let mut cred = Credential::new(name, format!("tok-{name}"), limit);
    cred.used_count = used;
    cred.period = period_of(Utc::now());
    cred.refresh_status();
    cred
}

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Write a file that sniffs as a PNG, padded to `extra` bytes of payload.
pub fn write_png(dir: &Path, name: &str, extra: usize) -> PathBuf {
    let path = dir.join(name);
    let mut bytes = PNG_SIGNATURE.to_vec();
    bytes.extend(std::iter::repeat(0xABu8).take(extra.max(64)));
    std::fs::write(&path, &bytes).expect("write fixture");
    path
}

/// Work items for every file, in name order (dispatch order for the tests).
pub fn items_for(paths: &[PathBuf], options: TargetOptions) -> Vec<WorkItem> {
    paths
        .iter()
        .map(|p| {
            let size = std::fs::metadata(p).expect("stat fixture").len();
            WorkItem::new(p.clone(), size, options.clone())
        })
        .collect()
}
