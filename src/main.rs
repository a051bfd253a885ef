use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use shrinkray::{
    config::AppConfig,
    models::credential::CredentialSelector,
    models::item::{
        self, FormatTarget, ImageKind, ResizeMethod, ResizeSpec, TargetOptions, WorkItem,
    },
    progress::ProgressCounters,
    services::{
        breaker::CircuitBreaker,
        governor::ConcurrencyGovernor,
        orchestrator::{BatchOptions, BatchOrchestrator},
        processor::ItemProcessor,
        rate::RateObserver,
        registry::CredentialRegistry,
        remote::RemoteOptimizer,
        store::CredentialStore,
    },
};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing shrinkray");

    // Register application metrics
    metrics::describe_counter!("optimize_items_total", "Work items by terminal result");
    metrics::describe_counter!("optimize_bytes_saved_total", "Total bytes saved across items");
    metrics::describe_histogram!("optimize_request_seconds", "Remote transform call latency");
    metrics::describe_gauge!("optimize_slots_in_use", "Concurrency slots currently held");

    // Load the credential set
    let store = CredentialStore::new(config.credentials_path.clone());
    let credentials = store.load().await.expect("Failed to load credential store");
    if credentials.is_empty() {
        tracing::error!(path = %store.path().display(), "Credential store is empty");
        std::process::exit(1);
    }
    let registry = Arc::new(CredentialRegistry::new(credentials));

    // Collect work items
    let options = target_options(&config).expect("Invalid transform options in configuration");
    let items = scan_items(&config.input_dir, &config.backup_dir, options);
    tracing::info!(
        input_dir = %config.input_dir.display(),
        items = items.len(),
        "Scan complete"
    );
    if items.is_empty() {
        tracing::warn!("Nothing to do");
        return;
    }

    // Wire up the engine
    let service = RemoteOptimizer::new(
        config.api_endpoint.clone(),
        Duration::from_secs(config.request_timeout_secs),
    )
    .expect("Failed to initialize service client");

    let breaker = Arc::new(CircuitBreaker::new(
        config.failure_threshold,
        Duration::from_secs(config.cooldown_secs),
    ));
    let rate = Arc::new(RateObserver::new(
        Duration::from_millis(config.base_delay_ms),
        Duration::from_millis(config.max_delay_ms),
    ));
    let governor = Arc::new(ConcurrencyGovernor::new(
        config.max_concurrent,
        Arc::clone(&breaker),
        Arc::clone(&rate),
    ));
    let processor = Arc::new(ItemProcessor::new(
        Arc::new(service),
        config.backup_dir.clone(),
        config.max_attempts,
        Duration::from_millis(config.retry_base_ms),
        config.max_input_bytes,
    ));
    let orchestrator = BatchOrchestrator::new(
        Arc::clone(&registry),
        governor,
        breaker,
        rate,
        processor,
        Arc::new(ProgressCounters::new()),
    );

    let selector = match &config.credential {
        Some(name) => CredentialSelector::Named(name.clone()),
        None => CredentialSelector::Best,
    };
    let batch_options = BatchOptions {
        max_items: config.max_items,
        chunk_multiplier: config.chunk_multiplier,
        dry_run: config.dry_run,
    };

    let result = match orchestrator.run(items, &selector, &batch_options).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "Batch could not start");
            std::process::exit(1);
        }
    };

    // Persist updated usage counters
    if let Err(e) = store.save(&registry.snapshot()).await {
        tracing::error!(error = %e, "Failed to save credential store");
    }

    tracing::info!(
        succeeded = result.succeeded,
        failed = result.failed,
        skipped = result.skipped,
        planned = result.planned,
        bytes_saved = result.bytes_saved(),
        savings_pct = format!("{:.1}", result.savings_ratio() * 100.0),
        credential = %result.credential_name,
        credential_used = result.credential_used,
        credential_limit = result.credential_limit,
        "Run complete"
    );

    if result.failed > 0 {
        std::process::exit(2);
    }
}

/// Build the per-item transform options from configuration.
fn target_options(config: &AppConfig) -> Result<TargetOptions, String> {
    let format = match config.target_format.as_deref() {
        None => FormatTarget::Keep,
        Some(name) => ImageKind::from_extension(name)
            .map(FormatTarget::Convert)
            .ok_or_else(|| format!("unknown target format '{name}'"))?,
    };

    let resize = match config.resize_method.as_deref() {
        None => None,
        Some(name) => {
            let method = match name.to_ascii_lowercase().as_str() {
                "scale" => ResizeMethod::Scale,
                "fit" => ResizeMethod::Fit,
                "cover" => ResizeMethod::Cover,
                "thumb" => ResizeMethod::Thumb,
                other => return Err(format!("unknown resize method '{other}'")),
            };
            if config.resize_width.is_none() && config.resize_height.is_none() {
                return Err("resize requires a width or a height".to_string());
            }
            Some(ResizeSpec {
                method,
                width: config.resize_width,
                height: config.resize_height,
            })
        }
    };

    Ok(TargetOptions {
        format,
        resize,
        preserve_metadata: config.preserve_metadata,
    })
}

/// Walk the input directory and collect supported image files, skipping the
/// backup tree and in-progress temp files.
fn scan_items(input_dir: &Path, backup_dir: &Path, options: TargetOptions) -> Vec<WorkItem> {
    // Canonicalize so the backup-tree exclusion works for relative paths.
    let root = input_dir.canonicalize().unwrap_or_else(|_| input_dir.to_path_buf());
    let backup_root = backup_dir.canonicalize().ok();

    let mut items = Vec::new();
    for entry in WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            backup_root
                .as_deref()
                .map(|b| !e.path().starts_with(b))
                .unwrap_or(true)
        })
    {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || !item::has_supported_extension(entry.path()) {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => items.push(WorkItem::new(
                entry.path().to_path_buf(),
                meta.len(),
                options.clone(),
            )),
            Err(e) => tracing::warn!(file = %entry.path().display(), error = %e, "Cannot stat file"),
        }
    }
    items.sort_by(|a, b| a.source.cmp(&b.source));
    items
}
