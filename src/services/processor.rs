use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use filetime::FileTime;
use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::models::item::WorkItem;
use crate::models::outcome::{ErrorKind, ProcessingOutcome};
use crate::services::remote::{OptimizeService, ServiceError};

/// Bytes read from the head of the file for format sniffing.
const SNIFF_LEN: usize = 64;

/// Suffix given to in-progress result files next to their destination.
const TMP_SUFFIX: &str = ".optimizing";

/// What one processed item reports back to the orchestrator.
#[derive(Debug)]
pub struct Processed {
    pub outcome: ProcessingOutcome,
    /// Cumulative usage the service reported, when a call was billed. Set
    /// even if a later local step failed, so accounting stays authoritative.
    pub reported_usage: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),
}

impl StepError {
    fn kind(&self) -> ErrorKind {
        match self {
            StepError::Validation(_) => ErrorKind::Validation,
            StepError::Service(e) => e.kind(),
            StepError::Io(_) => ErrorKind::FileSystem,
        }
    }
}

/// Runs the per-item safety protocol: validate, back up the original, invoke
/// the remote transform, atomically install the result. A failing item never
/// touches the source file; the backup always exists before install runs.
pub struct ItemProcessor {
    service: Arc<dyn OptimizeService>,
    backup_dir: PathBuf,
    max_attempts: u32,
    retry_base: Duration,
    max_input_bytes: u64,
}

impl ItemProcessor {
    pub fn new(
        service: Arc<dyn OptimizeService>,
        backup_dir: PathBuf,
        max_attempts: u32,
        retry_base: Duration,
        max_input_bytes: u64,
    ) -> Self {
        Self {
            service,
            backup_dir,
            max_attempts: max_attempts.max(1),
            retry_base,
            max_input_bytes,
        }
    }

    pub async fn process(&self, item: &WorkItem, token: &str) -> Processed {
        let started = Instant::now();
        let mut usage = None;
        match self.run(item, token, &mut usage).await {
            Ok(result_size) => {
                let elapsed = started.elapsed();
                tracing::info!(
                    file = item.file_name(),
                    original_size = item.size,
                    result_size,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Item optimized"
                );
                Processed {
                    outcome: ProcessingOutcome::Success {
                        original_size: item.size,
                        result_size,
                        result_path: item.destination(),
                        elapsed,
                    },
                    reported_usage: usage,
                }
            }
            Err(err) => {
                let kind = err.kind();
                tracing::warn!(
                    file = item.file_name(),
                    kind = ?kind,
                    error = %err,
                    "Item failed"
                );
                Processed {
                    outcome: ProcessingOutcome::Failure {
                        kind,
                        message: err.to_string(),
                    },
                    reported_usage: usage,
                }
            }
        }
    }

    /// Validate the item without side effects. Used for dry runs.
    pub async fn validate(&self, item: &WorkItem) -> Result<(), String> {
        self.validate_inner(item).await.map_err(|e| e.to_string())
    }

    async fn run(
        &self,
        item: &WorkItem,
        token: &str,
        usage: &mut Option<u32>,
    ) -> Result<u64, StepError> {
        self.validate_inner(item).await?;
        self.backup(&item.source).await?;

        let input = fs::read(&item.source).await?;
        let output = self.transform_with_retry(item, token, input, usage).await?;
        let result_size = output.len() as u64;

        self.install(item, output).await?;
        Ok(result_size)
    }

    async fn validate_inner(&self, item: &WorkItem) -> Result<(), StepError> {
        let meta = fs::metadata(&item.source)
            .await
            .map_err(|e| StepError::Validation(format!("cannot read {}: {e}", item.source.display())))?;
        if !meta.is_file() {
            return Err(StepError::Validation(format!(
                "{} is not a regular file",
                item.source.display()
            )));
        }
        if meta.len() == 0 {
            return Err(StepError::Validation(format!(
                "{} is empty",
                item.source.display()
            )));
        }
        if meta.len() > self.max_input_bytes {
            return Err(StepError::Validation(format!(
                "{} is {} bytes, over the {} byte input limit",
                item.source.display(),
                meta.len(),
                self.max_input_bytes
            )));
        }

        let mut head = vec![0u8; SNIFF_LEN.min(meta.len() as usize)];
        let mut file = fs::File::open(&item.source)
            .await
            .map_err(|e| StepError::Validation(format!("cannot open {}: {e}", item.source.display())))?;
        file.read_exact(&mut head)
            .await
            .map_err(|e| StepError::Validation(format!("cannot read {}: {e}", item.source.display())))?;

        match image::guess_format(&head) {
            Ok(
                image::ImageFormat::Png | image::ImageFormat::Jpeg | image::ImageFormat::WebP,
            ) => Ok(()),
            Ok(other) => Err(StepError::Validation(format!(
                "{}: unsupported image format {other:?}",
                item.source.display()
            ))),
            Err(_) => Err(StepError::Validation(format!(
                "{} does not look like an image",
                item.source.display()
            ))),
        }
    }

    /// Copy the source into the backup directory, preserving its mtime. An
    /// identical existing backup (same size and mtime) is a no-op; a
    /// differing one is kept and the new copy gets a timestamp suffix.
    async fn backup(&self, source: &Path) -> Result<PathBuf, StepError> {
        fs::create_dir_all(&self.backup_dir).await?;

        let file_name = source
            .file_name()
            .ok_or_else(|| StepError::Validation(format!("{} has no file name", source.display())))?;
        let source_meta = fs::metadata(source).await?;
        let source_mtime = FileTime::from_last_modification_time(&source_meta);

        let mut target = self.backup_dir.join(file_name);
        if let Ok(existing) = fs::metadata(&target).await {
            let existing_mtime = FileTime::from_last_modification_time(&existing);
            if existing.len() == source_meta.len() && existing_mtime == source_mtime {
                tracing::debug!(file = %target.display(), "Identical backup exists, skipping");
                return Ok(target);
            }
            // Different content under the same name: keep both.
            let stamp = Utc::now().format("%Y%m%dT%H%M%S");
            let suffixed = format!("{}.{stamp}", file_name.to_string_lossy());
            target = self.backup_dir.join(suffixed);
        }

        fs::copy(source, &target).await?;
        filetime::set_file_mtime(&target, source_mtime)?;
        tracing::debug!(file = %target.display(), "Backup created");
        Ok(target)
    }

    async fn transform_with_retry(
        &self,
        item: &WorkItem,
        token: &str,
        input: Vec<u8>,
        usage: &mut Option<u32>,
    ) -> Result<Vec<u8>, StepError> {
        let mut attempt = 1u32;
        loop {
            match self
                .service
                .optimize(token, input.clone(), &item.options)
                .await
            {
                Ok(output) => {
                    if let Some(count) = output.usage_count {
                        *usage = Some(count);
                    }
                    return Ok(output.bytes);
                }
                Err(err) => {
                    // Unknown gets one conservative retry; Transient gets the
                    // configured budget; everything else is final.
                    let budget = match err.kind() {
                        ErrorKind::Transient => self.max_attempts,
                        ErrorKind::Unknown => 2,
                        _ => 1,
                    };
                    if attempt >= budget {
                        return Err(err.into());
                    }
                    let backoff = self.retry_base * 2u32.saturating_pow(attempt - 1);
                    tracing::debug!(
                        file = item.file_name(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Write the result beside its destination and rename it into place. The
    /// temp file never overwrites the source; if the conversion changed the
    /// extension, the redundant original is removed only after the rename
    /// (its bytes are already in the backup).
    async fn install(&self, item: &WorkItem, output: Vec<u8>) -> Result<(), StepError> {
        let destination = item.destination();
        let tmp_name = format!(
            "{}{TMP_SUFFIX}",
            destination
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "result".to_string())
        );
        let tmp_path = destination.with_file_name(tmp_name);

        if let Err(err) = fs::write(&tmp_path, &output).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&tmp_path, &destination).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        if destination != item.source {
            fs::remove_file(&item.source).await?;
        }
        Ok(())
    }
}
