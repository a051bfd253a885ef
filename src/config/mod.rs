use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Directory scanned for input images.
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,

    /// JSON file holding the credential set.
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,

    /// Where pre-transform originals are preserved.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Base URL of the compression service API.
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Pick a specific credential by name instead of the best available.
    #[serde(default)]
    pub credential: Option<String>,

    /// Convert results to this format ("png", "jpg", "webp", "avif").
    #[serde(default)]
    pub target_format: Option<String>,

    /// Resize method ("scale", "fit", "cover", "thumb"); requires at least
    /// one of the dimensions below.
    #[serde(default)]
    pub resize_method: Option<String>,

    #[serde(default)]
    pub resize_width: Option<u32>,

    #[serde(default)]
    pub resize_height: Option<u32>,

    /// Keep copyright/creation/location metadata in the output.
    #[serde(default)]
    pub preserve_metadata: bool,

    /// Maximum simultaneous remote calls (practical range 1-20).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Base adaptive inter-request delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Ceiling for the adaptive delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before its half-open trial.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Attempts per item for transient service failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry backoff in milliseconds (doubles per attempt).
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Largest accepted input file in bytes.
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: u64,

    /// Outstanding tasks are capped at max_concurrent * chunk_multiplier.
    #[serde(default = "default_chunk_multiplier")]
    pub chunk_multiplier: usize,

    /// Stop after this many items.
    #[serde(default)]
    pub max_items: Option<usize>,

    /// Validate and plan only; no remote calls, no file writes.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from(".shrinkray-backup")
}

fn default_api_endpoint() -> String {
    "https://api.tinify.com".to_string()
}

fn default_max_concurrent() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_max_input_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_chunk_multiplier() -> usize {
    4
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::prefixed("SHRINKRAY_").from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: AppConfig = envy::prefixed("SHRINKRAY_UNSET_")
            .from_iter(std::iter::empty::<(String, String)>())
            .unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.base_delay_ms, 100);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown_secs, 30);
        assert_eq!(config.api_endpoint, "https://api.tinify.com");
        assert!(config.credential.is_none());
        assert!(!config.dry_run);
    }
}
