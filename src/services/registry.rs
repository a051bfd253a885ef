use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::models::credential::{period_of, Credential, CredentialStatus};

/// Credential selection failures. "No candidates" is a reported condition,
/// never a panic; the remaining-capacity table lets the caller present
/// alternatives.
#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("no credential has {required} compressions remaining this period")]
    NoCapacity {
        required: u32,
        /// (name, remaining) for every registered credential.
        remaining: Vec<(String, u32)>,
    },

    #[error("no credential named '{0}'")]
    NotFound(String),
}

/// Owner of all credential state. The registry is the only writer of
/// `used_count` and `status`; concurrent in-flight items funnel their usage
/// reports through its single mutex, so updates are applied one at a time in
/// arrival order.
pub struct CredentialRegistry {
    inner: Mutex<Vec<Credential>>,
}

impl CredentialRegistry {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            inner: Mutex::new(credentials),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Credential>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The usable credential with the greatest remaining capacity that can
    /// cover `required` more calls. Ties break by registration order.
    pub fn select_best(&self, required: u32) -> Result<Credential, SelectError> {
        let creds = self.lock();
        let mut best: Option<&Credential> = None;
        for cred in creds.iter() {
            if !cred.is_usable() || cred.remaining() < required.max(1) {
                continue;
            }
            // Strictly greater keeps the earliest-registered on ties.
            if best.map(|b| cred.remaining() > b.remaining()).unwrap_or(true) {
                best = Some(cred);
            }
        }
        best.cloned()
            .ok_or_else(|| SelectError::NoCapacity {
                required,
                remaining: creds.iter().map(|c| (c.name.clone(), c.remaining())).collect(),
            })
    }

    pub fn select_named(&self, name: &str) -> Result<Credential, SelectError> {
        self.lock()
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| SelectError::NotFound(name.to_string()))
    }

    /// Apply a service-reported cumulative usage count. Monotonic within a
    /// period: a stale (lower) report never rolls the counter back. Returns
    /// the credential's status after the update.
    pub fn record_usage(&self, name: &str, reported: u32) -> Option<CredentialStatus> {
        let mut creds = self.lock();
        let cred = creds.iter_mut().find(|c| c.name == name)?;
        if reported > cred.used_count {
            cred.used_count = reported;
            cred.refresh_status();
        }
        tracing::debug!(
            credential = name,
            used = cred.used_count,
            limit = cred.limit,
            "Recorded service usage"
        );
        Some(cred.status)
    }

    /// Stop selecting this credential for the remainder of the run.
    pub fn mark_invalid(&self, name: &str) {
        let mut creds = self.lock();
        if let Some(cred) = creds.iter_mut().find(|c| c.name == name) {
            cred.status = CredentialStatus::Invalid;
            tracing::warn!(credential = name, "Credential marked invalid");
        }
    }

    /// Zero usage counters whose billing period has rolled over. Idempotent;
    /// called before any selection.
    pub fn reset_if_new_period(&self, now: DateTime<Utc>) {
        let period = period_of(now);
        let mut creds = self.lock();
        for cred in creds.iter_mut() {
            if cred.period != period {
                cred.used_count = 0;
                cred.period = period.clone();
                if cred.status == CredentialStatus::Exhausted {
                    cred.status = CredentialStatus::Active;
                }
                tracing::info!(credential = %cred.name, period = %period, "Quota period reset");
            }
        }
    }

    pub fn remaining(&self, name: &str) -> Option<u32> {
        self.lock().iter().find(|c| c.name == name).map(|c| c.remaining())
    }

    pub fn snapshot(&self) -> Vec<Credential> {
        self.lock().clone()
    }
}
