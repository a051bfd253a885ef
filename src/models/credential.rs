use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an API credential with respect to its monthly quota.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Exhausted,
    Invalid,
}

/// An API credential with a metered monthly quota.
///
/// `used_count` is authoritative from the remote service (taken from its
/// usage header after each successful call) and only the credential registry
/// is allowed to mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub used_count: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default = "default_status")]
    pub status: CredentialStatus,
    /// Billing period (`YYYY-MM`) the usage counter belongs to.
    #[serde(default)]
    pub period: String,
}

fn default_limit() -> u32 {
    500
}

fn default_status() -> CredentialStatus {
    CredentialStatus::Active
}

impl Credential {
    pub fn new(name: impl Into<String>, token: impl Into<String>, limit: u32) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            used_count: 0,
            limit,
            status: CredentialStatus::Active,
            period: String::new(),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used_count)
    }

    pub fn is_usable(&self) -> bool {
        self.status == CredentialStatus::Active
    }

    /// Recompute status from the usage counter. Never resurrects an
    /// Invalid credential.
    pub fn refresh_status(&mut self) {
        if self.status == CredentialStatus::Invalid {
            return;
        }
        self.status = if self.used_count >= self.limit {
            CredentialStatus::Exhausted
        } else {
            CredentialStatus::Active
        };
    }
}

/// Billing period identifier for a point in time.
pub fn period_of(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// How the orchestrator picks a credential for a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSelector {
    /// The non-exhausted credential with the greatest remaining capacity.
    Best,
    /// A specific credential by name.
    Named(String),
}
