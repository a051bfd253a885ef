use std::path::{Path, PathBuf};

use tokio::fs;

use crate::models::credential::Credential;

/// JSON-file persistence for the credential set. Read once at the start of a
/// run, written back once at the end; saves go through a temp file and an
/// atomic rename so a crash never truncates the store.
pub struct CredentialStore {
    path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot access credential store: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential store is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Vec<Credential>, StoreError> {
        let raw = fs::read(&self.path).await?;
        let credentials: Vec<Credential> = serde_json::from_slice(&raw)?;
        tracing::debug!(
            path = %self.path.display(),
            count = credentials.len(),
            "Loaded credentials"
        );
        Ok(credentials)
    }

    pub async fn save(&self, credentials: &[Credential]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let raw = serde_json::to_vec_pretty(credentials)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &raw).await?;
        fs::rename(&tmp, &self.path).await?;
        tracing::debug!(
            path = %self.path.display(),
            count = credentials.len(),
            "Saved credentials"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::credential::CredentialStatus;

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));

        let mut cred = Credential::new("main", "tok-123", 500);
        cred.used_count = 42;
        cred.period = "2026-08".to_string();
        store.save(&[cred]).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "main");
        assert_eq!(loaded[0].used_count, 42);
        assert_eq!(loaded[0].status, CredentialStatus::Active);
        assert_eq!(loaded[0].period, "2026-08");
    }

    #[tokio::test]
    async fn test_missing_fields_get_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, r#"[{"name":"a","token":"t"}]"#)
            .await
            .unwrap();

        let loaded = CredentialStore::new(&path).load().await.unwrap();
        assert_eq!(loaded[0].limit, 500);
        assert_eq!(loaded[0].used_count, 0);
        assert_eq!(loaded[0].status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn test_malformed_store_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = CredentialStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Format(_)));
    }
}
