//! TokenStore — on-disk warm-start copy of the credential cache.
//!
//! File layout:
//!
//! ```text
//! {"tokens": {"<github credential>": {"token": "...", "expires_at": 1747591235}}}
//! ```
//!
//! The file holds long-lived GitHub credentials, so it is created `0600`.
//! Writes go to a sibling temp file first and are renamed into place; a crash
//! mid-write never leaves a truncated file behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::models::token::CopilotToken;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    #[serde(default)]
    tokens: HashMap<String, CopilotToken>,
}

#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every token that has not yet expired at `now`.
    /// A missing file is an empty store.
    pub async fn load(&self, now: DateTime<Utc>) -> Result<HashMap<String, CopilotToken>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };

        let file: TokenFile = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", self.path.display()))?;

        Ok(file
            .tokens
            .into_iter()
            .filter(|(_, token)| !token.is_expired_at(now))
            .collect())
    }

    /// Replaces the file with the tokens still valid at `now`.
    pub async fn save(
        &self,
        tokens: &HashMap<String, CopilotToken>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let file = TokenFile {
            tokens: tokens
                .iter()
                .filter(|(_, token)| !token.is_expired_at(now))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let body = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let tmp = self.tmp_path();
        let mut out = open_private(&tmp)
            .await
            .with_context(|| format!("opening {}", tmp.display()))?;
        out.write_all(&body).await?;
        out.sync_all().await?;
        drop(out);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming into {}", self.path.display()))?;

        tracing::debug!(path = %self.path.display(), count = file.tokens.len(), "token file written");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(unix)]
async fn open_private(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await
}

#[cfg(not(unix))]
async fn open_private(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
}
