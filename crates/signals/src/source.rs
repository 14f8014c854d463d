//! The signal-source seam.
//!
//! The upstream feed (and its authentication/session handling) is a
//! collaborator behind this trait. Absence of a message means "no signals
//! available right now", never an error.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Latest raw text blob from the feed, if any.
    async fn latest_message(&self) -> Result<Option<String>>;
}

/// Fixed-text source, used in tests and as the manual-entry carrier.
pub struct StaticSource {
    text: Option<String>,
}

impl StaticSource {
    pub fn new(text: Option<String>) -> Self {
        Self { text }
    }
}

#[async_trait]
impl SignalSource for StaticSource {
    async fn latest_message(&self) -> Result<Option<String>> {
        Ok(self.text.clone())
    }
}

/// Reads the latest feed dump from a file. A missing file is "no signals".
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SignalSource for FileSource {
    async fn latest_message(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(None),
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
