use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::data::parser::decode_latin1;
use crate::error::{RecError, Result};

/// Byte-stream provider for record texts, addressed by logical name.
///
/// A missing name propagates as `RecError::DataSource`; the core never
/// swallows a fetch failure.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<String>;
}

/// Reads record files from a directory, decoding Latin-1 (the encoding the
/// classic rating dumps ship with).
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DataSource for FileSource {
    async fn fetch(&self, name: &str) -> Result<String> {
        let path = self.root.join(name);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| RecError::DataSource {
                name: name.to_string(),
                source,
            })?;
        Ok(decode_latin1(&bytes))
    }
}

/// In-memory source for tests and demos.
#[derive(Default)]
pub struct MemorySource {
    entries: HashMap<String, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, text: &str) -> Self {
        self.entries.insert(name.to_string(), text.to_string());
        self
    }
}

#[async_trait]
impl DataSource for MemorySource {
    async fn fetch(&self, name: &str) -> Result<String> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| RecError::DataSource {
                name: name.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such entry"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_roundtrip() {
        let source = MemorySource::new().with("u.data", "1\t2\t3\t4");
        assert_eq!(source.fetch("u.data").await.unwrap(), "1\t2\t3\t4");
    }

    #[tokio::test]
    async fn test_missing_entry_propagates() {
        let source = MemorySource::new();
        let err = source.fetch("u.data").await.unwrap_err();
        assert!(matches!(err, RecError::DataSource { .. }));
    }

    #[tokio::test]
    async fn test_file_source_missing_file() {
        let source = FileSource::new("/nonexistent-towerec-dir");
        let err = source.fetch("u.data").await.unwrap_err();
        assert!(matches!(err, RecError::DataSource { .. }));
    }
}
