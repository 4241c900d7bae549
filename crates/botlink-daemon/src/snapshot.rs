//! File-backed configuration snapshot.

use anyhow::Context;
use botlink_server::ConfigSource;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Serves the contents of a JSON or TOML file, re-read on every request so
/// edits show up without a restart.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> anyhow::Result<Value> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let is_toml = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let value = if is_toml {
            toml::from_str(&text).with_context(|| format!("invalid TOML in {}", self.path.display()))?
        } else {
            serde_json::from_str(&text)
                .with_context(|| format!("invalid JSON in {}", self.path.display()))?
        };
        Ok(value)
    }
}

impl ConfigSource for FileSource {
    fn snapshot(&self) -> BoxFuture<'_, anyhow::Result<Value>> {
        Box::pin(self.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.json");
        std::fs::write(&path, r#"{"live": {"leverage": 7}}"#).unwrap();

        let source = FileSource::new(&path);
        assert_eq!(source.snapshot().await.unwrap(), json!({"live": {"leverage": 7}}));
    }

    #[tokio::test]
    async fn reads_toml_and_picks_up_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.toml");
        std::fs::write(&path, "[live]\nleverage = 7\n").unwrap();
        let source = FileSource::new(&path);
        assert_eq!(source.snapshot().await.unwrap(), json!({"live": {"leverage": 7}}));

        std::fs::write(&path, "[live]\nleverage = 3\n").unwrap();
        assert_eq!(source.snapshot().await.unwrap(), json!({"live": {"leverage": 3}}));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let source = FileSource::new("/nonexistent/live.json");
        let err = source.snapshot().await.unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/live.json"));
    }
}
