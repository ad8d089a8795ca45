use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::KaikoResult;

/// Per-run directory holding one subdirectory of segment files per representation.
///
/// ```text
/// <root>/
///   720v/
///     init.mp4
///     000000100000.m4s
///     000000102000.m4s
///   audio/
///     ...
/// ```
#[derive(Debug, Clone)]
pub struct SegmentStorage {
    root: PathBuf,
}

impl SegmentStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn representation_dir(&self, representation: &str) -> PathBuf {
        let sanitized: String = representation
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(sanitized)
    }

    pub fn segment_path(&self, representation: &str, index: u64) -> PathBuf {
        self.representation_dir(representation)
            .join(format!("{index:012}.m4s"))
    }

    pub fn init_path(&self, representation: &str) -> PathBuf {
        self.representation_dir(representation).join("init.mp4")
    }

    pub async fn prepare(&self, representation: &str) -> KaikoResult<()> {
        let dir = self.representation_dir(representation);
        if !dir.exists() {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// A non-empty file at `path` is a completed download from an earlier run.
    pub fn is_complete(path: &Path) -> bool {
        path.metadata()
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or_default()
    }

    /// Writes `data` next to `path` first, so `path` only ever holds complete files.
    pub async fn write_atomic(path: &Path, data: &[u8]) -> KaikoResult<()> {
        let mut partial = path.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        let mut file = tokio::fs::File::create(&partial).await?;
        let written = async {
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }

        tokio::fs::rename(&partial, path).await?;
        Ok(())
    }

    pub async fn clear(&self) -> KaikoResult<()> {
        if self.root.exists() {
            tokio::fs::remove_dir_all(&self.root).await?;
        }
        Ok(())
    }

    pub fn location_hint(&self) -> String {
        self.root.display().to_string()
    }
}
