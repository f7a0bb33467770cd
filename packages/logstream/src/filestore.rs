//! File-backed log client. Keeps per-key logs on the shared volume so they
//! can be fetched after the stage completes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::{Line, LogClient, Result};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Log keys may contain path separators; flatten them so every key maps
    /// to a single file under the root.
    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.replace(['/', '\\'], "-"))
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        self.path_for(key)
    }

    async fn append(&self, path: &Path, lines: &[Line], truncate: bool) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut opts = OpenOptions::new();
        opts.create(true).write(true);
        if truncate {
            opts.truncate(true);
        } else {
            opts.append(true);
        }
        let mut f = opts.open(path).await?;
        for line in lines {
            f.write_all(line.out.as_bytes()).await?;
            if !line.out.ends_with('\n') {
                f.write_all(b"\n").await?;
            }
        }
        f.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl LogClient for FileStore {
    async fn open(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::File::create(&path).await?;
        Ok(())
    }

    async fn write(&self, key: &str, lines: &[Line]) -> Result<()> {
        self.append(&self.path_for(key), lines, false).await
    }

    async fn upload(&self, key: &str, lines: &[Line]) -> Result<()> {
        self.append(&self.path_for(key), lines, true).await
    }

    async fn close(&self, _key: &str) -> Result<()> {
        // files stay on disk for post-hoc fetch
        Ok(())
    }
}
