//! Local directory used as a mock bucket (implements `ObjectBackend`).

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

#[derive(Clone)]
pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Seed an object; the image pipeline itself never uploads.
    pub async fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut f = fs::File::create(path).await?;
        f.write_all(data).await?;
        f.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl super::client::ObjectBackend for LocalFsBackend {
    async fn head_object(&self, key: &str) -> Result<Option<u64>> {
        match fs::metadata(self.path_for(key)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_object_range(&self, key: &str, offset: u64, len: usize) -> Result<Bytes> {
        let mut f = fs::File::open(self.path_for(key)).await?;
        f.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}
