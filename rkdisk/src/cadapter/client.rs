//! High-level object client wrapping backend range/head operations.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Size of the object in bytes, `None` when it does not exist.
    async fn head_object(&self, key: &str) -> Result<Option<u64>>;

    /// Exactly `len` bytes starting at `offset`; a short object is an error.
    async fn get_object_range(&self, key: &str, offset: u64, len: usize) -> Result<Bytes>;
}

#[derive(Clone)]
pub struct ObjectClient<B: ObjectBackend> {
    backend: B,
}

impl<B: ObjectBackend> ObjectClient<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn head_object(&self, key: &str) -> Result<Option<u64>> {
        self.backend
            .head_object(key)
            .await
            .with_context(|| format!("head_object {key}"))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn get_object_range(&self, key: &str, offset: u64, len: usize) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let data = self
            .backend
            .get_object_range(key, offset, len)
            .await
            .with_context(|| format!("get_object_range {key} @{offset}+{len}"))?;
        if data.len() != len {
            anyhow::bail!(
                "short read from {key}: wanted {len} bytes at {offset}, got {}",
                data.len()
            );
        }
        Ok(data)
    }
}
