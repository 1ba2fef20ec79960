//! Lazy, forward-only byte stream over a disk range.
//!
//! A piece is fetched only when the consumer polls for it, so at most one
//! chunk is in flight and a slow sink throttles the backend. Each piece counts
//! as a read: streaming the whole disk once marks all of it known.

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::VirtualDisk;
use crate::chuck::store::BackingStore;
use crate::error::{DiskError, Result};

impl<S: BackingStore> VirtualDisk<S> {
    /// Stream `[start, end]` (inclusive) in pieces of at most `chunk_size`.
    ///
    /// `None` bounds default to the first and last byte of the disk. The first
    /// error ends the stream; pieces produced before it stay known.
    pub fn stream(
        &self,
        start: Option<u64>,
        end: Option<u64>,
        chunk_size: usize,
    ) -> Result<BoxStream<'_, Result<Bytes>>> {
        if chunk_size == 0 {
            return Err(DiskError::InvalidChunkSize);
        }
        if self.capacity() == 0 && start.is_none() && end.is_none() {
            return Ok(stream::empty().boxed());
        }
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(self.capacity().saturating_sub(1));
        if start > end {
            return Err(DiskError::InvalidRange { start, end });
        }
        if end >= self.capacity() {
            return Err(DiskError::out_of_range(start, end - start + 1, self.capacity()));
        }

        let pieces = stream::unfold(Some(start), move |cursor| async move {
            let pos = cursor?;
            let len = (end - pos + 1).min(chunk_size as u64);
            match self.read(pos, len as usize).await {
                Ok(buf) => {
                    let next = pos + len;
                    Some((Ok(buf), (next <= end).then_some(next)))
                }
                Err(e) => Some((Err(e), None)),
            }
        });
        Ok(pieces.boxed())
    }
}

/// Drain `pieces` into `sink`, calling `on_piece` with each piece's length.
/// Returns the number of bytes written.
pub async fn copy_to_sink<W, F>(
    mut pieces: BoxStream<'_, Result<Bytes>>,
    sink: &mut W,
    mut on_piece: F,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
    F: FnMut(usize),
{
    let mut written = 0u64;
    while let Some(piece) = pieces.next().await {
        let piece = piece?;
        sink.write_all(&piece).await?;
        written += piece.len() as u64;
        on_piece(piece.len());
    }
    sink.flush().await?;
    Ok(written)
}
