use std::io;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

use odrive_core::{ByteRange, ConflictBehavior, DriveItem, GraphClient, GraphError, RangeAck};

use crate::backoff::Backoff;
use crate::read_env_limit;

/// Upload chunk size. The protocol wants range sizes in multiples of
/// 320 KiB; 20 MiB satisfies that.
pub const CHUNK_SIZE: u64 = 20 * 1024 * 1024;

const MAX_ATTEMPTS: u32 = 4;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("api error: {0}")]
    Api(#[from] GraphError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("source has no file name")]
    MissingFileName,
    #[error("operation cancelled")]
    Cancelled,
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct UploadConfig {
    pub concurrency: usize,
    pub chunk_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: read_env_limit("ODRIVE_UPLOAD_CONCURRENCY", 2),
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// Session-based chunked uploads. Distinct files may upload concurrently
/// under the limiter; within one file the ranges are strictly sequential.
#[derive(Clone)]
pub struct UploadClient {
    client: GraphClient,
    limit: Arc<Semaphore>,
    backoff: Backoff,
    cancel: CancellationToken,
    chunk_size: u64,
}

impl UploadClient {
    pub fn new(client: GraphClient) -> Self {
        Self::with_config(client, UploadConfig::default())
    }

    pub fn with_config(client: GraphClient, config: UploadConfig) -> Self {
        Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: Backoff::default(),
            cancel: CancellationToken::new(),
            chunk_size: config.chunk_size.max(1),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Uploads `source` into the remote folder at `dst_folder`, replacing
    /// any existing item with that name. Returns the finalized item once the
    /// service confirms the last range. The session is closed only when the
    /// transfer did not finish cleanly; a completed session is left alone.
    pub async fn upload_file(
        &self,
        dst_folder: &str,
        source: &Path,
    ) -> Result<Option<DriveItem>, UploadError> {
        let _permit = self
            .limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| UploadError::ConcurrencyClosed)?;
        let file_name = source
            .file_name()
            .ok_or(UploadError::MissingFileName)?
            .to_string_lossy()
            .into_owned();
        let total_size = tokio::fs::metadata(source).await?.len();
        let session = self
            .client
            .create_upload_session(dst_folder, &file_name, ConflictBehavior::Replace)
            .await?;
        debug!("upload session open for {dst_folder}/{file_name}, total_size={total_size}");
        match self.transfer(&session.upload_url, source, total_size).await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => {
                self.close_quietly(&session.upload_url).await;
                Ok(None)
            }
            Err(err) => {
                self.close_quietly(&session.upload_url).await;
                Err(err)
            }
        }
    }

    async fn transfer(
        &self,
        session_url: &Url,
        source: &Path,
        total_size: u64,
    ) -> Result<Option<DriveItem>, UploadError> {
        let mut file = File::open(source).await?;
        let mut last = None;
        for (index, range) in ChunkPlan::new(total_size, self.chunk_size).enumerate() {
            if self.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            let mut chunk = vec![0u8; range.size() as usize];
            file.read_exact(&mut chunk).await?;
            debug!(
                "chunk {index} start/end/size/total {} {} {} {total_size}",
                range.start,
                range.end,
                range.size()
            );
            last = Some(self.send_range(session_url, range, total_size, chunk).await?);
        }
        match last {
            Some(RangeAck::Completed { item }) => Ok(Some(item)),
            _ => Ok(None),
        }
    }

    async fn send_range(
        &self,
        session_url: &Url,
        range: ByteRange,
        total_size: u64,
        bytes: Vec<u8>,
    ) -> Result<RangeAck, UploadError> {
        let mut attempt = 0;
        loop {
            match self
                .client
                .upload_range(session_url, range, total_size, bytes.clone())
                .await
            {
                Ok(ack) => return Ok(ack),
                Err(err) if err.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    debug!(
                        "range {}-{} attempt {attempt} failed, retrying: {err}",
                        range.start, range.end
                    );
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn close_quietly(&self, session_url: &Url) {
        if let Err(err) = self.client.close_session(session_url).await {
            debug!("failed to close upload session: {err}");
        }
    }
}

/// Exact chunk plan for one transfer: inclusive byte ranges partitioning
/// `[0, total_size)`, `ceil(total_size / chunk_size)` of them, contiguous
/// and increasing. The loop count is known up front, so nothing downstream
/// needs runtime guards against a miscomputed plan.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    next_start: u64,
    total_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        Self {
            next_start: 0,
            total_size,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }
}

impl Iterator for ChunkPlan {
    type Item = ByteRange;

    fn next(&mut self) -> Option<ByteRange> {
        if self.next_start >= self.total_size {
            return None;
        }
        let end = self
            .next_start
            .saturating_add(self.chunk_size)
            .min(self.total_size)
            - 1;
        let range = ByteRange {
            start: self.next_start,
            end,
        };
        self.next_start = end + 1;
        Some(range)
    }
}
