mod backoff;
mod node;
mod paths;
mod resolve;
mod retrieve;
mod upload;

pub use backoff::Backoff;
pub use node::{
    DriveTree, FileId, FileInput, FileNode, FolderId, FolderInput, FolderNode, RetrievalStatus,
};
pub use paths::{escape, normalize_and_split};
pub use resolve::Resolved;
pub use retrieve::{EngineConfig, EngineError, RetrieveOptions, TreeEngine};
pub use upload::{CHUNK_SIZE, ChunkPlan, UploadClient, UploadConfig, UploadError};

pub(crate) fn read_env_limit(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
