use crate::node::{FileId, FolderId};
use crate::paths;
use crate::retrieve::{EngineError, RetrieveOptions, TreeEngine};

/// Outcome of path resolution: the deepest folder reached plus the trailing
/// text held out for prefix matching (empty when the input named a folder
/// outright).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub folder: FolderId,
    pub start_text: String,
}

impl TreeEngine {
    /// Looks up a direct child folder by name. With `force`, a folder whose
    /// listing has not started gets one folders-only page first, never a
    /// second page, so a miss after a Partial listing means "not found so
    /// far", not "not found".
    pub async fn direct_child_folder(
        &self,
        folder: FolderId,
        name: &str,
        force: bool,
    ) -> Result<Option<FolderId>, EngineError> {
        if force {
            let started = { self.tree().await.folder(folder).folders_status().has_started() };
            if !started {
                self.retrieve_children(folder, RetrieveOptions::folders_only())
                    .await?;
            }
        }
        Ok(self.tree().await.folder(folder).child_folder_id(name))
    }

    pub async fn is_direct_child_folder(
        &self,
        folder: FolderId,
        name: &str,
        force: bool,
    ) -> Result<bool, EngineError> {
        Ok(self.direct_child_folder(folder, name, force).await?.is_some())
    }

    pub async fn direct_child_file(
        &self,
        folder: FolderId,
        name: &str,
        force: bool,
    ) -> Result<Option<FileId>, EngineError> {
        if force {
            let started = { self.tree().await.folder(folder).files_status().has_started() };
            if !started {
                self.retrieve_children(folder, RetrieveOptions::shallow())
                    .await?;
            }
        }
        Ok(self.tree().await.folder(folder).child_file_id(name))
    }

    pub async fn is_direct_child_file(
        &self,
        folder: FolderId,
        name: &str,
        force: bool,
    ) -> Result<bool, EngineError> {
        Ok(self.direct_child_file(folder, name, force).await?.is_some())
    }

    /// Walks a multi-segment folder path from `from`, hop by hop.
    pub async fn child_folder(
        &self,
        from: FolderId,
        path: &str,
        force: bool,
    ) -> Result<Option<FolderId>, EngineError> {
        let mut folder = from;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match self.direct_child_folder(folder, segment, force).await? {
                Some(next) => folder = next,
                None => return Ok(None),
            }
        }
        Ok(Some(folder))
    }

    /// Walks a multi-segment file path from `from`: every segment but the
    /// last names a folder, the last names the file.
    pub async fn child_file(
        &self,
        from: FolderId,
        path: &str,
        force: bool,
    ) -> Result<Option<FileId>, EngineError> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((file_name, folders)) = segments.split_last() else {
            return Ok(None);
        };
        let mut folder = from;
        for segment in folders {
            match self.direct_child_folder(folder, segment, force).await? {
                Some(next) => folder = next,
                None => return Ok(None),
            }
        }
        self.direct_child_file(folder, file_name, force).await
    }

    /// Resolves a shell-style path as far as it goes, retrieving folder
    /// listings on demand.
    ///
    /// An empty input resolves to `current`. A relative input is rebased
    /// onto `current`'s path (and fails without one). After normalization
    /// the segments are walked from the root; unless the unnormalized input
    /// ends in a separator, the last segment is not walked but handed back
    /// as `start_text`, so the target itself does not have to exist yet.
    /// `None` means a walked segment was not found.
    pub async fn resolve(
        &self,
        input: &str,
        current: Option<FolderId>,
    ) -> Result<Option<Resolved>, EngineError> {
        if input.is_empty() {
            return Ok(current.map(|folder| Resolved {
                folder,
                start_text: String::new(),
            }));
        }
        let working = if input.starts_with('/') {
            input.to_string()
        } else {
            let Some(current) = current else {
                return Ok(None);
            };
            let base = { self.tree().await.folder(current).path().to_string() };
            format!("{base}/{input}")
        };
        let mut segments = paths::normalize_and_split(&working);
        if segments.first().is_some_and(|s| s.is_empty()) {
            segments.remove(0);
        }
        let start_text = if input.ends_with('/') {
            String::new()
        } else {
            segments.pop().unwrap_or_default()
        };
        let mut folder = { self.tree().await.root() };
        for segment in &segments {
            match self.direct_child_folder(folder, segment, true).await? {
                Some(next) => folder = next,
                None => return Ok(None),
            }
        }
        Ok(Some(Resolved { folder, start_text }))
    }
}
