use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, TryStreamExt};
use log::debug;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{Mutex, MutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;

use odrive_core::{ChildrenPage, DriveItem, GraphClient, GraphError, ItemKind};

use crate::backoff::Backoff;
use crate::node::{DriveTree, FileInput, FolderId, FolderInput, FolderNode, RetrievalStatus};
use crate::read_env_limit;

const MAX_ATTEMPTS: u32 = 4;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("api error: {0}")]
    Api(#[from] GraphError),
    #[error("time parse error: {0}")]
    Time(#[from] time::error::Parse),
    #[error("created entry is not a folder: {0}")]
    NotAFolder(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrieveOptions {
    pub only_folders: bool,
    pub recursive: bool,
    pub depth: u32,
}

impl RetrieveOptions {
    /// One page of this folder only, files included.
    pub fn shallow() -> Self {
        Self {
            only_folders: false,
            recursive: false,
            depth: 1,
        }
    }

    /// One page of this folder's subfolders; file entries are neither
    /// fetched nor materialized.
    pub fn folders_only() -> Self {
        Self {
            only_folders: true,
            ..Self::shallow()
        }
    }

    /// Depth-limited descent into newly discovered subfolders.
    pub fn recursive(depth: u32) -> Self {
        Self {
            only_folders: false,
            recursive: true,
            depth,
        }
    }
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self::shallow()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub list_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            list_concurrency: read_env_limit("ODRIVE_LIST_CONCURRENCY", 4),
        }
    }
}

/// Client-side mirror of the remote tree: owns the node arena and fetches
/// folder listings on demand, one page at a time.
pub struct TreeEngine {
    client: GraphClient,
    tree: Mutex<DriveTree>,
    list_limit: Arc<Semaphore>,
    list_width: usize,
    backoff: Backoff,
    cancel: CancellationToken,
}

impl TreeEngine {
    pub fn new(client: GraphClient) -> Self {
        Self::with_config(client, EngineConfig::default())
    }

    pub fn with_config(client: GraphClient, config: EngineConfig) -> Self {
        let width = config.list_concurrency.max(1);
        Self {
            client,
            tree: Mutex::new(DriveTree::new()),
            list_limit: Arc::new(Semaphore::new(width)),
            list_width: width,
            backoff: Backoff::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn tree(&self) -> MutexGuard<'_, DriveTree> {
        self.tree.lock().await
    }

    /// Fetches the next page of `folder`'s children and merges it into the
    /// tree. A no-op once the relevant statuses are Complete, or when
    /// `depth` is zero. A Partial listing resumes from the stored cursor;
    /// the cursor from page N is required to fetch page N+1, so pages of one
    /// folder are never fetched in parallel. With `recursive`, every newly
    /// discovered child folder is visited with `depth - 1` before this call
    /// returns, siblings fanned out under the listing concurrency cap.
    ///
    /// On a gateway error the page is abandoned: children merged from
    /// earlier pages stay, statuses stay, and the call is safe to retry.
    pub async fn retrieve_children(
        &self,
        folder: FolderId,
        opts: RetrieveOptions,
    ) -> Result<(), EngineError> {
        self.retrieve_inner(folder, opts).await
    }

    fn retrieve_inner(
        &self,
        folder: FolderId,
        opts: RetrieveOptions,
    ) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            if opts.depth == 0 {
                return Ok(());
            }
            let (path, cursor) = {
                let tree = self.tree.lock().await;
                let node = tree.folder(folder);
                if listing_done(node, opts.only_folders) {
                    return Ok(());
                }
                (node.path().to_string(), node.cursor().map(str::to_string))
            };
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            debug!(
                "retrieve children of {path:?} only_folders={} depth={}",
                opts.only_folders, opts.depth
            );
            let page = {
                let _permit = self
                    .list_limit
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| EngineError::ConcurrencyClosed)?;
                self.fetch_page(&path, cursor.as_deref(), opts.only_folders)
                    .await?
            };
            let ChildrenPage { items, next_link } = page;
            let staged = stage_entries(items, opts.only_folders)?;
            let new_folders = {
                let mut tree = self.tree.lock().await;
                let mut new_folders = Vec::new();
                for entry in staged {
                    match entry {
                        Staged::Folder(input) => new_folders.push(tree.add_folder(folder, input)),
                        Staged::File(input) => {
                            tree.add_file(folder, input);
                        }
                    }
                }
                tree.inject_dot_entries(folder);
                let status = if next_link.is_some() {
                    RetrievalStatus::Partial
                } else {
                    RetrievalStatus::Complete
                };
                let node = tree.folder_mut(folder);
                node.advance_folders_status(status);
                if !opts.only_folders {
                    node.advance_files_status(status);
                }
                node.set_cursor(next_link);
                new_folders
            };
            if opts.recursive && !new_folders.is_empty() {
                let child_opts = RetrieveOptions {
                    depth: opts.depth - 1,
                    ..opts
                };
                stream::iter(new_folders.into_iter().map(Ok::<FolderId, EngineError>))
                    .try_for_each_concurrent(self.list_width, |child| {
                        self.retrieve_inner(child, child_opts)
                    })
                    .await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Pages through a folder's listing until it is Complete.
    pub async fn retrieve_children_all(
        &self,
        folder: FolderId,
        only_folders: bool,
    ) -> Result<(), EngineError> {
        loop {
            {
                let tree = self.tree.lock().await;
                if listing_done(tree.folder(folder), only_folders) {
                    return Ok(());
                }
            }
            self.retrieve_children(
                folder,
                RetrieveOptions {
                    only_folders,
                    recursive: false,
                    depth: 1,
                },
            )
            .await?;
        }
    }

    /// Creates a subfolder remotely and merges it into the tree, keeping a
    /// known child count in step.
    pub async fn create_subfolder(
        &self,
        parent: FolderId,
        name: &str,
    ) -> Result<FolderId, EngineError> {
        let parent_path = { self.tree.lock().await.folder(parent).path().to_string() };
        let item = self.client.create_folder(&parent_path, name).await?;
        let input = folder_input(item)?;
        let mut tree = self.tree.lock().await;
        let id = tree.add_folder(parent, input);
        let node = tree.folder_mut(parent);
        if let Some(count) = node.child_count {
            node.child_count = Some(count + 1);
        }
        Ok(id)
    }

    async fn fetch_page(
        &self,
        path: &str,
        cursor: Option<&str>,
        only_folders: bool,
    ) -> Result<ChildrenPage, EngineError> {
        let mut attempt = 0;
        loop {
            match self.client.list_children(path, cursor, only_folders).await {
                Ok(page) => return Ok(page),
                Err(err) if err.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    debug!("listing of {path:?} attempt {attempt} failed, retrying: {err}");
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn listing_done(node: &FolderNode, only_folders: bool) -> bool {
    if only_folders {
        node.folders_status().is_complete()
    } else {
        node.folders_status().is_complete() && node.files_status().is_complete()
    }
}

enum Staged {
    Folder(FolderInput),
    File(FileInput),
}

fn stage_entries(items: Vec<DriveItem>, only_folders: bool) -> Result<Vec<Staged>, EngineError> {
    let mut staged = Vec::with_capacity(items.len());
    for item in items {
        match item.kind {
            ItemKind::Folder { .. } => staged.push(Staged::Folder(folder_input(item)?)),
            ItemKind::File { .. } if only_folders => {}
            ItemKind::File { file } => {
                let hashes = file.hashes.unwrap_or_default();
                staged.push(Staged::File(FileInput {
                    size: item.size.unwrap_or(0),
                    quick_xor_hash: hashes.quick_xor_hash,
                    sha1_hash: hashes.sha1_hash,
                    created: parse_timestamp(item.created.as_deref())?,
                    modified: parse_timestamp(item.modified.as_deref())?,
                    remote_id: item.id,
                    name: item.name,
                }));
            }
        }
    }
    Ok(staged)
}

fn folder_input(item: DriveItem) -> Result<FolderInput, EngineError> {
    let ItemKind::Folder { folder } = item.kind else {
        return Err(EngineError::NotAFolder(item.name));
    };
    Ok(FolderInput {
        child_count: folder.child_count,
        size: item.size,
        created: parse_timestamp(item.created.as_deref())?,
        modified: parse_timestamp(item.modified.as_deref())?,
        remote_id: item.id,
        name: item.name,
    })
}

fn parse_timestamp(value: Option<&str>) -> Result<Option<OffsetDateTime>, time::error::Parse> {
    let Some(value) = value else {
        return Ok(None);
    };
    Ok(Some(OffsetDateTime::parse(value, &Rfc3339)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine(server: &MockServer) -> TreeEngine {
        let client = GraphClient::with_base_url(&server.uri(), "test-token").unwrap();
        TreeEngine::new(client)
    }

    async fn seed_folder(engine: &TreeEngine, name: &str) -> FolderId {
        let mut tree = engine.tree().await;
        let root = tree.root();
        tree.add_folder(
            root,
            FolderInput {
                remote_id: format!("id-{name}"),
                name: name.to_string(),
                child_count: None,
                size: None,
                created: None,
                modified: None,
            },
        )
    }

    fn folder_json(id: &str, name: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": name,
            "size": 0,
            "createdDateTime": "2024-01-01T00:00:00Z",
            "lastModifiedDateTime": "2024-01-02T00:00:00Z",
            "folder": { "childCount": 0 }
        })
    }

    fn file_json(id: &str, name: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": name,
            "size": 5,
            "file": { "hashes": { "quickXorHash": "qxh", "sha1Hash": "s1h" } }
        })
    }

    #[tokio::test]
    async fn pages_merge_in_order_and_complete_without_refetching() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/drive/root:/Reports:/children"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [folder_json("a", "FolderA"), file_json("b", "FileB")],
                "@odata.nextLink": format!("{}/page-two", server.uri())
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/page-two"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [folder_json("c", "FolderC")]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine(&server);
        let reports = seed_folder(&engine, "Reports").await;

        engine
            .retrieve_children(reports, RetrieveOptions::shallow())
            .await
            .unwrap();
        {
            let tree = engine.tree().await;
            let node = tree.folder(reports);
            assert_eq!(node.folders_status(), RetrievalStatus::Partial);
            assert_eq!(node.files_status(), RetrievalStatus::Partial);
            assert!(node.cursor().is_some());
        }

        engine
            .retrieve_children(reports, RetrieveOptions::shallow())
            .await
            .unwrap();
        let tree = engine.tree().await;
        let node = tree.folder(reports);
        assert_eq!(node.folders_status(), RetrievalStatus::Complete);
        assert_eq!(node.files_status(), RetrievalStatus::Complete);
        assert!(node.cursor().is_none());

        let names: Vec<&str> = node
            .children_folders()
            .iter()
            .map(|id| tree.folder(*id).name())
            .collect();
        assert_eq!(names, ["FolderA", "FolderC"]);
        assert!(node.has_child_file("FileB"));
        // Lookup after Complete resolves from the tree; the expect(1) mocks
        // verify no further request goes out.
        assert!(node.has_child_folder("FolderA"));
    }

    #[tokio::test]
    async fn complete_listing_is_never_refetched() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/drive/root:/Docs:/children"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [folder_json("a", "Sub")]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine(&server);
        let docs = seed_folder(&engine, "Docs").await;

        engine.retrieve_children_all(docs, false).await.unwrap();
        engine
            .retrieve_children(docs, RetrieveOptions::shallow())
            .await
            .unwrap();
        engine.retrieve_children_all(docs, false).await.unwrap();

        let tree = engine.tree().await;
        assert_eq!(tree.folder(docs).children_folders().len(), 1);
    }

    #[tokio::test]
    async fn folders_only_leaves_files_unfetched() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/drive/root:/Docs:/children"))
            .and(query_param("$filter", "folder ne null"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [folder_json("a", "Sub")]
            })))
            .mount(&server)
            .await;

        let engine = engine(&server);
        let docs = seed_folder(&engine, "Docs").await;

        engine
            .retrieve_children(docs, RetrieveOptions::folders_only())
            .await
            .unwrap();

        let tree = engine.tree().await;
        let node = tree.folder(docs);
        assert_eq!(node.folders_status(), RetrievalStatus::Complete);
        assert_eq!(node.files_status(), RetrievalStatus::NotStarted);
        assert!(node.children_files().is_empty());
    }

    #[tokio::test]
    async fn gateway_error_abandons_the_page_and_keeps_state() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/drive/root:/Docs:/children"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "code": "itemNotFound", "message": "gone" }
            })))
            .mount(&server)
            .await;

        let engine = engine(&server);
        let docs = seed_folder(&engine, "Docs").await;

        let err = engine
            .retrieve_children(docs, RetrieveOptions::shallow())
            .await
            .expect_err("listing should fail");
        assert!(matches!(
            &err,
            EngineError::Api(GraphError::Api { code, .. }) if code == "itemNotFound"
        ));

        let tree = engine.tree().await;
        let node = tree.folder(docs);
        assert_eq!(node.folders_status(), RetrievalStatus::NotStarted);
        assert!(node.children_folders().is_empty());
    }

    #[tokio::test]
    async fn transient_listing_failure_is_retried() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/drive/root:/Docs:/children"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/drive/root:/Docs:/children"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [folder_json("a", "Sub")]
            })))
            .mount(&server)
            .await;

        let engine = engine(&server);
        let docs = seed_folder(&engine, "Docs").await;

        engine
            .retrieve_children(docs, RetrieveOptions::shallow())
            .await
            .unwrap();

        let tree = engine.tree().await;
        assert_eq!(tree.folder(docs).folders_status(), RetrievalStatus::Complete);
    }

    #[tokio::test]
    async fn recursion_visits_new_children_within_the_depth_limit() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/drive/root/children"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [folder_json("a", "A")]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/drive/root:/A:/children"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [folder_json("b", "B")]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine(&server);
        let root = { engine.tree().await.root() };

        engine
            .retrieve_children(root, RetrieveOptions::recursive(2))
            .await
            .unwrap();

        let tree = engine.tree().await;
        let a = tree.folder(root).child_folder_id("A").unwrap();
        let b = tree.folder(a).child_folder_id("B").unwrap();
        assert_eq!(tree.folder(a).folders_status(), RetrievalStatus::Complete);
        // Depth ran out at B: discovered, never listed.
        assert_eq!(tree.folder(b).folders_status(), RetrievalStatus::NotStarted);
    }

    #[tokio::test]
    async fn cancellation_is_checked_before_each_page() {
        let server = MockServer::start().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let client = GraphClient::with_base_url(&server.uri(), "test-token").unwrap();
        let engine = TreeEngine::new(client).with_cancellation(cancel);
        let docs = seed_folder(&engine, "Docs").await;

        let err = engine
            .retrieve_children(docs, RetrieveOptions::shallow())
            .await
            .expect_err("cancelled engine should not fetch");
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn create_subfolder_merges_the_created_entry() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1.0/me/drive/root:/Docs:/children"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "new-id",
                "name": "Reports",
                "size": 0,
                "folder": { "childCount": 0 }
            })))
            .mount(&server)
            .await;

        let engine = engine(&server);
        let docs = seed_folder(&engine, "Docs").await;
        {
            let mut tree = engine.tree().await;
            tree.folder_mut(docs).child_count = Some(1);
        }

        let created = engine.create_subfolder(docs, "Reports").await.unwrap();

        let tree = engine.tree().await;
        assert_eq!(tree.folder(created).path(), "/Docs/Reports");
        assert_eq!(tree.folder(created).remote_id(), Some("new-id"));
        assert_eq!(tree.folder(docs).child_count, Some(2));
        assert_eq!(tree.folder(docs).child_folder_id("Reports"), Some(created));
    }
}
