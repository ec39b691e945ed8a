use std::collections::HashMap;

use time::OffsetDateTime;

/// Handle into the tree's folder arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FolderId(pub(crate) usize);

/// Handle into the tree's file arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub(crate) usize);

/// How much of a folder's children has been fetched so far. Only ever moves
/// forward: NotStarted -> Partial -> Complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RetrievalStatus {
    #[default]
    NotStarted,
    Partial,
    Complete,
}

impl RetrievalStatus {
    pub fn has_started(self) -> bool {
        !matches!(self, RetrievalStatus::NotStarted)
    }

    pub fn is_complete(self) -> bool {
        matches!(self, RetrievalStatus::Complete)
    }
}

#[derive(Debug)]
pub struct FolderNode {
    remote_id: Option<String>,
    path: String,
    name: String,
    pub child_count: Option<u64>,
    pub size: Option<u64>,
    pub created: Option<OffsetDateTime>,
    pub modified: Option<OffsetDateTime>,
    parent: Option<FolderId>,
    children_folders: Vec<FolderId>,
    children_files: Vec<FileId>,
    folder_names: HashMap<String, FolderId>,
    file_names: HashMap<String, FileId>,
    files_status: RetrievalStatus,
    folders_status: RetrievalStatus,
    cursor: Option<String>,
    dot_entries: bool,
}

impl FolderNode {
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<FolderId> {
        self.parent
    }

    /// Child folders in discovery order. Re-inserting a name appends again;
    /// the name lookup only ever sees the latest entry.
    pub fn children_folders(&self) -> &[FolderId] {
        &self.children_folders
    }

    pub fn children_files(&self) -> &[FileId] {
        &self.children_files
    }

    pub fn files_status(&self) -> RetrievalStatus {
        self.files_status
    }

    pub fn folders_status(&self) -> RetrievalStatus {
        self.folders_status
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn child_folder_id(&self, name: &str) -> Option<FolderId> {
        self.folder_names.get(name).copied()
    }

    pub fn child_file_id(&self, name: &str) -> Option<FileId> {
        self.file_names.get(name).copied()
    }

    pub fn has_child_folder(&self, name: &str) -> bool {
        self.folder_names.contains_key(name)
    }

    pub fn has_child_file(&self, name: &str) -> bool {
        self.file_names.contains_key(name)
    }

    pub(crate) fn advance_folders_status(&mut self, to: RetrievalStatus) {
        if to > self.folders_status {
            self.folders_status = to;
        }
    }

    pub(crate) fn advance_files_status(&mut self, to: RetrievalStatus) {
        if to > self.files_status {
            self.files_status = to;
        }
    }

    pub(crate) fn set_cursor(&mut self, cursor: Option<String>) {
        self.cursor = cursor;
    }
}

#[derive(Debug)]
pub struct FileNode {
    remote_id: String,
    name: String,
    parent_path: String,
    pub size: u64,
    pub quick_xor_hash: Option<String>,
    pub sha1_hash: Option<String>,
    pub created: Option<OffsetDateTime>,
    pub modified: Option<OffsetDateTime>,
}

impl FileNode {
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_path(&self) -> &str {
        &self.parent_path
    }

    pub fn path(&self) -> String {
        format!("{}/{}", self.parent_path, self.name)
    }
}

/// New-folder data as decoded from a listing or creation response.
#[derive(Debug)]
pub struct FolderInput {
    pub remote_id: String,
    pub name: String,
    pub child_count: Option<u64>,
    pub size: Option<u64>,
    pub created: Option<OffsetDateTime>,
    pub modified: Option<OffsetDateTime>,
}

#[derive(Debug)]
pub struct FileInput {
    pub remote_id: String,
    pub name: String,
    pub size: u64,
    pub quick_xor_hash: Option<String>,
    pub sha1_hash: Option<String>,
    pub created: Option<OffsetDateTime>,
    pub modified: Option<OffsetDateTime>,
}

/// Arena-owned mirror of the remote folder tree. All nodes live here and are
/// addressed by id; parent links are ids too, so the tree has no reference
/// cycles and handles stay `Copy`.
#[derive(Debug)]
pub struct DriveTree {
    folders: Vec<FolderNode>,
    files: Vec<FileNode>,
    root: FolderId,
}

impl DriveTree {
    /// Creates the tree with a virtual root. The root mirrors the drive root,
    /// whose path is the empty string; it has no remote id until one is
    /// learned from the service.
    pub fn new() -> Self {
        let root = FolderNode {
            remote_id: None,
            path: String::new(),
            name: String::new(),
            child_count: None,
            size: None,
            created: None,
            modified: None,
            parent: None,
            children_folders: Vec::new(),
            children_files: Vec::new(),
            folder_names: HashMap::new(),
            file_names: HashMap::new(),
            files_status: RetrievalStatus::NotStarted,
            folders_status: RetrievalStatus::NotStarted,
            cursor: None,
            dot_entries: false,
        };
        Self {
            folders: vec![root],
            files: Vec::new(),
            root: FolderId(0),
        }
    }

    pub fn root(&self) -> FolderId {
        self.root
    }

    pub fn folder(&self, id: FolderId) -> &FolderNode {
        &self.folders[id.0]
    }

    pub fn file(&self, id: FileId) -> &FileNode {
        &self.files[id.0]
    }

    pub(crate) fn folder_mut(&mut self, id: FolderId) -> &mut FolderNode {
        &mut self.folders[id.0]
    }

    /// Appends a child folder and points the name lookup at it. A repeated
    /// name appends again (the ordered sequence keeps every insertion) while
    /// the lookup is overwritten, which is what a refresh relies on.
    pub fn add_folder(&mut self, parent: FolderId, input: FolderInput) -> FolderId {
        let path = format!("{}/{}", self.folders[parent.0].path, input.name);
        let name = input.name.clone();
        let id = FolderId(self.folders.len());
        self.folders.push(FolderNode {
            remote_id: Some(input.remote_id),
            path,
            name: input.name,
            child_count: input.child_count,
            size: input.size,
            created: input.created,
            modified: input.modified,
            parent: Some(parent),
            children_folders: Vec::new(),
            children_files: Vec::new(),
            folder_names: HashMap::new(),
            file_names: HashMap::new(),
            files_status: RetrievalStatus::NotStarted,
            folders_status: RetrievalStatus::NotStarted,
            cursor: None,
            dot_entries: false,
        });
        let node = &mut self.folders[parent.0];
        node.children_folders.push(id);
        node.folder_names.insert(name, id);
        id
    }

    pub fn add_file(&mut self, parent: FolderId, input: FileInput) -> FileId {
        let parent_path = self.folders[parent.0].path.clone();
        let name = input.name.clone();
        let id = FileId(self.files.len());
        self.files.push(FileNode {
            remote_id: input.remote_id,
            name: input.name,
            parent_path,
            size: input.size,
            quick_xor_hash: input.quick_xor_hash,
            sha1_hash: input.sha1_hash,
            created: input.created,
            modified: input.modified,
        });
        let node = &mut self.folders[parent.0];
        node.children_files.push(id);
        node.file_names.insert(name, id);
        id
    }

    /// Injects the synthetic "." and ".." lookup entries, once, after the
    /// first listing page has been merged. They are reachable through name
    /// lookup only, never through the ordered child sequence. The root has
    /// no parent and therefore no "..".
    pub(crate) fn inject_dot_entries(&mut self, id: FolderId) {
        if self.folders[id.0].dot_entries {
            return;
        }
        let parent = self.folders[id.0].parent;
        let node = &mut self.folders[id.0];
        node.folder_names.insert(".".to_string(), id);
        if let Some(parent) = parent {
            node.folder_names.insert("..".to_string(), parent);
        }
        node.dot_entries = true;
    }
}

impl Default for DriveTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder_input(name: &str) -> FolderInput {
        FolderInput {
            remote_id: format!("id-{name}"),
            name: name.to_string(),
            child_count: Some(0),
            size: Some(0),
            created: None,
            modified: None,
        }
    }

    fn file_input(name: &str) -> FileInput {
        FileInput {
            remote_id: format!("id-{name}"),
            name: name.to_string(),
            size: 1,
            quick_xor_hash: None,
            sha1_hash: None,
            created: None,
            modified: None,
        }
    }

    #[test]
    fn paths_derive_from_the_parent() {
        let mut tree = DriveTree::new();
        let docs = tree.add_folder(tree.root(), folder_input("Docs"));
        let reports = tree.add_folder(docs, folder_input("Reports"));
        let file = tree.add_file(reports, file_input("A.txt"));

        assert_eq!(tree.folder(docs).path(), "/Docs");
        assert_eq!(tree.folder(reports).path(), "/Docs/Reports");
        assert_eq!(tree.file(file).path(), "/Docs/Reports/A.txt");
        assert_eq!(tree.folder(reports).parent(), Some(docs));
    }

    #[test]
    fn insertion_order_is_preserved_and_lookup_takes_the_latest() {
        let mut tree = DriveTree::new();
        let root = tree.root();
        let first = tree.add_folder(root, folder_input("Docs"));
        let second = tree.add_folder(root, folder_input("Docs"));

        let node = tree.folder(root);
        assert_eq!(node.children_folders(), [first, second]);
        assert_eq!(node.child_folder_id("Docs"), Some(second));
    }

    #[test]
    fn file_and_folder_name_spaces_are_independent() {
        let mut tree = DriveTree::new();
        let root = tree.root();
        let folder = tree.add_folder(root, folder_input("Same"));
        let file = tree.add_file(root, file_input("Same"));

        let node = tree.folder(root);
        assert_eq!(node.child_folder_id("Same"), Some(folder));
        assert_eq!(node.child_file_id("Same"), Some(file));
    }

    #[test]
    fn dot_entries_are_lookup_only_and_injected_once() {
        let mut tree = DriveTree::new();
        let root = tree.root();
        let docs = tree.add_folder(root, folder_input("Docs"));
        tree.inject_dot_entries(docs);
        tree.inject_dot_entries(docs);

        let node = tree.folder(docs);
        assert_eq!(node.child_folder_id("."), Some(docs));
        assert_eq!(node.child_folder_id(".."), Some(root));
        assert!(node.children_folders().is_empty());
    }

    #[test]
    fn the_root_has_no_parent_entry() {
        let mut tree = DriveTree::new();
        let root = tree.root();
        tree.inject_dot_entries(root);

        let node = tree.folder(root);
        assert_eq!(node.child_folder_id("."), Some(root));
        assert_eq!(node.child_folder_id(".."), None);
    }

    #[test]
    fn statuses_never_move_backwards() {
        let mut tree = DriveTree::new();
        let root = tree.root();
        tree.folder_mut(root)
            .advance_folders_status(RetrievalStatus::Complete);
        tree.folder_mut(root)
            .advance_folders_status(RetrievalStatus::Partial);

        assert_eq!(
            tree.folder(root).folders_status(),
            RetrievalStatus::Complete
        );
    }
}
