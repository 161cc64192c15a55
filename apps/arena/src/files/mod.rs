//! Typed file operations over the control channel.
//!
//! Mutations are applied to the local [`Workspace`] first and reverted from an
//! undo log when the server rejects them. Saves are one-way; the server's
//! `file_updated` push clears the per-path pending-ack counter.

mod undo;

use crate::bootstrap::ErrorCode;
use crate::socket::{SocketClient, SocketError};
use crate::tree::{FileTree, FileTreeNode, normalize};
use arena_proto::{ControlRequest, DirContent, FileContent, FileRecord, FileUpdated};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use undo::UndoLog;

/// Cached file contents keyed by normalized path.
pub type ContentCache = BTreeMap<String, String>;

/// Tree mirror plus content cache, replaced atomically on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workspace {
    pub tree: FileTree,
    pub contents: ContentCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOp {
    Load,
    Save,
    Create,
    Delete,
    Rename,
    ListDir,
}

impl FileOp {
    pub fn code(self) -> ErrorCode {
        match self {
            FileOp::Load => ErrorCode::FileLoadFailed,
            FileOp::Save => ErrorCode::FileSaveFailed,
            FileOp::Create => ErrorCode::FileCreateFailed,
            FileOp::Delete => ErrorCode::FileDeleteFailed,
            FileOp::Rename => ErrorCode::FileRenameFailed,
            FileOp::ListDir => ErrorCode::DirLoadFailed,
        }
    }
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileOp::Load => "load",
            FileOp::Save => "save",
            FileOp::Create => "create",
            FileOp::Delete => "delete",
            FileOp::Rename => "rename",
            FileOp::ListDir => "list directory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileError {
    #[error("{op} failed for {path}: {source}")]
    Operation {
        op: FileOp,
        path: String,
        source: SocketError,
    },
    #[error("{op} failed for {path}: {reason}")]
    Invalid {
        op: FileOp,
        path: String,
        reason: &'static str,
    },
    #[error("{path} changed on the server while a save was pending")]
    SaveConflict { path: String },
}

impl FileError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FileError::Operation { op, .. } | FileError::Invalid { op, .. } => op.code(),
            FileError::SaveConflict { .. } => ErrorCode::FileSaveConflict,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            FileError::Operation { path, .. }
            | FileError::Invalid { path, .. }
            | FileError::SaveConflict { path } => path,
        }
    }

    fn operation(op: FileOp, path: &str, source: SocketError) -> Self {
        FileError::Operation {
            op,
            path: path.to_string(),
            source,
        }
    }
}

type DirLoad = Shared<BoxFuture<'static, Result<Vec<FileRecord>, FileError>>>;

struct Inner {
    socket: SocketClient,
    url: String,
    workspace: watch::Sender<Workspace>,
    pending_acks: Mutex<HashMap<String, u32>>,
    dir_loads: Mutex<HashMap<String, DirLoad>>,
}

#[derive(Clone)]
pub struct Files {
    inner: Arc<Inner>,
}

impl fmt::Debug for Files {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Files")
            .field("url", &self.inner.url)
            .field("pending_saves", &self.pending_saves())
            .finish()
    }
}

impl Files {
    pub fn new(socket: SocketClient, control_url: impl Into<String>) -> Self {
        let (workspace, _) = watch::channel(Workspace::default());
        Self {
            inner: Arc::new(Inner {
                socket,
                url: control_url.into(),
                workspace,
                pending_acks: Mutex::new(HashMap::new()),
                dir_loads: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn socket(&self) -> &SocketClient {
        &self.inner.socket
    }

    pub fn workspace(&self) -> watch::Receiver<Workspace> {
        self.inner.workspace.subscribe()
    }

    pub fn snapshot(&self) -> Workspace {
        self.inner.workspace.borrow().clone()
    }

    pub fn tree(&self) -> FileTree {
        self.inner.workspace.borrow().tree.clone()
    }

    pub fn content(&self, path: &str) -> Option<String> {
        self.inner.workspace.borrow().contents.get(&normalize(path)).cloned()
    }

    /// Replaces the mirror with a fresh metadata listing. Cached contents of
    /// files that are still listed survive.
    pub fn replace_from_records(&self, records: &[FileRecord]) {
        let tree = FileTree::build(records);
        self.inner.workspace.send_modify(|workspace| {
            workspace.tree = tree;
            prune_contents(workspace);
        });
    }

    /// Number of saves still waiting for a `file_updated` acknowledgement.
    pub fn pending_saves(&self) -> u32 {
        self.inner.pending_acks.lock().values().sum()
    }

    pub fn has_pending_save(&self, path: &str) -> bool {
        self.inner.pending_acks.lock().contains_key(&normalize(path))
    }

    pub async fn open_file(&self, path: &str) -> Result<String, FileError> {
        let path = normalize(path);
        if let Some(content) = self.content(&path) {
            return Ok(content);
        }
        let fetched = self.fetch(&path).await?;
        self.inner.workspace.send_modify(|workspace| {
            workspace.contents.insert(path.clone(), fetched.clone());
        });
        debug!(target = "arena::files", path = %path, bytes = fetched.len(), "file loaded");
        Ok(fetched)
    }

    /// Refetches `path` and reconciles it with the cache. A differing server
    /// value while a save is unacknowledged wins and is reported as a conflict.
    pub async fn refresh_file(&self, path: &str) -> Result<String, FileError> {
        let path = normalize(path);
        let fetched = self.fetch(&path).await?;
        let had_pending = self.inner.pending_acks.lock().remove(&path).is_some();
        let mut diverged = false;
        self.inner.workspace.send_modify(|workspace| {
            diverged = workspace
                .contents
                .get(&path)
                .is_some_and(|cached| *cached != fetched);
            workspace.contents.insert(path.clone(), fetched.clone());
        });
        if had_pending && diverged {
            warn!(target = "arena::files", path = %path, "server content differs from unacknowledged save");
            return Err(FileError::SaveConflict { path });
        }
        Ok(fetched)
    }

    /// Writes the cache immediately and sends the update without waiting for
    /// a reply. Only a failure to transmit rolls the cache back.
    pub async fn save_file(&self, path: &str, content: &str) -> Result<(), FileError> {
        let path = normalize(path);
        let mut undo = UndoLog::default();
        self.inner.workspace.send_modify(|workspace| {
            undo.content(workspace, &path);
            workspace.contents.insert(path.clone(), content.to_string());
        });
        *self.inner.pending_acks.lock().entry(path.clone()).or_default() += 1;

        let request = ControlRequest::UpdateFileContent {
            path: path.clone(),
            content: content.to_string(),
        };
        match self.inner.socket.send_one_way(request, Some(&self.inner.url)).await {
            Ok(()) => {
                debug!(target = "arena::files", path = %path, bytes = content.len(), "save sent");
                Ok(())
            }
            Err(err) => {
                self.release_ack(&path);
                self.inner.workspace.send_modify(|workspace| undo.revert(workspace));
                warn!(target = "arena::files", path = %path, error = %err, "save could not be sent");
                Err(FileError::operation(FileOp::Save, &path, err))
            }
        }
    }

    pub async fn create_file(
        &self,
        path: &str,
        is_dir: bool,
        content: Option<&str>,
    ) -> Result<(), FileError> {
        let path = normalize(path);
        if path.is_empty() {
            return Err(FileError::Invalid {
                op: FileOp::Create,
                path,
                reason: "empty path",
            });
        }
        let content = content.unwrap_or_default().to_string();
        let node = if is_dir {
            FileTreeNode::folder(path.clone())
        } else {
            FileTreeNode::file(path.clone())
        };
        let mut undo = UndoLog::default();
        self.inner.workspace.send_modify(|workspace| {
            let root = workspace.tree.insertion_root(&path);
            undo.tree(&workspace.tree, &root);
            workspace.tree = workspace.tree.insert_at_path(&path, &node);
            if !is_dir {
                undo.content(workspace, &path);
                workspace.contents.insert(path.clone(), content.clone());
            }
        });

        let request = ControlRequest::NewFile {
            path: path.clone(),
            is_dir,
            content,
        };
        self.confirm(FileOp::Create, &path, request, undo).await
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), FileError> {
        let path = normalize(path);
        let mut undo = UndoLog::default();
        self.inner.workspace.send_modify(|workspace| {
            undo.tree(&workspace.tree, &path);
            workspace.tree = workspace.tree.delete_at_path(&path);
            for key in keys_under(&workspace.contents, &path) {
                undo.content(workspace, &key);
                workspace.contents.remove(&key);
            }
        });
        let request = ControlRequest::DeleteFile { path: path.clone() };
        self.confirm(FileOp::Delete, &path, request, undo).await
    }

    /// Moves the node and re-keys cached content under the new path.
    pub async fn rename_file(&self, old_path: &str, new_path: &str) -> Result<(), FileError> {
        let from = normalize(old_path);
        let to = normalize(new_path);
        let invalid = |reason| FileError::Invalid {
            op: FileOp::Rename,
            path: from.clone(),
            reason,
        };
        if to.is_empty() {
            return Err(invalid("empty target path"));
        }
        if from == to {
            return Ok(());
        }
        if to.starts_with(&format!("{from}/")) {
            return Err(invalid("target is inside the source"));
        }
        let Some(node) = self.inner.workspace.borrow().tree.get(&from).cloned() else {
            return Err(invalid("no such path"));
        };

        let mut undo = UndoLog::default();
        self.inner.workspace.send_modify(|workspace| {
            undo.tree(&workspace.tree, &from);
            workspace.tree = workspace.tree.delete_at_path(&from);
            let root = workspace.tree.insertion_root(&to);
            undo.tree(&workspace.tree, &root);
            workspace.tree = workspace.tree.insert_at_path(&to, &node.rebased(&to));
            for key in keys_under(&workspace.contents, &from) {
                let moved = format!("{to}{}", &key[from.len()..]);
                undo.content(workspace, &key);
                let content = workspace.contents.remove(&key).unwrap_or_default();
                undo.content(workspace, &moved);
                workspace.contents.insert(moved, content);
            }
        });
        let request = ControlRequest::EditFileMeta {
            old_path: from.clone(),
            new_path: to.clone(),
        };
        self.confirm(FileOp::Rename, &from, request, undo).await
    }

    /// Lists `path` and merges its direct children into the mirror.
    /// Concurrent loads of one path share a single request.
    pub async fn load_directory(&self, path: &str) -> Result<Vec<FileRecord>, FileError> {
        let path = normalize(path);
        let load = {
            let mut loads = self.inner.dir_loads.lock();
            match loads.get(&path) {
                Some(load) => load.clone(),
                None => {
                    let load = list_dir(self.clone(), path.clone()).boxed().shared();
                    loads.insert(path.clone(), load.clone());
                    load
                }
            }
        };
        load.await
    }

    /// Clears pending acks as `file_updated` pushes arrive. Ends when the
    /// control channel drops its subscribers.
    pub fn spawn_ack_listener(&self) -> JoinHandle<()> {
        let mut rx = self.inner.socket.subscribe("file_updated");
        let files = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => match serde_json::from_value::<FileUpdated>(message.payload) {
                        Ok(ack) if ack.success => files.release_ack(&normalize(&ack.path)),
                        Ok(ack) => {
                            warn!(target = "arena::files", path = %ack.path, "server reported failed save")
                        }
                        Err(err) => {
                            debug!(target = "arena::files", error = %err, "ignoring malformed file_updated")
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target = "arena::files", skipped, "save acknowledgements lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn fetch(&self, path: &str) -> Result<String, FileError> {
        let request = ControlRequest::FetchFileContent {
            path: path.to_string(),
        };
        let file: FileContent = self
            .inner
            .socket
            .request(request, Some(&self.inner.url))
            .await
            .map_err(|err| FileError::operation(FileOp::Load, path, err))?;
        Ok(file.content)
    }

    async fn confirm(
        &self,
        op: FileOp,
        path: &str,
        request: ControlRequest,
        undo: UndoLog,
    ) -> Result<(), FileError> {
        match self.inner.socket.send(request, Some(&self.inner.url)).await {
            Ok(_) => {
                info!(target = "arena::files", op = %op, path = %path, "file operation confirmed");
                Ok(())
            }
            Err(err) => {
                let steps = undo.len();
                self.inner.workspace.send_modify(|workspace| undo.revert(workspace));
                warn!(
                    target = "arena::files",
                    op = %op,
                    path = %path,
                    error = %err,
                    steps,
                    "file operation rejected, local change reverted"
                );
                Err(FileError::operation(op, path, err))
            }
        }
    }

    fn release_ack(&self, path: &str) {
        let mut acks = self.inner.pending_acks.lock();
        if let Some(count) = acks.get_mut(path) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                acks.remove(path);
            }
        }
    }
}

async fn list_dir(files: Files, path: String) -> Result<Vec<FileRecord>, FileError> {
    let request = ControlRequest::LoadDir { path: path.clone() };
    let outcome: Result<DirContent, SocketError> =
        files.inner.socket.request(request, Some(&files.inner.url)).await;
    files.inner.dir_loads.lock().remove(&path);
    let listing = outcome.map_err(|err| FileError::operation(FileOp::ListDir, &path, err))?;
    files.inner.workspace.send_modify(|workspace| {
        workspace.tree = workspace.tree.merge_listing(&path, &listing.files);
        prune_contents(workspace);
    });
    debug!(target = "arena::files", path = %path, entries = listing.files.len(), "directory merged");
    Ok(listing.files)
}

fn prune_contents(workspace: &mut Workspace) {
    let tree = &workspace.tree;
    workspace
        .contents
        .retain(|path, _| tree.get(path).is_some_and(|node| !node.is_dir()));
}

fn keys_under(contents: &ContentCache, path: &str) -> Vec<String> {
    let prefix = format!("{path}/");
    contents
        .keys()
        .filter(|key| key.as_str() == path || key.starts_with(&prefix))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketConfig;
    use crate::transport::mock::{MockConnector, MockPeer};
    use serde_json::json;
    use std::time::Duration;

    const URL: &str = "ws://lab.test/fs/lab-1";

    async fn seeded() -> (Files, MockPeer) {
        let (connector, mut listener) = MockConnector::new();
        let socket = SocketClient::new(connector, SocketConfig::default());
        socket.connect(URL).await.unwrap();
        let peer = listener.accept().await.unwrap();
        let files = Files::new(socket, URL);
        files.replace_from_records(&[
            FileRecord::dir("src"),
            FileRecord::file("src/App.jsx"),
            FileRecord::file("README.md"),
        ]);
        files.inner.workspace.send_modify(|workspace| {
            workspace.contents.insert("src/App.jsx".into(), "export default 1".into());
        });
        (files, peer)
    }

    #[tokio::test(start_paused = true)]
    async fn open_file_uses_cache_then_fetches() {
        let (files, mut peer) = seeded().await;
        assert_eq!(files.open_file("src/App.jsx").await.unwrap(), "export default 1");

        let call = tokio::spawn({
            let files = files.clone();
            async move { files.open_file("/README.md").await }
        });
        let request = peer.recv_json().await.unwrap();
        assert_eq!(request["type"], "fs_fetch_file_content");
        assert_eq!(request["payload"]["path"], "README.md");
        peer.reply(&request, "file_content", json!({"path": "README.md", "content": "# hi"}));
        assert_eq!(call.await.unwrap().unwrap(), "# hi");
        assert_eq!(files.content("README.md").as_deref(), Some("# hi"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_load_leaves_state_untouched() {
        let (files, mut peer) = seeded().await;
        let before = files.snapshot();
        let call = tokio::spawn({
            let files = files.clone();
            async move { files.open_file("README.md").await }
        });
        let request = peer.recv_json().await.unwrap();
        peer.reply_error(&request, "file_content", "unreadable");
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileLoadFailed);
        assert_eq!(files.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_create_restores_snapshot() {
        let (files, mut peer) = seeded().await;
        let before = files.snapshot();
        let call = tokio::spawn({
            let files = files.clone();
            async move { files.create_file("docs/guide/intro.md", false, Some("# Intro")).await }
        });
        let request = peer.recv_json().await.unwrap();
        assert_eq!(request["payload"]["isDir"], false);
        assert!(files.tree().contains("docs/guide/intro.md"));
        assert_eq!(files.content("docs/guide/intro.md").as_deref(), Some("# Intro"));

        peer.reply_error(&request, "file_created", "read-only file system");
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileCreateFailed);
        assert_eq!(files.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn create_over_file_parent_reverts_the_file() {
        let (files, mut peer) = seeded().await;
        let before = files.snapshot();
        let call = tokio::spawn({
            let files = files.clone();
            async move { files.create_file("README.md/notes", true, None).await }
        });
        let request = peer.recv_json().await.unwrap();
        peer.reply_error(&request, "file_created", "not a directory");
        assert!(call.await.unwrap().is_err());
        assert_eq!(files.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_delete_restores_tree_and_cache() {
        let (files, mut peer) = seeded().await;
        let before = files.snapshot();
        let call = tokio::spawn({
            let files = files.clone();
            async move { files.delete_file("src").await }
        });
        let request = peer.recv_json().await.unwrap();
        assert!(!files.tree().contains("src/App.jsx"));
        assert_eq!(files.content("src/App.jsx"), None);
        peer.reply_error(&request, "file_deleted", "busy");
        assert!(call.await.unwrap().is_err());
        assert_eq!(files.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn rename_moves_contents_and_reverts_on_timeout() {
        let (files, mut peer) = seeded().await;
        let before = files.snapshot();
        let call = tokio::spawn({
            let files = files.clone();
            async move { files.rename_file("src", "app").await }
        });
        let request = peer.recv_json().await.unwrap();
        assert_eq!(request["payload"], json!({"oldPath": "src", "newPath": "app", "request_id": request["request_id"]}));
        assert_eq!(files.content("app/App.jsx").as_deref(), Some("export default 1"));
        assert_eq!(files.tree().get("app/App.jsx").unwrap().path(), "app/App.jsx");

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            FileError::Operation { op: FileOp::Rename, source: SocketError::RequestTimeout { .. }, .. }
        ));
        assert_eq!(files.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn rename_of_missing_path_fails_without_request() {
        let (files, _peer) = seeded().await;
        let err = files.rename_file("missing.txt", "new.txt").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileRenameFailed);
        assert_eq!(files.socket().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_rename_keeps_new_layout() {
        let (files, mut peer) = seeded().await;
        let call = tokio::spawn({
            let files = files.clone();
            async move { files.rename_file("README.md", "docs/README.md").await }
        });
        let request = peer.recv_json().await.unwrap();
        peer.reply(&request, "file_renamed", json!({"oldPath": "README.md", "newPath": "docs/README.md", "success": true}));
        call.await.unwrap().unwrap();
        assert!(files.tree().contains("docs/README.md"));
        assert!(!files.tree().contains("README.md"));
    }

    #[tokio::test(start_paused = true)]
    async fn save_is_optimistic_and_acknowledged_by_push() {
        let (files, mut peer) = seeded().await;
        let listener = files.spawn_ack_listener();
        files.save_file("src/App.jsx", "export default 2").await.unwrap();
        assert_eq!(files.content("src/App.jsx").as_deref(), Some("export default 2"));
        assert!(files.has_pending_save("src/App.jsx"));

        let frame = peer.recv_json().await.unwrap();
        assert_eq!(frame["type"], "fs_file_content_update");
        assert!(frame.get("request_id").is_none());
        peer.send_json(&json!({"type": "file_updated", "status": "success", "data": {"path": "src/App.jsx", "success": true}}));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(files.pending_saves(), 0);
        listener.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn unsendable_save_restores_prior_content() {
        let (connector, _listener) = MockConnector::new();
        connector.refuse_next(1);
        let offline = Files::new(SocketClient::new(connector, SocketConfig::default()), URL);
        offline.replace_from_records(&[FileRecord::file("a.txt")]);
        let before = offline.snapshot();
        let err = offline.save_file("a.txt", "new").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileSaveFailed);
        assert_eq!(offline.snapshot(), before);
        assert_eq!(offline.pending_saves(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_reports_conflict_for_unacknowledged_save() {
        let (files, mut peer) = seeded().await;
        files.save_file("src/App.jsx", "mine").await.unwrap();
        peer.recv_json().await.unwrap();

        let call = tokio::spawn({
            let files = files.clone();
            async move { files.refresh_file("src/App.jsx").await }
        });
        let request = peer.recv_json().await.unwrap();
        peer.reply(&request, "file_content", json!({"content": "theirs"}));
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileSaveConflict);
        assert_eq!(files.content("src/App.jsx").as_deref(), Some("theirs"));
        assert!(!files.has_pending_save("src/App.jsx"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_directory_loads_share_one_request() {
        let (files, mut peer) = seeded().await;
        let first = tokio::spawn({
            let files = files.clone();
            async move { files.load_directory("src").await }
        });
        let second = tokio::spawn({
            let files = files.clone();
            async move { files.load_directory("src/").await }
        });
        let request = peer.recv_json().await.unwrap();
        assert_eq!(request["type"], "fs_load_dir");
        peer.reply(
            &request,
            "dir_content",
            json!({"path": "src", "files": [{"path": "src/main.jsx", "isDir": false}]}),
        );
        assert_eq!(first.await.unwrap().unwrap().len(), 1);
        assert_eq!(second.await.unwrap().unwrap().len(), 1);
        assert_eq!(files.socket().pending_count(), 0);
        assert!(files.tree().contains("src/main.jsx"));
        assert!(!files.tree().contains("src/App.jsx"));
        assert!(files.tree().contains("README.md"));
        assert_eq!(files.content("src/App.jsx"), None);
    }
}
