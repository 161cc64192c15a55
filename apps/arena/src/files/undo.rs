use super::Workspace;
use crate::tree::{FileTree, FileTreeNode};

/// One inverse step. Tree steps put back whatever stood at `path`, or remove
/// `path` if nothing did; content steps do the same for one cache key.
#[derive(Debug, Clone, PartialEq)]
enum UndoStep {
    Tree {
        path: String,
        prior: Option<FileTreeNode>,
    },
    Content {
        path: String,
        prior: Option<String>,
    },
}

/// Inverse operations recorded while applying an optimistic mutation.
/// Steps must be recorded against the state they are about to change.
#[derive(Debug, Default)]
pub(crate) struct UndoLog {
    steps: Vec<UndoStep>,
}

impl UndoLog {
    pub(crate) fn tree(&mut self, tree: &FileTree, path: &str) {
        self.steps.push(UndoStep::Tree {
            path: path.to_string(),
            prior: tree.get(path).cloned(),
        });
    }

    pub(crate) fn content(&mut self, workspace: &Workspace, path: &str) {
        self.steps.push(UndoStep::Content {
            path: path.to_string(),
            prior: workspace.contents.get(path).cloned(),
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.steps.len()
    }

    pub(crate) fn revert(self, workspace: &mut Workspace) {
        for step in self.steps.into_iter().rev() {
            match step {
                UndoStep::Tree {
                    path,
                    prior: Some(node),
                } => workspace.tree = workspace.tree.insert_at_path(&path, &node),
                UndoStep::Tree { path, prior: None } => {
                    workspace.tree = workspace.tree.delete_at_path(&path)
                }
                UndoStep::Content {
                    path,
                    prior: Some(content),
                } => {
                    workspace.contents.insert(path, content);
                }
                UndoStep::Content { path, prior: None } => {
                    workspace.contents.remove(&path);
                }
            }
        }
    }
}
