//! Immutable mirror of the remote file tree.
//!
//! Nodes are reference counted, so every operation returns a new [`FileTree`]
//! that shares all untouched subtrees with the old one. A node's `path` is
//! always the join of the segments leading to it.

use arena_proto::FileRecord;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub type Children = BTreeMap<String, Arc<FileTreeNode>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTreeNode {
    Folder {
        path: String,
        children: Children,
    },
    File {
        path: String,
        size: Option<u64>,
        mod_time: Option<String>,
    },
}

impl FileTreeNode {
    pub fn folder(path: impl Into<String>) -> Self {
        FileTreeNode::Folder {
            path: path.into(),
            children: Children::new(),
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        FileTreeNode::File {
            path: path.into(),
            size: None,
            mod_time: None,
        }
    }

    pub fn from_record(record: &FileRecord) -> Self {
        let path = normalize(&record.path);
        if record.is_dir {
            FileTreeNode::folder(path)
        } else {
            FileTreeNode::File {
                path,
                size: record.size,
                mod_time: record.mod_time.clone(),
            }
        }
    }

    pub fn path(&self) -> &str {
        match self {
            FileTreeNode::Folder { path, .. } | FileTreeNode::File { path, .. } => path,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileTreeNode::Folder { .. })
    }

    pub fn children(&self) -> Option<&Children> {
        match self {
            FileTreeNode::Folder { children, .. } => Some(children),
            FileTreeNode::File { .. } => None,
        }
    }

    /// Copy of this node relocated to `path`, descendants included.
    pub fn rebased(&self, path: &str) -> Self {
        match self {
            FileTreeNode::File { size, mod_time, .. } => FileTreeNode::File {
                path: path.to_string(),
                size: *size,
                mod_time: mod_time.clone(),
            },
            FileTreeNode::Folder { children, .. } => FileTreeNode::Folder {
                path: path.to_string(),
                children: children
                    .iter()
                    .map(|(name, child)| (name.clone(), Arc::new(child.rebased(&join(path, name)))))
                    .collect(),
            },
        }
    }

    fn record(&self) -> FileRecord {
        match self {
            FileTreeNode::Folder { path, .. } => FileRecord::dir(path.clone()),
            FileTreeNode::File {
                path,
                size,
                mod_time,
            } => FileRecord {
                name: None,
                path: path.clone(),
                is_dir: false,
                size: *size,
                mod_time: mod_time.clone(),
            },
        }
    }
}

/// Collapses duplicate, leading and trailing slashes.
pub fn normalize(path: &str) -> String {
    segments(path).join("/")
}

pub fn segments(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect()
}

pub fn parent_of(path: &str) -> String {
    let segs = segments(path);
    match segs.split_last() {
        Some((_, parents)) => parents.join("/"),
        None => String::new(),
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    root: Arc<Children>,
}

impl FileTree {
    /// Folds records into a tree in one pass. Missing parent folders are
    /// created; a directory record over an existing folder keeps its children.
    pub fn build(records: &[FileRecord]) -> Self {
        let mut root = Draft::dir();
        for record in records {
            let segs = segments(&record.path);
            let Some((leaf, parents)) = segs.split_last() else {
                continue;
            };
            let mut cursor = &mut root;
            for seg in parents {
                cursor = cursor.children.entry(seg.to_string()).or_insert_with(Draft::dir);
                cursor.make_dir();
            }
            let entry = cursor.children.entry(leaf.to_string()).or_insert_with(Draft::dir);
            if record.is_dir {
                entry.make_dir();
            } else {
                *entry = Draft::file(record.size, record.mod_time.clone());
            }
        }
        Self {
            root: Arc::new(root.freeze_children("")),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn root(&self) -> &Children {
        &self.root
    }

    pub fn get(&self, path: &str) -> Option<&FileTreeNode> {
        let segs = segments(path);
        let (first, rest) = segs.split_first()?;
        let mut node = self.root.get(*first)?;
        for seg in rest {
            node = node.children()?.get(*seg)?;
        }
        Some(node)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Children of the folder at `path`; the empty path lists the root.
    pub fn children_of(&self, path: &str) -> Option<&Children> {
        if segments(path).is_empty() {
            return Some(&self.root);
        }
        self.get(path)?.children()
    }

    /// Shallowest prefix of `path` that inserting at `path` would create or
    /// replace: the first missing segment, the first file standing where a
    /// folder is needed, or `path` itself when everything above it exists.
    pub fn insertion_root(&self, path: &str) -> String {
        let segs = segments(path);
        let mut children: &Children = &self.root;
        let mut prefix = String::new();
        for (index, seg) in segs.iter().enumerate() {
            prefix = join(&prefix, seg);
            let last = index + 1 == segs.len();
            match children.get(*seg).map(|node| node.as_ref()) {
                Some(FileTreeNode::Folder { children: next, .. }) if !last => children = next,
                _ => return prefix,
            }
        }
        prefix
    }

    /// Places `node` at `path`, creating intermediate folders and replacing
    /// whatever was there.
    pub fn insert_at_path(&self, path: &str, node: &FileTreeNode) -> Self {
        let segs = segments(path);
        if segs.is_empty() {
            return self.clone();
        }
        Self {
            root: Arc::new(insert_into(&self.root, "", &segs, node)),
        }
    }

    /// Removes the node at `path`. Missing paths leave the tree unchanged.
    pub fn delete_at_path(&self, path: &str) -> Self {
        match remove_from(&self.root, &segments(path)) {
            Some(root) => Self {
                root: Arc::new(root),
            },
            None => self.clone(),
        }
    }

    /// Moves the subtree at `old_path` to `new_path`. A missing source, an
    /// unchanged path or a move into its own subtree leaves the tree as is.
    pub fn move_at_path(&self, old_path: &str, new_path: &str) -> Self {
        let from = normalize(old_path);
        let to = normalize(new_path);
        if from.is_empty() || to.is_empty() || from == to || to.starts_with(&format!("{from}/")) {
            return self.clone();
        }
        let Some(node) = self.get(&from) else {
            return self.clone();
        };
        let moved = node.rebased(&to);
        self.delete_at_path(&from).insert_at_path(&to, &moved)
    }

    /// Reconciles the direct children of `dir` with a fresh listing. Listed
    /// folders that already exist keep their loaded contents.
    pub fn merge_listing(&self, dir: &str, records: &[FileRecord]) -> Self {
        let dir = normalize(dir);
        let mut tree = self.clone();
        if !dir.is_empty() && !tree.get(&dir).is_some_and(FileTreeNode::is_dir) {
            tree = tree.insert_at_path(&dir, &FileTreeNode::folder(dir.clone()));
        }
        let listed: BTreeSet<String> = records.iter().map(|r| normalize(&r.path)).collect();
        let stale: Vec<String> = tree
            .children_of(&dir)
            .map(|children| {
                children
                    .values()
                    .map(|child| child.path().to_string())
                    .filter(|path| !listed.contains(path))
                    .collect()
            })
            .unwrap_or_default();
        for path in stale {
            tree = tree.delete_at_path(&path);
        }
        for record in records {
            let path = normalize(&record.path);
            if record.is_dir && tree.get(&path).is_some_and(FileTreeNode::is_dir) {
                continue;
            }
            tree = tree.insert_at_path(&path, &FileTreeNode::from_record(record));
        }
        tree
    }

    /// Depth-first records for every node, folders included.
    pub fn flatten(&self) -> Vec<FileRecord> {
        let mut out = Vec::new();
        collect(&self.root, &mut out);
        out
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.flatten()
            .into_iter()
            .filter(|record| !record.is_dir)
            .map(|record| record.path)
            .collect()
    }
}

fn collect(children: &Children, out: &mut Vec<FileRecord>) {
    for node in children.values() {
        out.push(node.record());
        if let Some(children) = node.children() {
            collect(children, out);
        }
    }
}

fn insert_into(children: &Children, prefix: &str, segs: &[&str], node: &FileTreeNode) -> Children {
    let mut next = children.clone();
    let Some((head, rest)) = segs.split_first() else {
        return next;
    };
    let path = join(prefix, head);
    if rest.is_empty() {
        next.insert(head.to_string(), Arc::new(node.rebased(&path)));
        return next;
    }
    let empty = Children::new();
    let existing = match children.get(*head).map(|n| n.as_ref()) {
        Some(FileTreeNode::Folder { children, .. }) => children,
        _ => &empty,
    };
    let nested = insert_into(existing, &path, rest, node);
    next.insert(
        head.to_string(),
        Arc::new(FileTreeNode::Folder {
            path,
            children: nested,
        }),
    );
    next
}

fn remove_from(children: &Children, segs: &[&str]) -> Option<Children> {
    let (head, rest) = segs.split_first()?;
    if rest.is_empty() {
        children.get(*head)?;
        let mut next = children.clone();
        next.remove(*head);
        return Some(next);
    }
    let FileTreeNode::Folder {
        path,
        children: nested,
    } = children.get(*head)?.as_ref()
    else {
        return None;
    };
    let nested = remove_from(nested, rest)?;
    let mut next = children.clone();
    next.insert(
        head.to_string(),
        Arc::new(FileTreeNode::Folder {
            path: path.clone(),
            children: nested,
        }),
    );
    Some(next)
}

/// Mutable scratch node used only while building.
struct Draft {
    is_dir: bool,
    size: Option<u64>,
    mod_time: Option<String>,
    children: BTreeMap<String, Draft>,
}

impl Draft {
    fn dir() -> Self {
        Self {
            is_dir: true,
            size: None,
            mod_time: None,
            children: BTreeMap::new(),
        }
    }

    fn file(size: Option<u64>, mod_time: Option<String>) -> Self {
        Self {
            is_dir: false,
            size,
            mod_time,
            children: BTreeMap::new(),
        }
    }

    fn make_dir(&mut self) {
        if !self.is_dir {
            *self = Draft::dir();
        }
    }

    fn freeze_children(self, prefix: &str) -> Children {
        self.children
            .into_iter()
            .map(|(name, draft)| {
                let path = join(prefix, &name);
                let node = if draft.is_dir {
                    FileTreeNode::Folder {
                        children: draft.freeze_children(&path),
                        path,
                    }
                } else {
                    FileTreeNode::File {
                        path,
                        size: draft.size,
                        mod_time: draft.mod_time,
                    }
                };
                (name, Arc::new(node))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample() -> Vec<FileRecord> {
        vec![
            FileRecord::dir("src"),
            FileRecord::file("src/App.jsx").with_size(42),
            FileRecord::dir("src/components"),
            FileRecord::file("src/components/Button.jsx"),
            FileRecord::file("package.json").with_mod_time("2024-05-01T10:00:00Z"),
            FileRecord::file("README.md"),
        ]
    }

    fn as_set(records: Vec<FileRecord>) -> HashSet<(String, bool, Option<u64>, Option<String>)> {
        records
            .into_iter()
            .map(|r| (r.path, r.is_dir, r.size, r.mod_time))
            .collect()
    }

    fn assert_paths_consistent(children: &Children, prefix: &str) {
        for (name, node) in children {
            assert_eq!(node.path(), join(prefix, name));
            assert!(!name.contains('/'));
            if let Some(nested) = node.children() {
                assert_paths_consistent(nested, node.path());
            }
        }
    }

    #[test]
    fn build_then_flatten_round_trips() {
        let records = sample();
        let tree = FileTree::build(&records);
        assert_eq!(as_set(tree.flatten()), as_set(records));
        assert_paths_consistent(tree.root(), "");
    }

    #[test]
    fn round_trip_holds_for_generated_listings() {
        // prefix-closed listings of varying shape
        for width in 1..4 {
            for depth in 1..4 {
                let mut records = Vec::new();
                let mut frontier = vec![String::new()];
                for level in 0..depth {
                    let mut next = Vec::new();
                    for parent in &frontier {
                        for i in 0..width {
                            let dir = join(parent, &format!("d{level}_{i}"));
                            records.push(FileRecord::file(join(parent, &format!("f{level}_{i}.txt"))).with_size(i as u64));
                            records.push(FileRecord::dir(dir.clone()));
                            next.push(dir);
                        }
                    }
                    frontier = next;
                }
                records.reverse();
                let tree = FileTree::build(&records);
                assert_eq!(as_set(tree.flatten()), as_set(records), "width {width} depth {depth}");
                assert_paths_consistent(tree.root(), "");
            }
        }
    }

    #[test]
    fn build_creates_missing_parents_and_keeps_folder_children() {
        let tree = FileTree::build(&[
            FileRecord::file("a/b/c.txt"),
            FileRecord::dir("a"),
            FileRecord::dir("a/b"),
        ]);
        assert!(tree.get("a/b").unwrap().is_dir());
        assert!(tree.contains("a/b/c.txt"));
    }

    #[test]
    fn insert_creates_intermediate_folders() {
        let tree = FileTree::build(&sample());
        let next = tree.insert_at_path("docs/guide/intro.md", &FileTreeNode::file("ignored"));
        let node = next.get("docs/guide/intro.md").unwrap();
        assert_eq!(node.path(), "docs/guide/intro.md");
        assert!(next.get("docs/guide").unwrap().is_dir());
        assert!(!tree.contains("docs"));
        assert!(Arc::ptr_eq(&tree.root()["src"], &next.root()["src"]));
    }

    #[test]
    fn insert_overwrites_existing_node() {
        let tree = FileTree::build(&sample());
        let next = tree.insert_at_path("src", &FileTreeNode::file("src"));
        assert!(!next.get("src").unwrap().is_dir());
        assert!(!next.contains("src/App.jsx"));
    }

    #[test]
    fn delete_missing_path_is_noop() {
        let tree = FileTree::build(&sample());
        assert_eq!(tree.delete_at_path("nope/x.js"), tree);
        assert_eq!(tree.delete_at_path("README.md/child"), tree);
        let next = tree.delete_at_path("src/components");
        assert!(!next.contains("src/components/Button.jsx"));
        assert!(next.contains("src/App.jsx"));
    }

    #[test]
    fn move_of_missing_path_returns_equal_tree() {
        let tree = FileTree::build(&sample());
        assert_eq!(tree.move_at_path("missing.txt", "new.txt"), tree);
    }

    #[test]
    fn move_rebases_descendants() {
        let tree = FileTree::build(&sample());
        let next = tree.move_at_path("src/components", "lib/ui");
        assert!(!next.contains("src/components"));
        let moved = next.get("lib/ui/Button.jsx").unwrap();
        assert_eq!(moved.path(), "lib/ui/Button.jsx");
        assert_paths_consistent(next.root(), "");
    }

    #[test]
    fn move_into_own_subtree_is_noop() {
        let tree = FileTree::build(&sample());
        assert_eq!(tree.move_at_path("src", "src/nested"), tree);
        assert_eq!(tree.move_at_path("src", "/src/"), tree);
    }

    #[test]
    fn merge_listing_replaces_direct_children_only() {
        let tree = FileTree::build(&sample());
        let next = tree.merge_listing(
            "src",
            &[
                FileRecord::dir("src/components"),
                FileRecord::file("src/index.js"),
            ],
        );
        assert!(!next.contains("src/App.jsx"));
        assert!(next.contains("src/index.js"));
        assert!(next.contains("src/components/Button.jsx"));
        assert!(next.contains("README.md"));
    }

    #[test]
    fn insertion_root_finds_shallowest_change() {
        let tree = FileTree::build(&sample());
        assert_eq!(tree.insertion_root("src/App.jsx"), "src/App.jsx");
        assert_eq!(tree.insertion_root("src/new/deep.js"), "src/new");
        assert_eq!(tree.insertion_root("docs/a.md"), "docs");
        assert_eq!(tree.insertion_root("README.md/x"), "README.md");
        assert_eq!(tree.insertion_root("/src/"), "src");
    }

    #[test]
    fn normalize_trims_slashes() {
        assert_eq!(normalize("/src//App.jsx/"), "src/App.jsx");
        assert_eq!(parent_of("src/a/b.js"), "src/a");
        assert_eq!(parent_of("b.js"), "");
    }
}
