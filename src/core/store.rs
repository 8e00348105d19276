//! 比较树存储
//!
//! 按配对根目录名持有比较树。所有修改都经过这里，修改完成后沿祖先链
//! 自下而上重新推导目录状态：每层只看直接子节点，某层状态不变即停止。

use super::comparator::derive_directory_status;
use super::node::{
    ancestors, is_within, normalize_relative, segments, split_parent, ComparisonNode, ComparisonStatus,
};
use crate::error::{Result, SyncError};
use std::collections::BTreeMap;
use tracing::debug;

/// 删除方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// 两侧都已不存在，直接从树中摘除
    Detach,
    /// 保留节点并标记为 removed
    MarkRemoved,
}

/// 修改后界面需要刷新的节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTarget {
    pub root: String,
    pub relative_path: String,
}

impl RefreshTarget {
    fn new(root: &str, relative_path: impl Into<String>) -> Self {
        Self {
            root: root.to_string(),
            relative_path: relative_path.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComparisonStore {
    roots: BTreeMap<String, ComparisonNode>,
}

impl ComparisonStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_roots(roots: BTreeMap<String, ComparisonNode>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &BTreeMap<String, ComparisonNode> {
        &self.roots
    }

    pub fn set_root(&mut self, root: &str, node: ComparisonNode) {
        self.roots.insert(root.to_string(), node);
    }

    pub fn remove_root(&mut self, root: &str) -> Option<ComparisonNode> {
        self.roots.remove(root)
    }

    /// 按路径查找，找不到返回 None
    pub fn find_by_path(&self, root: &str, relative_path: &str) -> Option<&ComparisonNode> {
        self.roots.get(root)?.descendant(relative_path)
    }

    pub fn find_by_path_mut(&mut self, root: &str, relative_path: &str) -> Option<&mut ComparisonNode> {
        self.roots.get_mut(root)?.descendant_mut(relative_path)
    }

    /// 按路径查找，调用方期望节点存在
    pub fn get(&self, root: &str, relative_path: &str) -> Result<&ComparisonNode> {
        let tree = self
            .roots
            .get(root)
            .ok_or_else(|| SyncError::RootNotFound(root.to_string()))?;
        tree.descendant(relative_path)
            .ok_or_else(|| SyncError::NodeNotFound(normalize_relative(relative_path)))
    }

    fn root_mut(&mut self, root: &str) -> Result<&mut ComparisonNode> {
        self.roots
            .get_mut(root)
            .ok_or_else(|| SyncError::RootNotFound(root.to_string()))
    }

    /// 定位父目录，要求存在且是目录
    fn parent_mut<'a>(tree: &'a mut ComparisonNode, parent: &str) -> Result<&'a mut ComparisonNode> {
        let node = tree
            .descendant_mut(parent)
            .ok_or_else(|| SyncError::ParentNotFound(parent.to_string()))?;
        if !node.is_directory() {
            return Err(SyncError::NotADirectory(parent.to_string()));
        }
        Ok(node)
    }

    /// 在父目录下挂入新节点
    pub fn add(&mut self, root: &str, mut node: ComparisonNode) -> Result<RefreshTarget> {
        let path = normalize_relative(&node.relative_path);
        let (parent, name) = split_parent(&path)
            .ok_or_else(|| SyncError::InvalidNode("不能以 add 替换根节点".to_string()))?;
        let parent = parent.to_string();
        node.name = name.to_string();
        node.relative_path = path.clone();

        let tree = self.root_mut(root)?;
        Self::parent_mut(tree, &parent)?.add_child(node)?;
        debug!("添加节点: {}/{}", root, path);

        let changed = propagate(tree, &parent);
        Ok(RefreshTarget::new(root, changed.unwrap_or(parent)))
    }

    /// 删除节点，见 [`Removal`]
    pub fn remove(&mut self, root: &str, relative_path: &str, mode: Removal) -> Result<RefreshTarget> {
        let path = normalize_relative(relative_path);
        if path.is_empty() && mode == Removal::Detach {
            self.roots.remove(root);
            debug!("移除根节点: {}", root);
            return Ok(RefreshTarget::new(root, ""));
        }
        let tree = self.root_mut(root)?;

        match mode {
            Removal::MarkRemoved => {
                let node = tree
                    .descendant_mut(&path)
                    .ok_or_else(|| SyncError::NodeNotFound(path.clone()))?;
                node.set_status_recursive(ComparisonStatus::Removed);
                debug!("标记为已删除: {}/{}", root, path);

                let changed = match split_parent(&path) {
                    Some((parent, _)) => propagate(tree, parent),
                    None => None,
                };
                Ok(RefreshTarget::new(root, changed.unwrap_or(path)))
            }
            Removal::Detach => {
                let Some((parent, name)) = split_parent(&path) else {
                    return Err(SyncError::NodeNotFound(path.clone()));
                };
                let parent_node = Self::parent_mut(tree, parent)?;
                if parent_node.remove_child(name).is_none() {
                    return Err(SyncError::NodeNotFound(path.clone()));
                }
                debug!("移除节点: {}/{}", root, path);

                let changed = propagate(tree, parent);
                Ok(RefreshTarget::new(root, changed.unwrap_or_else(|| parent.to_string())))
            }
        }
    }

    /// 只合并标量字段（hash、size、modified_time、status），结构字段保持不变
    pub fn update(&mut self, root: &str, node: &ComparisonNode) -> Result<RefreshTarget> {
        let path = normalize_relative(&node.relative_path);
        let tree = self.root_mut(root)?;
        let existing = tree
            .descendant_mut(&path)
            .ok_or_else(|| SyncError::NodeNotFound(path.clone()))?;

        existing.hash = node.hash.clone();
        existing.size = node.size;
        existing.modified_time = node.modified_time;
        existing.set_status(node.status());

        let changed = match split_parent(&path) {
            Some((parent, _)) => propagate(tree, parent),
            None => None,
        };
        Ok(RefreshTarget::new(root, changed.unwrap_or(path)))
    }

    /// 用新子树整体替换同一路径上的节点；根路径替换整棵树
    pub fn replace(&mut self, root: &str, mut node: ComparisonNode) -> Result<RefreshTarget> {
        let path = normalize_relative(&node.relative_path);
        let Some((parent, name)) = split_parent(&path) else {
            if let Some(old) = self.roots.get(root) {
                node.name = old.name.clone();
            }
            node.relative_path = String::new();
            self.roots.insert(root.to_string(), node);
            return Ok(RefreshTarget::new(root, ""));
        };
        let parent = parent.to_string();
        node.name = name.to_string();
        node.relative_path = path;

        let tree = self.root_mut(root)?;
        Self::parent_mut(tree, &parent)?.add_child(node)?;

        let changed = propagate(tree, &parent);
        Ok(RefreshTarget::new(root, changed.unwrap_or(parent)))
    }

    /// 移动节点，新旧两条祖先链都重新推导
    pub fn move_node(&mut self, root: &str, from: &str, to: &str) -> Result<RefreshTarget> {
        let from = normalize_relative(from);
        let to = normalize_relative(to);
        let invalid = || SyncError::InvalidMove {
            from: from.clone(),
            to: to.clone(),
        };

        let (Some((from_parent, from_name)), Some((to_parent, _))) = (split_parent(&from), split_parent(&to))
        else {
            return Err(invalid());
        };
        if is_within(&to, &from) || is_within(&from, &to) {
            return Err(invalid());
        }

        let tree = self.root_mut(root)?;
        // 先确认目标父目录可用，避免摘下节点后无处安放
        Self::parent_mut(tree, to_parent)?;
        // 目标已存在时不覆盖
        if tree.descendant(&to).is_some() {
            return Err(invalid());
        }
        let mut node = Self::parent_mut(tree, from_parent)?
            .remove_child(from_name)
            .ok_or_else(|| SyncError::NodeNotFound(from.clone()))?;

        node.rebase(&to);
        node.set_status(ComparisonStatus::Modified);
        Self::parent_mut(tree, to_parent)?.add_child(node)?;
        debug!("移动节点: {}/{} -> {}", root, from, to);

        let old_target = propagate(tree, from_parent).unwrap_or_else(|| from_parent.to_string());
        let new_target = propagate(tree, to_parent).unwrap_or_else(|| to_parent.to_string());
        Ok(RefreshTarget::new(root, common_ancestor(&old_target, &new_target)))
    }
}

/// 从 `dir_path` 开始沿祖先链向上重新推导状态，返回状态发生变化的最浅目录
fn propagate(tree: &mut ComparisonNode, dir_path: &str) -> Option<String> {
    let mut changed = None;
    let chain = std::iter::once(dir_path).chain(ancestors(dir_path));

    for path in chain {
        let Some(dir) = tree.descendant_mut(path) else {
            break;
        };
        let Some(children) = dir.children() else {
            break;
        };
        let current = dir.status();
        let derived = derive_directory_status(current, children.values().map(|c| c.status()));
        if derived == current {
            break;
        }
        dir.set_status(derived);
        changed = Some(path.to_string());
    }
    changed
}

/// 两个路径的最近公共祖先
pub(crate) fn common_ancestor(a: &str, b: &str) -> String {
    segments(a)
        .zip(segments(b))
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::ComparisonMeta;
    use chrono::Utc;

    fn dir(path: &str, status: ComparisonStatus) -> ComparisonNode {
        let name = split_parent(path).map(|(_, n)| n).unwrap_or("project");
        ComparisonNode::new_directory(name, path, Utc::now(), ComparisonMeta::new(status))
    }

    fn file(path: &str, status: ComparisonStatus) -> ComparisonNode {
        let name = split_parent(path).map(|(_, n)| n).unwrap_or("");
        let mut node = ComparisonNode::new_file(name, path, 1, Utc::now(), ComparisonMeta::new(status));
        node.hash = Some(format!("hash-{}", path));
        node
    }

    /// project/
    ///   a/ (unchanged)
    ///     keep.txt
    ///   b/ (unchanged)
    ///     c/
    ///       deep.txt
    fn unchanged_store() -> ComparisonStore {
        use ComparisonStatus::Unchanged;
        let mut root = dir("", Unchanged);
        let mut a = dir("a", Unchanged);
        a.add_child(file("a/keep.txt", Unchanged)).unwrap();
        let mut b = dir("b", Unchanged);
        let mut c = dir("b/c", Unchanged);
        c.add_child(file("b/c/deep.txt", Unchanged)).unwrap();
        b.add_child(c).unwrap();
        root.add_child(a).unwrap();
        root.add_child(b).unwrap();

        let mut store = ComparisonStore::new();
        store.set_root("project", root);
        store
    }

    fn status(store: &ComparisonStore, path: &str) -> ComparisonStatus {
        store.get("project", path).unwrap().status()
    }

    #[test]
    fn test_add_marks_ancestors_modified() {
        let mut store = unchanged_store();
        let target = store.add("project", file("a/new.txt", ComparisonStatus::Added)).unwrap();

        assert_eq!(status(&store, "a/new.txt"), ComparisonStatus::Added);
        assert_eq!(status(&store, "a"), ComparisonStatus::Modified);
        assert_eq!(status(&store, ""), ComparisonStatus::Modified);
        assert_eq!(status(&store, "b"), ComparisonStatus::Unchanged);
        assert_eq!(target, RefreshTarget::new("project", ""));
    }

    #[test]
    fn test_add_requires_directory_parent() {
        let mut store = unchanged_store();
        assert!(matches!(
            store.add("project", file("missing/x.txt", ComparisonStatus::Added)),
            Err(SyncError::ParentNotFound(p)) if p == "missing"
        ));
        assert!(matches!(
            store.add("project", file("a/keep.txt/x", ComparisonStatus::Added)),
            Err(SyncError::NotADirectory(_))
        ));
        assert!(matches!(
            store.add("other", file("x", ComparisonStatus::Added)),
            Err(SyncError::RootNotFound(_))
        ));
    }

    #[test]
    fn test_find_by_path() {
        let store = unchanged_store();
        assert_eq!(store.find_by_path("project", "b/c/deep.txt").unwrap().name, "deep.txt");
        assert!(store.find_by_path("project", "b/nope").is_none());
        assert!(store.find_by_path("nope", "").is_none());
        assert!(matches!(store.get("project", "b/nope"), Err(SyncError::NodeNotFound(_))));
    }

    #[test]
    fn test_early_exit_reports_shallowest_change() {
        let mut store = unchanged_store();
        store.add("project", file("a/one.txt", ComparisonStatus::Added)).unwrap();

        // a 已经是 modified，新增第二个文件时祖先链不再变化
        let target = store.add("project", file("a/two.txt", ComparisonStatus::Added)).unwrap();
        assert_eq!(target, RefreshTarget::new("project", "a"));

        // 深层变化只上浮到第一个发生变化的祖先之上
        let target = store
            .update("project", &file("b/c/deep.txt", ComparisonStatus::Modified))
            .unwrap();
        assert_eq!(status(&store, "b/c"), ComparisonStatus::Modified);
        assert_eq!(status(&store, "b"), ComparisonStatus::Modified);
        assert_eq!(target, RefreshTarget::new("project", "b"));
    }

    #[test]
    fn test_detach_restores_unchanged() {
        let mut store = unchanged_store();
        store.add("project", file("a/new.txt", ComparisonStatus::Added)).unwrap();
        let target = store.remove("project", "a/new.txt", Removal::Detach).unwrap();

        assert!(store.find_by_path("project", "a/new.txt").is_none());
        assert_eq!(status(&store, "a"), ComparisonStatus::Unchanged);
        assert_eq!(status(&store, ""), ComparisonStatus::Unchanged);
        assert_eq!(target, RefreshTarget::new("project", ""));

        assert!(matches!(
            store.remove("project", "a/new.txt", Removal::Detach),
            Err(SyncError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_mark_removed_keeps_node() {
        let mut store = unchanged_store();
        store.remove("project", "b/c", Removal::MarkRemoved).unwrap();

        assert_eq!(status(&store, "b/c"), ComparisonStatus::Removed);
        assert_eq!(status(&store, "b/c/deep.txt"), ComparisonStatus::Removed);
        assert_eq!(status(&store, "b"), ComparisonStatus::Modified);
        assert_eq!(status(&store, ""), ComparisonStatus::Modified);
    }

    #[test]
    fn test_update_merges_scalars_only() {
        let mut store = unchanged_store();
        let mut incoming = ComparisonNode::new_directory("b", "b", Utc::now(), ComparisonMeta::new(ComparisonStatus::Modified));
        incoming.hash = Some("new-hash".into());
        incoming.size = 99;
        store.update("project", &incoming).unwrap();

        let b = store.get("project", "b").unwrap();
        assert_eq!(b.hash.as_deref(), Some("new-hash"));
        assert_eq!(b.size, 99);
        assert_eq!(b.status(), ComparisonStatus::Modified);
        assert!(b.descendant("c/deep.txt").is_some());
        assert_eq!(status(&store, ""), ComparisonStatus::Modified);

        assert!(matches!(
            store.update("project", &file("zzz", ComparisonStatus::Unchanged)),
            Err(SyncError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_replace_swaps_subtree() {
        let mut store = unchanged_store();
        let mut fresh = dir("b", ComparisonStatus::Modified);
        fresh.add_child(file("b/other.txt", ComparisonStatus::Added)).unwrap();
        store.replace("project", fresh).unwrap();

        assert!(store.find_by_path("project", "b/c").is_none());
        assert_eq!(status(&store, "b/other.txt"), ComparisonStatus::Added);
        assert_eq!(status(&store, ""), ComparisonStatus::Modified);

        store.replace("project", dir("", ComparisonStatus::Unchanged)).unwrap();
        assert_eq!(store.get("project", "").unwrap().name, "project");
        assert!(store.find_by_path("project", "a").is_none());
    }

    #[test]
    fn test_move_rebases_and_propagates_both_chains() {
        let mut store = unchanged_store();
        let target = store.move_node("project", "b/c", "a/c2").unwrap();

        assert!(store.find_by_path("project", "b/c").is_none());
        let moved = store.get("project", "a/c2").unwrap();
        assert_eq!(moved.name, "c2");
        assert_eq!(moved.status(), ComparisonStatus::Modified);
        assert_eq!(moved.descendant("deep.txt").unwrap().relative_path, "a/c2/deep.txt");

        assert_eq!(status(&store, "b"), ComparisonStatus::Unchanged);
        assert_eq!(status(&store, "a"), ComparisonStatus::Modified);
        assert_eq!(status(&store, ""), ComparisonStatus::Modified);
        assert_eq!(target, RefreshTarget::new("project", ""));
    }

    #[test]
    fn test_invalid_moves_leave_tree_intact() {
        let mut store = unchanged_store();
        let before = store.clone();

        assert!(matches!(store.move_node("project", "b", "b/c/b"), Err(SyncError::InvalidMove { .. })));
        assert!(matches!(store.move_node("project", "", "x"), Err(SyncError::InvalidMove { .. })));
        assert!(matches!(
            store.move_node("project", "b/c", "missing/c"),
            Err(SyncError::ParentNotFound(_))
        ));
        assert!(matches!(
            store.move_node("project", "b/zzz", "a/zzz"),
            Err(SyncError::NodeNotFound(_))
        ));
        assert_eq!(store, before);
    }

    #[test]
    fn test_move_onto_existing_node_is_rejected() {
        let mut store = unchanged_store();
        let before = store.clone();

        assert!(matches!(
            store.move_node("project", "a/keep.txt", "b/c"),
            Err(SyncError::InvalidMove { .. })
        ));
        assert!(matches!(
            store.move_node("project", "b/c/deep.txt", "a/keep.txt"),
            Err(SyncError::InvalidMove { .. })
        ));
        assert_eq!(store, before);
        assert!(store.get("project", "b/c").unwrap().is_directory());
        assert!(store.find_by_path("project", "b/c/deep.txt").is_some());
    }

    #[test]
    fn test_common_ancestor() {
        assert_eq!(common_ancestor("a/b/c", "a/b/d"), "a/b");
        assert_eq!(common_ancestor("a", "b"), "");
        assert_eq!(common_ancestor("", "a/b"), "");
    }
}
