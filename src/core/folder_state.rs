//! 目录展开状态
//!
//! 键为 `"<根目录名>$$<相对路径>"`，只记录展开的目录，折叠即删除键。

use super::node::{normalize_relative, ComparisonNode, ComparisonStatus};
use std::collections::BTreeMap;

const KEY_SEPARATOR: &str = "$$";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FolderState {
    entries: BTreeMap<String, bool>,
}

pub fn folder_key(root: &str, relative_path: &str) -> String {
    format!("{}{}{}", root, KEY_SEPARATOR, normalize_relative(relative_path))
}

/// 拆分键为 (根目录名, 相对路径)
pub fn split_folder_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(KEY_SEPARATOR)
}

impl FolderState {
    pub fn from_entries(entries: BTreeMap<String, bool>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &BTreeMap<String, bool> {
        &self.entries
    }

    pub fn is_expanded(&self, root: &str, relative_path: &str) -> bool {
        self.entries
            .get(&folder_key(root, relative_path))
            .copied()
            .unwrap_or(false)
    }

    /// 返回状态是否发生变化
    pub fn set_expanded(&mut self, root: &str, relative_path: &str, expanded: bool) -> bool {
        let key = folder_key(root, relative_path);
        if expanded {
            self.entries.insert(key, true) != Some(true)
        } else {
            self.entries.remove(&key).is_some()
        }
    }

    /// 展开所有包含变化的目录，返回新展开的数量
    pub fn expand_changed(&mut self, root: &str, tree: &ComparisonNode) -> usize {
        let mut expanded = 0;
        tree.visit(&mut |node| {
            if node.is_directory()
                && node.status() != ComparisonStatus::Unchanged
                && self.set_expanded(root, &node.relative_path, true)
            {
                expanded += 1;
            }
        });
        expanded
    }

    pub fn clear_root(&mut self, root: &str) {
        self.entries
            .retain(|key, _| split_folder_key(key).map(|(r, _)| r != root).unwrap_or(true));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::ComparisonMeta;
    use chrono::Utc;

    #[test]
    fn test_collapse_removes_key() {
        let mut state = FolderState::default();
        assert!(state.set_expanded("proj", "src", true));
        assert!(!state.set_expanded("proj", "src", true));
        assert!(state.is_expanded("proj", "./src"));
        assert_eq!(state.entries().keys().next().unwrap(), "proj$$src");

        assert!(state.set_expanded("proj", "src", false));
        assert!(state.is_empty());
        assert!(!state.set_expanded("proj", "src", false));
    }

    #[test]
    fn test_expand_changed_directories() {
        let meta = ComparisonMeta::new;
        let mut root = ComparisonNode::new_directory("proj", "", Utc::now(), meta(ComparisonStatus::Modified));
        let mut a = ComparisonNode::new_directory("a", "a", Utc::now(), meta(ComparisonStatus::Modified));
        a.add_child(ComparisonNode::new_file("x", "a/x", 1, Utc::now(), meta(ComparisonStatus::Added)))
            .unwrap();
        root.add_child(a).unwrap();
        root.add_child(ComparisonNode::new_directory("b", "b", Utc::now(), meta(ComparisonStatus::Unchanged)))
            .unwrap();

        let mut state = FolderState::default();
        assert_eq!(state.expand_changed("proj", &root), 2);
        assert!(state.is_expanded("proj", ""));
        assert!(state.is_expanded("proj", "a"));
        assert!(!state.is_expanded("proj", "b"));
        assert!(!state.is_expanded("proj", "a/x"));
        assert_eq!(state.expand_changed("proj", &root), 0);
    }

    #[test]
    fn test_clear_root() {
        let mut state = FolderState::default();
        state.set_expanded("one", "a", true);
        state.set_expanded("two", "a", true);
        state.clear_root("one");
        assert!(!state.is_expanded("one", "a"));
        assert!(state.is_expanded("two", "a"));
        assert_eq!(split_folder_key("two$$a/b"), Some(("two", "a/b")));
    }
}
