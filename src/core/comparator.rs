//! 目录比较
//!
//! 递归比较本地与远程两棵列举树，得到带状态的比较树。
//! 只在本地存在为 added，只在远程存在为 removed；两侧都存在的目录
//! 由子节点状态推导，added / removed 不会越过各自子树的根向上传播。

use super::node::{ComparisonMeta, ComparisonNode, ComparisonStatus, NodeBody, RawNode, TreeNode};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// 比较两侧节点，两侧都不存在时返回 None
pub fn compare_file_nodes(local: Option<&RawNode>, remote: Option<&RawNode>) -> Option<ComparisonNode> {
    match (local, remote) {
        (None, None) => None,
        (Some(local), None) => Some(one_sided(local, ComparisonStatus::Added)),
        (None, Some(remote)) => Some(one_sided(remote, ComparisonStatus::Removed)),
        (Some(local), Some(remote)) => Some(compare_pair(local, remote)),
    }
}

/// 整棵子树标记为同一状态
fn one_sided(node: &RawNode, status: ComparisonStatus) -> ComparisonNode {
    node.map_meta(&|_| ComparisonMeta::new(status))
}

fn compare_pair(local: &RawNode, remote: &RawNode) -> ComparisonNode {
    match (&local.body, &remote.body) {
        (NodeBody::File, NodeBody::File) => {
            let unchanged = matches!((&local.hash, &remote.hash), (Some(l), Some(r)) if l == r);
            let status = if unchanged {
                ComparisonStatus::Unchanged
            } else {
                ComparisonStatus::Modified
            };
            scalar_copy(local, NodeBody::File, status)
        }
        (NodeBody::Directory(local_children), NodeBody::Directory(remote_children)) => {
            // 目录 hash 相同意味着整棵子树一致
            if local.hash.is_some() && local.hash == remote.hash {
                return one_sided(local, ComparisonStatus::Unchanged);
            }

            let names: BTreeSet<&String> = local_children.keys().chain(remote_children.keys()).collect();
            let mut children = BTreeMap::new();
            for name in names {
                if let Some(child) = compare_file_nodes(local_children.get(name), remote_children.get(name)) {
                    children.insert(name.clone(), child);
                }
            }
            let status = derive_directory_status(
                ComparisonStatus::Unchanged,
                children.values().map(|c: &ComparisonNode| c.status()),
            );
            scalar_copy(local, NodeBody::Directory(children), status)
        }
        // 同一路径一侧是文件一侧是目录
        (NodeBody::Directory(_), NodeBody::File) => {
            let mut node = one_sided(local, ComparisonStatus::Added);
            node.set_status(ComparisonStatus::Modified);
            node
        }
        (NodeBody::File, NodeBody::Directory(_)) => {
            scalar_copy(local, NodeBody::File, ComparisonStatus::Modified)
        }
    }
}

fn scalar_copy(source: &RawNode, body: NodeBody<ComparisonMeta>, status: ComparisonStatus) -> ComparisonNode {
    TreeNode {
        name: source.name.clone(),
        size: source.size,
        modified_time: source.modified_time,
        relative_path: source.relative_path.clone(),
        hash: source.hash.clone(),
        body,
        meta: ComparisonMeta::new(status),
    }
}

/// 由直接子节点的状态推导目录状态
///
/// - 没有子节点：保留 added / removed，否则为 unchanged
/// - 全部子节点 unchanged：unchanged
/// - 单侧存在的目录且子节点与它状态一致：保留
/// - 其他情况：modified
pub fn derive_directory_status(
    current: ComparisonStatus,
    children: impl IntoIterator<Item = ComparisonStatus>,
) -> ComparisonStatus {
    let one_sided = matches!(current, ComparisonStatus::Added | ComparisonStatus::Removed);
    let mut empty = true;
    let mut all_unchanged = true;
    let mut all_current = true;

    for status in children {
        empty = false;
        all_unchanged &= status == ComparisonStatus::Unchanged;
        all_current &= status == current;
    }

    if empty {
        return if one_sided { current } else { ComparisonStatus::Unchanged };
    }
    if all_unchanged {
        return ComparisonStatus::Unchanged;
    }
    if one_sided && all_current {
        return current;
    }
    ComparisonStatus::Modified
}

/// 按状态统计文件数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
}

impl ComparisonSummary {
    pub fn of(node: &ComparisonNode) -> Self {
        let mut summary = Self::default();
        node.visit(&mut |n| {
            if n.is_directory() {
                return;
            }
            match n.status() {
                ComparisonStatus::Added => summary.added += 1,
                ComparisonStatus::Removed => summary.removed += 1,
                ComparisonStatus::Modified => summary.modified += 1,
                ComparisonStatus::Unchanged => summary.unchanged += 1,
            }
        });
        summary
    }

    pub fn merge(&mut self, other: ComparisonSummary) {
        self.added += other.added;
        self.removed += other.removed;
        self.modified += other.modified;
        self.unchanged += other.unchanged;
    }

    pub fn total(&self) -> usize {
        self.added + self.removed + self.modified + self.unchanged
    }

    pub fn has_changes(&self) -> bool {
        self.added + self.removed + self.modified > 0
    }
}
