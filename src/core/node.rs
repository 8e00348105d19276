//! 文件树节点模型
//!
//! `TreeNode<M>` 是两种树共用的结构：单侧列举得到的 `RawNode`，
//! 以及比较结果 `ComparisonNode`。节点只有两种形态：文件或带子节点的目录。

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// 节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Directory => "directory",
        }
    }
}

/// 节点主体：文件没有子节点，目录按名称持有子节点
#[derive(Debug, Clone, PartialEq)]
pub enum NodeBody<M> {
    File,
    Directory(BTreeMap<String, TreeNode<M>>),
}

/// 树节点
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode<M> {
    pub name: String,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    /// 相对配对根目录的路径，根节点为空串
    pub relative_path: String,
    pub hash: Option<String>,
    pub body: NodeBody<M>,
    pub meta: M,
}

/// 数据来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

/// 单侧列举节点的附加信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMeta {
    pub origin: Origin,
    pub full_path: String,
}

/// 比较状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonStatus {
    Added,
    Removed,
    Modified,
    Unchanged,
}

/// 比较节点的附加信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonMeta {
    pub status: ComparisonStatus,
    /// 仅用于展示，不参与比较，也不持久化
    #[serde(skip, default = "default_show_in_tree")]
    pub show_in_tree: bool,
}

fn default_show_in_tree() -> bool {
    true
}

impl ComparisonMeta {
    pub fn new(status: ComparisonStatus) -> Self {
        Self {
            status,
            show_in_tree: true,
        }
    }
}

impl PartialEq for ComparisonMeta {
    fn eq(&self, other: &Self) -> bool {
        self.status == other.status
    }
}

pub type RawNode = TreeNode<RawMeta>;
pub type ComparisonNode = TreeNode<ComparisonMeta>;

impl<M> TreeNode<M> {
    pub fn new_file(
        name: impl Into<String>,
        relative_path: impl Into<String>,
        size: u64,
        modified_time: DateTime<Utc>,
        meta: M,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            modified_time,
            relative_path: relative_path.into(),
            hash: None,
            body: NodeBody::File,
            meta,
        }
    }

    pub fn new_directory(
        name: impl Into<String>,
        relative_path: impl Into<String>,
        modified_time: DateTime<Utc>,
        meta: M,
    ) -> Self {
        Self {
            name: name.into(),
            size: 0,
            modified_time,
            relative_path: relative_path.into(),
            hash: None,
            body: NodeBody::Directory(BTreeMap::new()),
            meta,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self.body {
            NodeBody::File => NodeKind::File,
            NodeBody::Directory(_) => NodeKind::Directory,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.body, NodeBody::Directory(_))
    }

    pub fn children(&self) -> Option<&BTreeMap<String, TreeNode<M>>> {
        match &self.body {
            NodeBody::File => None,
            NodeBody::Directory(children) => Some(children),
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut BTreeMap<String, TreeNode<M>>> {
        match &mut self.body {
            NodeBody::File => None,
            NodeBody::Directory(children) => Some(children),
        }
    }

    /// 按名称插入子节点（同名覆盖）。调用方保证子节点的 relative_path 已正确
    pub fn add_child(&mut self, child: TreeNode<M>) -> Result<()> {
        match &mut self.body {
            NodeBody::Directory(children) => {
                children.insert(child.name.clone(), child);
                Ok(())
            }
            NodeBody::File => Err(SyncError::NotADirectory(self.relative_path.clone())),
        }
    }

    pub fn get_child(&self, name: &str) -> Option<&TreeNode<M>> {
        self.children().and_then(|c| c.get(name))
    }

    pub fn get_child_mut(&mut self, name: &str) -> Option<&mut TreeNode<M>> {
        self.children_mut().and_then(|c| c.get_mut(name))
    }

    pub fn remove_child(&mut self, name: &str) -> Option<TreeNode<M>> {
        self.children_mut().and_then(|c| c.remove(name))
    }

    /// 按相对本节点的路径向下查找
    pub fn descendant(&self, path: &str) -> Option<&TreeNode<M>> {
        let mut node = self;
        for segment in segments(path) {
            node = node.get_child(segment)?;
        }
        Some(node)
    }

    pub fn descendant_mut(&mut self, path: &str) -> Option<&mut TreeNode<M>> {
        let mut node = self;
        for segment in segments(path) {
            node = node.get_child_mut(segment)?;
        }
        Some(node)
    }

    /// 移动后重写整棵子树的 name / relative_path
    pub fn rebase(&mut self, relative_path: &str) {
        self.relative_path = relative_path.to_string();
        if let Some((_, name)) = split_parent(relative_path) {
            self.name = name.to_string();
        }
        if let Some(children) = self.children_mut() {
            for child in children.values_mut() {
                let child_path = join_relative(relative_path, &child.name);
                child.rebase(&child_path);
            }
        }
    }

    /// 先序遍历整棵子树
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a TreeNode<M>)) {
        f(self);
        if let Some(children) = self.children() {
            for child in children.values() {
                child.visit(f);
            }
        }
    }

    /// 转换附加信息，结构保持不变
    pub fn map_meta<N>(&self, f: &impl Fn(&TreeNode<M>) -> N) -> TreeNode<N> {
        let body = match &self.body {
            NodeBody::File => NodeBody::File,
            NodeBody::Directory(children) => NodeBody::Directory(
                children
                    .iter()
                    .map(|(name, child)| (name.clone(), child.map_meta(f)))
                    .collect(),
            ),
        };
        TreeNode {
            name: self.name.clone(),
            size: self.size,
            modified_time: self.modified_time,
            relative_path: self.relative_path.clone(),
            hash: self.hash.clone(),
            body,
            meta: f(self),
        }
    }
}

impl ComparisonNode {
    pub fn status(&self) -> ComparisonStatus {
        self.meta.status
    }

    pub fn set_status(&mut self, status: ComparisonStatus) {
        self.meta.status = status;
    }

    /// 整棵子树统一设置状态
    pub fn set_status_recursive(&mut self, status: ComparisonStatus) {
        self.meta.status = status;
        if let Some(children) = self.children_mut() {
            for child in children.values_mut() {
                child.set_status_recursive(status);
            }
        }
    }

    /// 重新计算 show_in_tree：不过滤时全部显示；
    /// 过滤时显示有变化的节点以及包含可见后代的目录
    pub fn refresh_visibility(&mut self, only_changes: bool) -> bool {
        let mut any_child_visible = false;
        if let Some(children) = self.children_mut() {
            for child in children.values_mut() {
                any_child_visible |= child.refresh_visibility(only_changes);
            }
        }
        let visible =
            !only_changes || self.status() != ComparisonStatus::Unchanged || any_child_visible;
        self.meta.show_in_tree = visible;
        visible
    }
}

// ============ 序列化 ============

/// 持久化格式：普通的键值结构，子节点按名称嵌套
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "M: Deserialize<'de>"))]
pub struct NodeRecord<M> {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    pub relative_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, NodeRecord<M>>,
    #[serde(flatten)]
    pub meta: M,
}

impl<M: Clone> TreeNode<M> {
    pub fn to_record(&self) -> NodeRecord<M> {
        NodeRecord {
            name: self.name.clone(),
            kind: self.kind(),
            size: self.size,
            modified_time: self.modified_time,
            relative_path: self.relative_path.clone(),
            hash: self.hash.clone(),
            children: self
                .children()
                .map(|c| c.iter().map(|(k, v)| (k.clone(), v.to_record())).collect())
                .unwrap_or_default(),
            meta: self.meta.clone(),
        }
    }
}

impl<M> TreeNode<M> {
    /// 从持久化格式重建子树，不重新计算 hash 和状态
    pub fn from_record(record: NodeRecord<M>) -> Result<Self> {
        let body = match record.kind {
            NodeKind::File => {
                if !record.children.is_empty() {
                    return Err(SyncError::InvalidNode(format!(
                        "文件节点不能包含子节点: {}",
                        record.relative_path
                    )));
                }
                NodeBody::File
            }
            NodeKind::Directory => {
                let mut children = BTreeMap::new();
                for (key, child) in record.children {
                    if key != child.name {
                        return Err(SyncError::InvalidNode(format!(
                            "子节点名称不匹配: '{}' != '{}'",
                            key, child.name
                        )));
                    }
                    children.insert(key, TreeNode::from_record(child)?);
                }
                NodeBody::Directory(children)
            }
        };

        Ok(Self {
            name: record.name,
            size: record.size,
            modified_time: record.modified_time,
            relative_path: record.relative_path,
            hash: record.hash,
            body,
            meta: record.meta,
        })
    }
}

impl<M: Serialize + Clone> Serialize for TreeNode<M> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_record().serialize(serializer)
    }
}

impl<'de, M: DeserializeOwned> Deserialize<'de> for TreeNode<M> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let record = NodeRecord::<M>::deserialize(deserializer)?;
        TreeNode::from_record(record).map_err(D::Error::custom)
    }
}

// ============ 路径工具 ============

/// 去掉 "." 段和多余的 '/'，根目录规范化为空串。
/// 两侧都是 POSIX 路径，反斜杠是合法的文件名字符，不当作分隔符
pub fn normalize_relative(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

pub fn join_relative(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// 拆分为 (父路径, 名称)；根路径返回 None
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    if path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(idx) => Some((&path[..idx], &path[idx + 1..])),
        None => Some(("", path)),
    }
}

/// 从自身到根的所有祖先路径（不含自身），由深到浅
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut current = path;
    while let Some((parent, _)) = split_parent(current) {
        result.push(parent);
        current = parent;
    }
    result
}

/// `path` 是否等于 `base` 或位于其下
pub fn is_within(path: &str, base: &str) -> bool {
    base.is_empty() || path == base || path.starts_with(&format!("{}/", base))
}
