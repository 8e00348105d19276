//! 本地列举，以及本地/远程共用的树组装

use super::hasher::{file_content_hash, finalize_directory_hashes, node_hash};
use super::ignore::IgnorePolicy;
use super::node::{is_within, normalize_relative, split_parent, NodeKind, Origin, RawMeta, RawNode};
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 列举得到的一条记录（相对路径以配对根目录为基准）
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub relative_path: String,
    pub kind: NodeKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub full_path: String,
    /// 文件内容的 SHA-256；目录或计算失败时为 None
    pub content_hash: Option<String>,
}

/// 把扁平记录组装成以 `start` 为根的树。`start` 本身不在记录中时返回 None
pub fn assemble(
    root_name: &str,
    start: &str,
    origin: Origin,
    mut entries: Vec<ListingEntry>,
) -> Option<RawNode> {
    // 按深度排序，保证父目录先于子节点插入
    entries.sort_by(|a, b| {
        depth(&a.relative_path)
            .cmp(&depth(&b.relative_path))
            .then_with(|| a.relative_path.cmp(&b.relative_path))
    });

    let mut iter = entries.into_iter();
    let first = iter.next()?;
    if first.relative_path != start {
        return None;
    }

    let root_display_name = match split_parent(start) {
        Some((_, name)) => name.to_string(),
        None => root_name.to_string(),
    };
    let mut root = to_node(root_display_name, origin, first);

    let mut orphans = 0usize;
    for entry in iter {
        if !is_within(&entry.relative_path, start) || entry.relative_path == start {
            continue;
        }
        let Some((parent_path, name)) = split_parent(&entry.relative_path) else {
            continue;
        };
        let local_parent = parent_path
            .strip_prefix(start)
            .unwrap_or(parent_path)
            .trim_start_matches('/');
        let name = name.to_string();
        match root.descendant_mut(local_parent) {
            Some(parent) if parent.is_directory() => {
                let node = to_node(name, origin, entry);
                // 父节点是目录，插入不会失败
                let _ = parent.add_child(node);
            }
            _ => orphans += 1,
        }
    }
    if orphans > 0 {
        debug!("{} 条记录缺少父目录，已跳过", orphans);
    }

    finalize_directory_hashes(&mut root);
    Some(root)
}

fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.matches('/').count() + 1
    }
}

fn to_node(name: String, origin: Origin, entry: ListingEntry) -> RawNode {
    let meta = RawMeta {
        origin,
        full_path: entry.full_path,
    };
    match entry.kind {
        NodeKind::Directory => {
            RawNode::new_directory(name, entry.relative_path, entry.modified, meta)
        }
        NodeKind::File => {
            let mut node = RawNode::new_file(name, entry.relative_path, entry.size, entry.modified, meta);
            node.hash = entry
                .content_hash
                .map(|fp| node_hash(&node.relative_path, NodeKind::File, &fp));
            node
        }
    }
}

/// 删除已被忽略的后代并重新计算目录 hash，返回删除的节点数
///
/// 远程列举可能在本地列举完成后才发现拒绝访问的路径，两侧需要对齐
pub fn prune_ignored(node: &mut RawNode, ignore: &IgnorePolicy) -> usize {
    let removed = prune(node, ignore);
    if removed > 0 {
        finalize_directory_hashes(node);
    }
    removed
}

fn prune(node: &mut RawNode, ignore: &IgnorePolicy) -> usize {
    let Some(children) = node.children_mut() else {
        return 0;
    };
    let before = children.len();
    children.retain(|_, child| !ignore.is_ignored(&child.relative_path));
    let mut removed = before - children.len();
    for child in children.values_mut() {
        removed += prune(child, ignore);
    }
    removed
}

/// 本地文件扫描器
#[derive(Clone)]
pub struct LocalScanner {
    ignore: IgnorePolicy,
    hash_concurrency: usize,
}

/// walkdir 阶段收集的条目
struct WalkedEntry {
    relative_path: String,
    full_path: PathBuf,
    kind: NodeKind,
    size: u64,
    modified: DateTime<Utc>,
}

impl LocalScanner {
    pub fn new(ignore: IgnorePolicy, hash_concurrency: usize) -> Self {
        Self {
            ignore,
            hash_concurrency: hash_concurrency.max(1),
        }
    }

    /// 列举 `local_root` 下的 `relative` 路径。路径不存在或被忽略时返回 None
    pub async fn list(
        &self,
        local_root: &Path,
        root_name: &str,
        relative: &str,
    ) -> Result<Option<RawNode>> {
        let relative = normalize_relative(relative);
        if self.ignore.is_ignored(&relative) {
            return Ok(None);
        }
        let start = local_root.join(&relative);
        if !tokio::fs::try_exists(&start).await? {
            debug!("本地路径不存在: {:?}", start);
            return Ok(None);
        }

        let walked = {
            let root = local_root.to_path_buf();
            let ignore = self.ignore.clone();
            let relative = relative.clone();
            tokio::task::spawn_blocking(move || walk(&root, &relative, &ignore))
                .await
                .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
        };

        let entries = self.hash_files(walked).await;
        let file_count = entries.iter().filter(|e| e.kind == NodeKind::File).count();
        info!(
            "本地扫描完成: {:?}, {} 个文件, {} 个目录",
            start,
            file_count,
            entries.len() - file_count
        );

        Ok(assemble(root_name, &relative, Origin::Local, entries))
    }

    /// 并发计算文件哈希，失败的文件保留为无 hash
    async fn hash_files(&self, walked: Vec<WalkedEntry>) -> Vec<ListingEntry> {
        let semaphore = Arc::new(Semaphore::new(self.hash_concurrency));
        let mut handles = Vec::with_capacity(walked.len());

        for entry in walked {
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let content_hash = if entry.kind == NodeKind::File {
                    match semaphore.acquire_owned().await {
                        Ok(_permit) => match file_content_hash(&entry.full_path).await {
                            Ok(hash) => Some(hash),
                            Err(e) => {
                                warn!("计算哈希失败，跳过: {:?}: {}", entry.full_path, e);
                                None
                            }
                        },
                        Err(_) => None,
                    }
                } else {
                    None
                };
                ListingEntry {
                    relative_path: entry.relative_path,
                    kind: entry.kind,
                    size: entry.size,
                    modified: entry.modified,
                    full_path: entry.full_path.to_string_lossy().to_string(),
                    content_hash,
                }
            }));
        }

        let mut entries = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("哈希任务失败: {}", e),
            }
        }
        entries
    }
}

fn relative_of(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Some(parts.join("/"))
}

/// 遍历文件系统（阻塞），跳过忽略的路径和符号链接
fn walk(root: &Path, relative: &str, ignore: &IgnorePolicy) -> Vec<WalkedEntry> {
    let start = root.join(relative);
    let mut result = Vec::new();

    let walker = WalkDir::new(&start)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| match relative_of(root, e.path()) {
            Some(rel) => !ignore.is_ignored(&rel),
            None => false,
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("遍历本地目录出错: {}", e);
                continue;
            }
        };
        if entry.file_type().is_symlink() {
            continue;
        }
        let Some(relative_path) = relative_of(root, entry.path()) else {
            continue;
        };
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("读取元数据失败 {:?}: {}", entry.path(), e);
                continue;
            }
        };
        let is_dir = metadata.is_dir();
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        result.push(WalkedEntry {
            relative_path,
            full_path: entry.path().to_path_buf(),
            kind: if is_dir { NodeKind::Directory } else { NodeKind::File },
            size: if is_dir { 0 } else { metadata.len() },
            modified,
        });
    }

    result
}
