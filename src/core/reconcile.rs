//! 协调操作：上传、下载、删除、重命名
//!
//! 传输完成后把比较树调整回一致：单个文件直接改为 unchanged，
//! 目录则对该路径重新做一次增量比较。

use super::engine::SyncEngine;
use super::ignore::IgnorePolicy;
use super::node::{
    is_within, join_relative, normalize_relative, split_parent, ComparisonMeta, ComparisonStatus, NodeKind, Origin,
    RawMeta,
};
use super::store::{common_ancestor, RefreshTarget, Removal};
use crate::config::PairedFolder;
use crate::error::{Result, SyncError};
use crate::remote::{posix_join, posix_parent, shell_quote, ConnectionManager, SftpSession};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upload,
    Download,
}

/// 一个节点在两侧的绝对路径
struct Endpoints {
    local: PathBuf,
    remote: String,
}

fn endpoints(folder: &PairedFolder, relative: &str) -> Endpoints {
    let local = if relative.is_empty() {
        PathBuf::from(&folder.local_path)
    } else {
        Path::new(&folder.local_path).join(relative)
    };
    Endpoints {
        local,
        remote: posix_join(&folder.remote_path, relative),
    }
}

async fn local_kind(path: &Path) -> Result<Option<NodeKind>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(Some(NodeKind::Directory)),
        Ok(_) => Ok(Some(NodeKind::File)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// 递归列出远程目录下的所有条目（相对配对根目录）
async fn walk_remote(
    sftp: Arc<dyn SftpSession>,
    remote_root: &str,
    relative: &str,
    ignore: &IgnorePolicy,
) -> Result<Vec<(String, NodeKind)>> {
    let mut result = Vec::new();
    let mut pending = vec![relative.to_string()];
    while let Some(dir) = pending.pop() {
        for entry in sftp.list(&posix_join(remote_root, &dir)).await? {
            let path = join_relative(&dir, &entry.name);
            if ignore.is_ignored(&path) {
                continue;
            }
            if entry.kind == NodeKind::Directory {
                pending.push(path.clone());
            }
            result.push((path, entry.kind));
        }
    }
    result.sort();
    Ok(result)
}

impl SyncEngine {
    /// 上传本地文件或目录到远程
    pub async fn upload(&self, root: &str, relative: &str) -> Result<RefreshTarget> {
        let relative = normalize_relative(relative);
        let folder = self.paired_folder(root)?;
        let ends = endpoints(&folder, &relative);
        let start = Instant::now();

        match local_kind(&ends.local).await? {
            None => Err(SyncError::NodeNotFound(relative)),
            Some(NodeKind::File) => {
                let local = ends.local.clone();
                let remote = ends.remote.clone();
                let bytes = self
                    .connections
                    .with_sftp(|sftp| {
                        let local = local.clone();
                        let remote = remote.clone();
                        async move {
                            if let Some(parent) = posix_parent(&remote) {
                                sftp.mkdir(parent, true).await?;
                            }
                            sftp.put(&local, &remote).await
                        }
                    })
                    .await?;
                info!("上传完成: {} ({} 字节, {:?})", ends.remote, bytes, start.elapsed());
                self.mark_file_synced(root, &relative, Direction::Upload).await
            }
            Some(NodeKind::Directory) => {
                let Some(tree) = self.list_local(root, &relative).await? else {
                    return Err(SyncError::NodeNotFound(relative));
                };
                let mut dirs = Vec::new();
                let mut files = Vec::new();
                tree.visit(&mut |node| match node.kind() {
                    NodeKind::Directory => dirs.push(node.relative_path.clone()),
                    NodeKind::File => files.push(node.relative_path.clone()),
                });

                self.create_remote_dirs(&folder, &dirs).await?;
                let result = self.transfer_files(&folder, files, Direction::Upload).await;
                if let Ok(bytes) = &result {
                    info!("目录上传完成: {} ({} 字节, {:?})", ends.remote, bytes, start.elapsed());
                }
                let target = self.compare_entry(root, &relative).await?;
                result.map(|_| target)
            }
        }
    }

    /// 先确认远程自上次列举后没有被别人改过，再上传
    ///
    /// 远程不存在时直接上传；远程存在但 hash 与缓存不一致（或缓存中没有）时
    /// 返回 [`SyncError::RemoteChanged`]，不覆盖。
    pub async fn upload_checked(&self, root: &str, relative: &str) -> Result<RefreshTarget> {
        let relative = normalize_relative(relative);
        if let Some(current) = self.list_remote(root, &relative).await? {
            let cached = self.cached_remote_hash(root, &relative).await;
            if cached.is_none() || cached != current.hash {
                warn!("远程已被修改，取消上传: {}/{}", root, relative);
                return Err(SyncError::RemoteChanged(relative));
            }
        }
        self.upload(root, &relative).await
    }

    /// 本地已经重命名（或移动）后，把远程对应的文件或目录同样重命名
    ///
    /// 远程目标已存在时返回 [`SyncError::InvalidMove`]，不覆盖。
    pub async fn rename(&self, root: &str, from: &str, to: &str) -> Result<RefreshTarget> {
        let from = normalize_relative(from);
        let to = normalize_relative(to);
        let invalid = || SyncError::InvalidMove {
            from: from.clone(),
            to: to.clone(),
        };
        if from.is_empty() || to.is_empty() || is_within(&to, &from) || is_within(&from, &to) {
            return Err(invalid());
        }
        let folder = self.paired_folder(root)?;
        let remote_from = endpoints(&folder, &from).remote;
        let remote_to = endpoints(&folder, &to).remote;

        self.connections
            .with_sftp(|sftp| {
                let remote_from = remote_from.clone();
                let remote_to = remote_to.clone();
                let conflict = invalid();
                async move {
                    if sftp.exists(&remote_from).await?.is_none() {
                        return Err(SyncError::NodeNotFound(remote_from));
                    }
                    if sftp.exists(&remote_to).await?.is_some() {
                        warn!("远程目标已存在，取消重命名: {}", remote_to);
                        return Err(conflict);
                    }
                    if let Some(parent) = posix_parent(&remote_to) {
                        sftp.mkdir(parent, true).await?;
                    }
                    sftp.rename(&remote_from, &remote_to).await
                }
            })
            .await?;
        info!("远程已重命名: {} -> {}", remote_from, remote_to);

        self.merge_remote_listing(root, &from, None).await;

        // 目标父目录已在比较树中时直接移动节点，随后两条路径都重新比较
        let mut targets = Vec::with_capacity(3);
        {
            let mut store = self.store().write().await;
            let movable = store.find_by_path(root, &from).is_some()
                && store.find_by_path(root, &to).is_none()
                && split_parent(&to)
                    .and_then(|(parent, _)| store.find_by_path(root, parent))
                    .is_some_and(|n| n.is_directory());
            if movable {
                targets.push(store.move_node(root, &from, &to)?);
            }
        }
        targets.push(self.compare_entry(root, &to).await?);
        targets.push(self.compare_entry(root, &from).await?);

        let relative_path = targets
            .into_iter()
            .map(|t| t.relative_path)
            .reduce(|a, b| common_ancestor(&a, &b))
            .unwrap_or_default();
        Ok(RefreshTarget {
            root: root.to_string(),
            relative_path,
        })
    }

    /// 下载远程文件或目录到本地
    pub async fn download(&self, root: &str, relative: &str) -> Result<RefreshTarget> {
        let relative = normalize_relative(relative);
        let folder = self.paired_folder(root)?;
        let ends = endpoints(&folder, &relative);
        let start = Instant::now();

        let remote = ends.remote.clone();
        let kind = self
            .connections
            .with_sftp(|sftp| {
                let remote = remote.clone();
                async move { sftp.exists(&remote).await }
            })
            .await?;

        match kind {
            None => Err(SyncError::NodeNotFound(relative)),
            Some(NodeKind::File) => {
                if let Some(parent) = ends.local.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let local = ends.local.clone();
                let bytes = self
                    .connections
                    .with_sftp(|sftp| {
                        let local = local.clone();
                        let remote = remote.clone();
                        async move { sftp.get(&remote, &local).await }
                    })
                    .await?;
                info!("下载完成: {:?} ({} 字节, {:?})", ends.local, bytes, start.elapsed());
                self.mark_file_synced(root, &relative, Direction::Download).await
            }
            Some(NodeKind::Directory) => {
                let ignore = self.ignore().clone();
                let remote_root = folder.remote_path.clone();
                let entries = self
                    .connections
                    .with_sftp(|sftp| {
                        let ignore = ignore.clone();
                        let remote_root = remote_root.clone();
                        let relative = relative.clone();
                        async move { walk_remote(sftp, &remote_root, &relative, &ignore).await }
                    })
                    .await?;

                tokio::fs::create_dir_all(&ends.local).await?;
                let mut files = Vec::new();
                for (path, kind) in entries {
                    match kind {
                        NodeKind::Directory => {
                            tokio::fs::create_dir_all(endpoints(&folder, &path).local).await?
                        }
                        NodeKind::File => files.push(path),
                    }
                }
                let result = self.transfer_files(&folder, files, Direction::Download).await;
                if let Ok(bytes) = &result {
                    info!("目录下载完成: {:?} ({} 字节, {:?})", ends.local, bytes, start.elapsed());
                }
                let target = self.compare_entry(root, &relative).await?;
                result.map(|_| target)
            }
        }
    }

    /// 删除远程文件或目录
    pub async fn delete_remote(&self, root: &str, relative: &str) -> Result<RefreshTarget> {
        let relative = normalize_relative(relative);
        if relative.is_empty() {
            return Err(SyncError::InvalidNode("不能删除配对根目录".to_string()));
        }
        let folder = self.paired_folder(root)?;
        let remote = endpoints(&folder, &relative).remote;

        let kind = self
            .connections
            .with_sftp(|sftp| {
                let remote = remote.clone();
                async move {
                    let kind = sftp.exists(&remote).await?;
                    if let Some(kind) = kind {
                        sftp.delete(&remote, kind == NodeKind::Directory).await?;
                    }
                    Ok(kind)
                }
            })
            .await?;
        match kind {
            Some(_) => info!("已删除远程: {}", remote),
            None => debug!("远程不存在，无需删除: {}", remote),
        }

        self.merge_remote_listing(root, &relative, None).await;
        self.settle_after_delete(root, &relative, ComparisonStatus::Removed, ComparisonStatus::Added)
            .await
    }

    /// 删除本地文件或目录
    pub async fn delete_local(&self, root: &str, relative: &str) -> Result<RefreshTarget> {
        let relative = normalize_relative(relative);
        if relative.is_empty() {
            return Err(SyncError::InvalidNode("不能删除配对根目录".to_string()));
        }
        let folder = self.paired_folder(root)?;
        let local = endpoints(&folder, &relative).local;

        match local_kind(&local).await? {
            Some(kind) => {
                if kind == NodeKind::Directory {
                    tokio::fs::remove_dir_all(&local).await?;
                } else {
                    tokio::fs::remove_file(&local).await?;
                }
                info!("已删除本地: {:?}", local);
            }
            None => debug!("本地不存在，无需删除: {:?}", local),
        }

        self.settle_after_delete(root, &relative, ComparisonStatus::Added, ComparisonStatus::Removed)
            .await
    }

    /// 删除一侧后调整比较树：
    /// 原本只在被删一侧存在（`gone_status`）的文件直接摘除，否则改为 `remaining_status`
    async fn settle_after_delete(
        &self,
        root: &str,
        relative: &str,
        gone_status: ComparisonStatus,
        remaining_status: ComparisonStatus,
    ) -> Result<RefreshTarget> {
        let existing = self.find(root, relative).await;
        let Some(node) = existing.filter(|n| !n.is_directory()) else {
            return self.compare_entry(root, relative).await;
        };

        let target = {
            let mut store = self.store().write().await;
            if node.status() == gone_status {
                store.remove(root, relative, Removal::Detach)?
            } else if remaining_status == ComparisonStatus::Removed {
                store.remove(root, relative, Removal::MarkRemoved)?
            } else {
                let mut updated = node;
                updated.set_status(remaining_status);
                store.update(root, &updated)?
            }
        };
        self.persist().await?;
        Ok(target)
    }

    /// 文件传输后两侧内容一致，直接把节点改为 unchanged
    async fn mark_file_synced(&self, root: &str, relative: &str, direction: Direction) -> Result<RefreshTarget> {
        let Some(local) = self.list_local(root, relative).await? else {
            return self.compare_entry(root, relative).await;
        };

        if direction == Direction::Upload {
            let folder = self.paired_folder(root)?;
            let remote = local.map_meta(&|n| RawMeta {
                origin: Origin::Remote,
                full_path: posix_join(&folder.remote_path, &n.relative_path),
            });
            self.merge_remote_listing(root, relative, Some(remote)).await;
        }

        let synced = local.map_meta(&|_| ComparisonMeta::new(ComparisonStatus::Unchanged));
        let updated = {
            let mut store = self.store().write().await;
            let is_file = store
                .find_by_path(root, relative)
                .is_some_and(|n| !n.is_directory());
            if is_file {
                Some(store.update(root, &synced)?)
            } else {
                None
            }
        };
        match updated {
            Some(target) => {
                self.persist().await?;
                Ok(target)
            }
            None => self.compare_entry(root, relative).await,
        }
    }

    /// 一条 `mkdir -p` 命令创建所有远程目录
    async fn create_remote_dirs(&self, folder: &PairedFolder, dirs: &[String]) -> Result<()> {
        if dirs.is_empty() {
            return Ok(());
        }
        let quoted: Vec<String> = dirs
            .iter()
            .map(|d| shell_quote(&posix_join(&folder.remote_path, d)))
            .collect();
        let command = format!("mkdir -p {}", quoted.join(" "));
        let output = self
            .connections
            .with_ssh(|ssh| {
                let command = command.clone();
                async move { ssh.exec(&command).await }
            })
            .await?;
        if output.exit_code != 0 {
            return Err(SyncError::Command {
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        debug!("已创建 {} 个远程目录", dirs.len());
        Ok(())
    }

    /// 限制并发地逐个传输文件，全部完成后返回第一个错误
    async fn transfer_files(&self, folder: &PairedFolder, files: Vec<String>, direction: Direction) -> Result<u64> {
        let semaphore = Arc::new(Semaphore::new(self.settings.hash_concurrency.max(1)));
        let mut handles = Vec::with_capacity(files.len());

        for relative in files {
            let semaphore = semaphore.clone();
            let connections: ConnectionManager = self.connections.clone();
            let ends = endpoints(folder, &relative);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Ok(0);
                };
                let result = connections
                    .with_sftp(|sftp| {
                        let local = ends.local.clone();
                        let remote = ends.remote.clone();
                        async move {
                            match direction {
                                Direction::Upload => sftp.put(&local, &remote).await,
                                Direction::Download => sftp.get(&remote, &local).await,
                            }
                        }
                    })
                    .await;
                if let Err(e) = &result {
                    warn!("传输失败 {}: {}", relative, e);
                }
                result
            }));
        }

        let mut bytes = 0u64;
        let mut first_error = None;
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Ok(n)) => bytes += n,
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => warn!("传输任务失败: {}", e),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(bytes),
        }
    }
}
