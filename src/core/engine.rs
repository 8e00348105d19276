//! 同步引擎
//!
//! 编排两侧列举、比较、比较树存储与持久化。

use super::comparator::{compare_file_nodes, ComparisonSummary};
use super::debounce::Debouncer;
use super::folder_state::FolderState;
use super::hasher::finalize_directory_hashes;
use super::ignore::IgnorePolicy;
use super::node::{normalize_relative, split_parent, ComparisonNode, RawNode};
use super::persistence::Persistence;
use super::remote_scan::RemoteScanner;
use super::scanner::{prune_ignored, LocalScanner};
use super::store::{ComparisonStore, RefreshTarget, Removal};
use crate::config::{ConfigProvider, PairedFolder, SyncSettings};
use crate::error::{Result, SyncError};
use crate::remote::ConnectionManager;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// 同步引擎
pub struct SyncEngine {
    pub(crate) config: Arc<dyn ConfigProvider>,
    pub(crate) connections: ConnectionManager,
    pub(crate) settings: SyncSettings,
    ignore: IgnorePolicy,
    store: Arc<RwLock<ComparisonStore>>,
    remote_listing: RwLock<BTreeMap<String, RawNode>>,
    folder_state: Mutex<FolderState>,
    folder_writer: Debouncer<FolderState>,
    persistence: Persistence,
    local_scanner: LocalScanner,
    remote_scanner: RemoteScanner,
}

impl SyncEngine {
    /// 需要在 tokio 运行时内创建（展开状态的去抖写入任务随之启动）
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        connections: ConnectionManager,
        settings: SyncSettings,
        persistence: Persistence,
    ) -> Self {
        let ignore = IgnorePolicy::new(&config.ignore_patterns());

        let writer = persistence.clone();
        let folder_writer = Debouncer::new(settings.folder_state_debounce(), move |state: FolderState| {
            let writer = writer.clone();
            async move {
                if let Err(e) = writer.save_folder_state(&state).await {
                    warn!("保存目录展开状态失败: {}", e);
                }
            }
        });

        Self {
            local_scanner: LocalScanner::new(ignore.clone(), settings.hash_concurrency),
            remote_scanner: RemoteScanner::new(ignore.clone()),
            config,
            connections,
            settings,
            ignore,
            store: Arc::new(RwLock::new(ComparisonStore::new())),
            remote_listing: RwLock::new(BTreeMap::new()),
            folder_state: Mutex::new(FolderState::default()),
            folder_writer,
            persistence,
        }
    }

    /// 读取上次持久化的状态
    pub async fn load_state(&self) -> Result<()> {
        let (remote, comparisons, folders) = tokio::try_join!(
            self.persistence.load_remote_listing(),
            self.persistence.load_comparisons(),
            self.persistence.load_folder_state(),
        )?;
        *self.remote_listing.write().await = remote;
        *self.store.write().await = ComparisonStore::from_roots(comparisons);
        *self.folder_state.lock().await = folders;
        Ok(())
    }

    pub fn store(&self) -> &Arc<RwLock<ComparisonStore>> {
        &self.store
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn ignore(&self) -> &IgnorePolicy {
        &self.ignore
    }

    /// 某个根目录上次的远程列举结果
    pub async fn remote_snapshot(&self, root: &str) -> Option<RawNode> {
        self.remote_listing.read().await.get(root).cloned()
    }

    /// 按根名称查找配对文件夹
    pub fn paired_folder(&self, root: &str) -> Result<PairedFolder> {
        self.config
            .paired_folders()?
            .into_iter()
            .find(|f| f.root_name() == root)
            .ok_or_else(|| SyncError::Config(format!("未找到配对文件夹: {}", root)))
    }

    pub async fn list_local(&self, root: &str, relative: &str) -> Result<Option<RawNode>> {
        let folder = self.paired_folder(root)?;
        self.local_scanner
            .list(Path::new(&folder.local_path), root, relative)
            .await
    }

    pub async fn list_remote(&self, root: &str, relative: &str) -> Result<Option<RawNode>> {
        let folder = self.paired_folder(root)?;
        self.remote_scanner
            .list(&self.connections, &folder.remote_path, root, relative)
            .await
    }

    /// 并发列举两侧，并让本地结果也排除远程新发现的拒绝访问路径
    async fn list_both(&self, root: &str, relative: &str) -> Result<(Option<RawNode>, Option<RawNode>)> {
        let (local, remote) = tokio::join!(self.list_local(root, relative), self.list_remote(root, relative));
        let mut local = local?;
        let remote = remote?;

        if let Some(node) = local.as_mut() {
            let pruned = prune_ignored(node, &self.ignore);
            if pruned > 0 {
                debug!("本地列举移除 {} 个拒绝访问的路径", pruned);
            }
        }
        if local.as_ref().is_some_and(|n| self.ignore.is_ignored(&n.relative_path)) {
            local = None;
        }
        Ok((local, remote))
    }

    /// 比较所有配对文件夹，替换整棵比较树
    pub async fn compare_all(&self) -> Result<ComparisonSummary> {
        let start = Instant::now();
        let folders = self.config.paired_folders()?;
        let mut summary = ComparisonSummary::default();
        let mut roots = Vec::with_capacity(folders.len());

        for folder in &folders {
            let root = folder.root_name();
            info!("比较配对文件夹: {} <-> {}", folder.local_path, folder.remote_path);
            let (local, remote) = self.list_both(&root, "").await?;
            let compared = compare_file_nodes(local.as_ref(), remote.as_ref());

            {
                let mut listing = self.remote_listing.write().await;
                match remote {
                    Some(node) => listing.insert(root.clone(), node),
                    None => listing.remove(&root),
                };
            }

            let mut store = self.store.write().await;
            match compared {
                Some(tree) => {
                    summary.merge(ComparisonSummary::of(&tree));
                    self.folder_state.lock().await.expand_changed(&root, &tree);
                    store.set_root(&root, tree);
                }
                None => {
                    warn!("配对文件夹两侧都不存在: {}", root);
                    store.remove_root(&root);
                }
            }
            roots.push(root);
        }

        // 去掉已不在配置中的根
        {
            let mut store = self.store.write().await;
            let stale: Vec<String> = store
                .roots()
                .keys()
                .filter(|k| !roots.contains(*k))
                .cloned()
                .collect();
            for root in stale {
                store.remove_root(&root);
                self.remote_listing.write().await.remove(&root);
                self.folder_state.lock().await.clear_root(&root);
            }
        }

        self.persist().await?;
        self.schedule_folder_state().await;

        info!(
            "比较完成: 新增 {}, 删除 {}, 修改 {}, 未变 {} (耗时 {:?})",
            summary.added,
            summary.removed,
            summary.modified,
            summary.unchanged,
            start.elapsed()
        );
        Ok(summary)
    }

    /// 只重新比较一个路径，把结果并入已有的比较树
    ///
    /// 父目录还不在比较树中时，改为比较最近的已知祖先之下的那一层
    pub async fn compare_entry(&self, root: &str, relative: &str) -> Result<RefreshTarget> {
        let relative = self.nearest_comparable(root, normalize_relative(relative)).await;
        let (local, remote) = self.list_both(root, &relative).await?;
        let compared = compare_file_nodes(local.as_ref(), remote.as_ref());
        debug!(
            "增量比较 {}/{}: {:?}",
            root,
            relative,
            compared.as_ref().map(|n| n.status())
        );

        self.merge_remote_listing(root, &relative, remote).await;

        let target = {
            let mut store = self.store.write().await;
            match compared {
                Some(node) => store.replace(root, node)?,
                None if store.find_by_path(root, &relative).is_some() => {
                    store.remove(root, &relative, Removal::Detach)?
                }
                None => RefreshTarget {
                    root: root.to_string(),
                    relative_path: split_parent(&relative)
                        .map(|(parent, _)| parent.to_string())
                        .unwrap_or_default(),
                },
            }
        };

        self.persist().await?;
        Ok(target)
    }

    async fn nearest_comparable(&self, root: &str, relative: String) -> String {
        let store = self.store.read().await;
        let mut path = relative;
        while let Some((parent, _)) = split_parent(&path) {
            if store.find_by_path(root, parent).is_some_and(|n| n.is_directory()) {
                break;
            }
            path = parent.to_string();
        }
        path
    }

    /// 上次列举时缓存的远程节点 hash
    pub(crate) async fn cached_remote_hash(&self, root: &str, relative: &str) -> Option<String> {
        self.remote_listing
            .read()
            .await
            .get(root)
            .and_then(|tree| tree.descendant(relative))
            .and_then(|node| node.hash.clone())
    }

    /// 把单个路径的远程列举结果并入缓存的远程树
    pub(crate) async fn merge_remote_listing(&self, root: &str, relative: &str, remote: Option<RawNode>) {
        let mut listing = self.remote_listing.write().await;
        let Some((parent, name)) = split_parent(relative) else {
            match remote {
                Some(node) => listing.insert(root.to_string(), node),
                None => listing.remove(root),
            };
            return;
        };
        let Some(tree) = listing.get_mut(root) else {
            return;
        };
        let Some(parent_node) = tree.descendant_mut(parent) else {
            return;
        };
        match remote {
            Some(node) => {
                if parent_node.add_child(node).is_err() {
                    debug!("远程缓存中父节点不是目录: {}", parent);
                }
            }
            None => {
                parent_node.remove_child(name);
            }
        }
        finalize_directory_hashes(tree);
    }

    /// 在比较树上重新计算 show_in_tree
    pub async fn refresh_visibility(&self, only_changes: bool) {
        let mut store = self.store.write().await;
        let roots: Vec<String> = store.roots().keys().cloned().collect();
        for root in roots {
            if let Some(tree) = store.find_by_path_mut(&root, "") {
                tree.refresh_visibility(only_changes);
            }
        }
    }

    /// 查询比较树中的节点
    pub async fn find(&self, root: &str, relative: &str) -> Option<ComparisonNode> {
        self.store.read().await.find_by_path(root, relative).cloned()
    }

    pub async fn set_folder_expanded(&self, root: &str, relative: &str, expanded: bool) {
        let changed = self
            .folder_state
            .lock()
            .await
            .set_expanded(root, relative, expanded);
        if changed {
            self.schedule_folder_state().await;
        }
    }

    pub async fn is_folder_expanded(&self, root: &str, relative: &str) -> bool {
        self.folder_state.lock().await.is_expanded(root, relative)
    }

    pub async fn folder_state(&self) -> FolderState {
        self.folder_state.lock().await.clone()
    }

    pub async fn clear_folder_state(&self) {
        self.folder_state.lock().await.clear();
        self.schedule_folder_state().await;
    }

    async fn schedule_folder_state(&self) {
        let state = self.folder_state.lock().await.clone();
        self.folder_writer.schedule(state);
    }

    /// 立即保存比较树与远程列举
    pub async fn persist(&self) -> Result<()> {
        {
            let store = self.store.read().await;
            self.persistence.save_comparisons(store.roots()).await?;
        }
        let listing = self.remote_listing.read().await;
        self.persistence.save_remote_listing(&listing).await
    }

    /// 写出待保存的展开状态并断开远程连接
    pub async fn shutdown(&self) {
        self.folder_writer.shutdown().await;
        self.connections.shutdown().await;
        info!("同步引擎已关闭");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::core::node::ComparisonStatus;
    use crate::remote::fake::{settings, FakeConnector};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// 本地与"远程"都是临时目录下的真实目录
    pub(crate) struct Fixture {
        pub dir: TempDir,
        pub local: PathBuf,
        pub remote: PathBuf,
        pub engine: SyncEngine,
        pub persistence: Persistence,
        pub connector: Arc<FakeConnector>,
    }

    impl Fixture {
        pub fn write_local(&self, path: &str, content: &str) {
            write(&self.local.join(path), content);
        }

        pub fn write_remote(&self, path: &str, content: &str) {
            write(&self.remote.join(path), content);
        }

        pub async fn status(&self, path: &str) -> Option<ComparisonStatus> {
            self.engine.find("project", path).await.map(|n| n.status())
        }
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub(crate) fn fixture(ignore: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local/project");
        let remote = dir.path().join("remote/project");
        fs::create_dir_all(&local).unwrap();
        fs::create_dir_all(&remote).unwrap();

        let config = WorkspaceConfig {
            connection: Some(settings("remote")),
            paired_folders: vec![PairedFolder {
                local_path: local.to_string_lossy().to_string(),
                remote_path: remote.to_string_lossy().to_string(),
            }],
            ignore_list: ignore.iter().map(|s| s.to_string()).collect(),
        };
        let sync = SyncSettings::default();
        let connector = FakeConnector::new();
        let connections = ConnectionManager::new(settings("remote"), sync.clone(), connector.clone());
        let persistence = Persistence::in_memory();
        let engine = SyncEngine::new(Arc::new(config), connections, sync, persistence.clone());

        Fixture {
            dir,
            local,
            remote,
            engine,
            persistence,
            connector,
        }
    }

    #[tokio::test]
    async fn test_compare_all_classifies_both_sides() {
        let f = fixture(&["*.tmp"]);
        f.write_local("same.txt", "same");
        f.write_remote("same.txt", "same");
        f.write_local("a/b.txt", "X");
        f.write_remote("a/b.txt", "Y");
        f.write_local("only_local/new.txt", "n");
        f.write_remote("only_remote.txt", "r");
        f.write_local("scratch.tmp", "ignored");

        let summary = f.engine.compare_all().await.unwrap();
        assert_eq!(
            summary,
            ComparisonSummary {
                added: 1,
                removed: 1,
                modified: 1,
                unchanged: 1
            }
        );

        assert_eq!(f.status("").await, Some(ComparisonStatus::Modified));
        assert_eq!(f.status("same.txt").await, Some(ComparisonStatus::Unchanged));
        assert_eq!(f.status("a").await, Some(ComparisonStatus::Modified));
        assert_eq!(f.status("a/b.txt").await, Some(ComparisonStatus::Modified));
        assert_eq!(f.status("only_local").await, Some(ComparisonStatus::Added));
        assert_eq!(f.status("only_remote.txt").await, Some(ComparisonStatus::Removed));
        assert_eq!(f.status("scratch.tmp").await, None);

        // 包含变化的目录被展开
        assert!(f.engine.is_folder_expanded("project", "a").await);
        assert!(f.engine.is_folder_expanded("project", "").await);

        // 比较树与远程列举已持久化
        let saved = f.persistence.load_comparisons().await.unwrap();
        assert_eq!(saved["project"], f.engine.find("project", "").await.unwrap());
        assert!(f.engine.remote_snapshot("project").await.unwrap().descendant("only_remote.txt").is_some());

        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_compare_entry_updates_single_path() {
        let f = fixture(&[]);
        f.write_local("a/b.txt", "X");
        f.write_remote("a/b.txt", "Y");
        f.write_local("a/c.txt", "same");
        f.write_remote("a/c.txt", "same");
        f.engine.compare_all().await.unwrap();
        assert_eq!(f.status("a").await, Some(ComparisonStatus::Modified));

        // 远程被其他途径改成一致
        f.write_remote("a/b.txt", "X");
        let target = f.engine.compare_entry("project", "a/b.txt").await.unwrap();
        assert_eq!(f.status("a/b.txt").await, Some(ComparisonStatus::Unchanged));
        assert_eq!(f.status("a").await, Some(ComparisonStatus::Unchanged));
        assert_eq!(f.status("").await, Some(ComparisonStatus::Unchanged));
        assert_eq!(target.relative_path, "");

        // 两侧都删除后节点被摘除
        fs::remove_file(f.local.join("a/c.txt")).unwrap();
        fs::remove_file(f.remote.join("a/c.txt")).unwrap();
        f.engine.compare_entry("project", "a/c.txt").await.unwrap();
        assert_eq!(f.status("a/c.txt").await, None);
        assert!(f.engine.remote_snapshot("project").await.unwrap().descendant("a/c.txt").is_none());

        // 新增目录整体比较
        f.write_local("a/new/x.txt", "x");
        f.engine.compare_entry("project", "a/new").await.unwrap();
        assert_eq!(f.status("a/new").await, Some(ComparisonStatus::Added));
        assert_eq!(f.status("a/new/x.txt").await, Some(ComparisonStatus::Added));
        assert_eq!(f.status("a").await, Some(ComparisonStatus::Modified));

        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_compare_entry_under_unknown_parent() {
        let f = fixture(&[]);
        f.write_local("a.txt", "a");
        f.write_remote("a.txt", "a");
        f.engine.compare_all().await.unwrap();

        // 父目录尚未出现在比较树中，改为比较 deep 整体
        f.write_local("deep/er/x.txt", "x");
        f.engine.compare_entry("project", "deep/er/x.txt").await.unwrap();
        assert_eq!(f.status("deep").await, Some(ComparisonStatus::Added));
        assert_eq!(f.status("deep/er/x.txt").await, Some(ComparisonStatus::Added));
        assert_eq!(f.status("").await, Some(ComparisonStatus::Modified));
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_permission_denied_is_pruned_on_both_sides() {
        let f = fixture(&[]);
        f.write_local("ok.txt", "ok");
        f.write_remote("ok.txt", "ok");
        f.write_local("secret/key.pem", "local key");
        f.write_remote("secret/key.pem", "remote key");
        f.connector.deny("secret");

        f.engine.compare_all().await.unwrap();
        assert_eq!(f.status("secret").await, None);
        assert_eq!(f.status("secret/key.pem").await, None);
        assert_eq!(f.status("ok.txt").await, Some(ComparisonStatus::Unchanged));
        assert_eq!(f.status("").await, Some(ComparisonStatus::Unchanged));
        assert!(f.engine.remote_snapshot("project").await.unwrap().descendant("secret").is_none());
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_backslash_names_compare_unchanged() {
        let f = fixture(&[]);
        f.write_local("a\\b.txt", "same");
        f.write_remote("a\\b.txt", "same");
        f.write_local("dir/c\\d.txt", "same");
        f.write_remote("dir/c\\d.txt", "same");

        f.engine.compare_all().await.unwrap();
        assert_eq!(f.status("a\\b.txt").await, Some(ComparisonStatus::Unchanged));
        assert_eq!(f.status("dir/c\\d.txt").await, Some(ComparisonStatus::Unchanged));
        assert_eq!(f.status("").await, Some(ComparisonStatus::Unchanged));
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_state_restores_previous_session() {
        let f = fixture(&[]);
        f.write_local("x.txt", "1");
        f.engine.compare_all().await.unwrap();
        f.engine.set_folder_expanded("project", "docs", true).await;
        f.engine.shutdown().await;

        let config = WorkspaceConfig::default();
        let sync = SyncSettings::default();
        let connections = ConnectionManager::new(settings("remote"), sync.clone(), FakeConnector::new());
        let restored = SyncEngine::new(Arc::new(config), connections, sync, f.persistence.clone());
        restored.load_state().await.unwrap();

        assert_eq!(
            restored.find("project", "x.txt").await.map(|n| n.status()),
            Some(ComparisonStatus::Added)
        );
        assert!(restored.is_folder_expanded("project", "docs").await);
        assert!(restored.is_folder_expanded("project", "").await);
        restored.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_configuration_fails_fast() {
        let sync = SyncSettings::default();
        let connections = ConnectionManager::new(settings("remote"), sync.clone(), FakeConnector::new());
        let engine = SyncEngine::new(
            Arc::new(WorkspaceConfig::default()),
            connections,
            sync,
            Persistence::in_memory(),
        );
        assert!(matches!(engine.compare_all().await, Err(SyncError::Config(_))));
        assert!(matches!(engine.list_local("nope", "").await, Err(SyncError::Config(_))));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_visibility_filters_unchanged() {
        let f = fixture(&[]);
        f.write_local("same.txt", "s");
        f.write_remote("same.txt", "s");
        f.write_local("new.txt", "n");
        f.engine.compare_all().await.unwrap();

        f.engine.refresh_visibility(true).await;
        assert!(!f.engine.find("project", "same.txt").await.unwrap().meta.show_in_tree);
        assert!(f.engine.find("project", "new.txt").await.unwrap().meta.show_in_tree);

        f.engine.refresh_visibility(false).await;
        assert!(f.engine.find("project", "same.txt").await.unwrap().meta.show_in_tree);
        f.engine.shutdown().await;
    }
}
