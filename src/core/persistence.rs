//! 状态持久化
//!
//! 三个 JSON 文档：远程列举、比较树、目录展开状态。
//! 底层是按键读写字节的 blob 存储，目录按工作区标识的哈希划分。

use super::folder_state::FolderState;
use super::hasher::content_hash;
use super::node::{ComparisonNode, RawNode};
use crate::error::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const REMOTE_FILES_JSON: &str = "remoteFiles.json";
pub const COMPARE_FILES_JSON: &str = "compareFiles.json";
pub const FOLDERS_STATE_JSON: &str = "foldersState.json";

/// 键值字节存储
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn save(&self, key: &str, data: &[u8]) -> Result<()>;
}

/// 以文件形式保存在 `<base>/<工作区哈希>/<key>`
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(base_dir: &Path, workspace_id: &str) -> Self {
        Self {
            dir: base_dir.join(Self::workspace_hash(workspace_id)),
        }
    }

    fn workspace_hash(workspace_id: &str) -> String {
        content_hash(workspace_id.as_bytes())[..16].to_string()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl BlobStore for JsonFileStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.dir.join(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        // 先写临时文件再改名，避免写到一半留下损坏的文档
        let path = self.dir.join(key);
        let tmp = self.dir.join(format!("{}.tmp", key));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("已保存 {:?} ({} 字节)", path, data.len());
        Ok(())
    }
}

/// 内存存储，不落盘
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(blobs.get(key).cloned())
    }

    async fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

/// 三个持久化文档的类型化读写
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn BlobStore>,
}

impl Persistence {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBlobStore::default()))
    }

    /// 读取文档；不存在或已损坏时返回 None
    async fn load_document<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(data) = self.store.load(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&data) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("{} 已损坏，忽略: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn save_document<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save(key, &data).await
    }

    pub async fn load_remote_listing(&self) -> Result<BTreeMap<String, RawNode>> {
        Ok(self.load_document(REMOTE_FILES_JSON).await?.unwrap_or_default())
    }

    pub async fn save_remote_listing(&self, roots: &BTreeMap<String, RawNode>) -> Result<()> {
        self.save_document(REMOTE_FILES_JSON, roots).await
    }

    pub async fn load_comparisons(&self) -> Result<BTreeMap<String, ComparisonNode>> {
        let roots: BTreeMap<String, ComparisonNode> =
            self.load_document(COMPARE_FILES_JSON).await?.unwrap_or_default();
        if !roots.is_empty() {
            info!("已加载 {} 个比较树", roots.len());
        }
        Ok(roots)
    }

    pub async fn save_comparisons(&self, roots: &BTreeMap<String, ComparisonNode>) -> Result<()> {
        self.save_document(COMPARE_FILES_JSON, roots).await
    }

    pub async fn load_folder_state(&self) -> Result<FolderState> {
        let entries: Option<BTreeMap<String, bool>> = self.load_document(FOLDERS_STATE_JSON).await?;
        Ok(FolderState::from_entries(entries.unwrap_or_default()))
    }

    pub async fn save_folder_state(&self, state: &FolderState) -> Result<()> {
        self.save_document(FOLDERS_STATE_JSON, state.entries()).await
    }
}
