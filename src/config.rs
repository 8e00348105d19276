//! 应用配置模块

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 同步参数（config.json 中的 "sync" 段）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// 最后一个操作结束后多久断开连接（毫秒）
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// 瞬时错误的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒），指数退避
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// TCP 可达性探测超时（毫秒）
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// SSH/SFTP 建连超时（毫秒）
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 本地哈希与批量传输的并发数
    #[serde(default = "default_hash_concurrency")]
    pub hash_concurrency: usize,
    /// 文件夹展开状态的去抖窗口（毫秒）
    #[serde(default = "default_folder_state_debounce_ms")]
    pub folder_state_debounce_ms: u64,
}

fn default_idle_timeout_ms() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_hash_concurrency() -> usize {
    9 // 超过 9 个并发容易耗尽文件描述符
}

fn default_folder_state_debounce_ms() -> u64 {
    500
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            hash_concurrency: default_hash_concurrency(),
            folder_state_debounce_ms: default_folder_state_debounce_ms(),
        }
    }
}

impl SyncSettings {
    /// 从配置文件加载同步参数
    pub fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join("config.json");
        if config_file.exists() {
            if let Ok(content) = fs::read_to_string(&config_file) {
                if let Ok(config) = serde_json::from_str::<serde_json::Value>(&content) {
                    if let Some(section) = config.get("sync") {
                        if let Ok(sync) = serde_json::from_value::<SyncSettings>(section.clone()) {
                            return sync;
                        }
                    }
                }
            }
        }
        Self::default()
    }

    /// 保存同步参数
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        let config_file = config_dir.join("config.json");

        // 读取现有配置
        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        config["sync"] = serde_json::to_value(self)?;

        let content = serde_json::to_string_pretty(&config)?;
        fs::write(&config_file, content)?;

        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn folder_state_debounce(&self) -> Duration {
        Duration::from_millis(self.folder_state_debounce_ms)
    }
}

/// 远程服务器连接配置，按值比较
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

fn default_port() -> u16 {
    22
}

/// 解析后的认证方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Password(String),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl ConnectionSettings {
    /// 解析认证方式，私钥优先；`~` 展开为用户目录
    pub fn auth(&self) -> Result<AuthMethod> {
        if let Some(path) = self.private_key_path.as_deref().filter(|p| !p.is_empty()) {
            return Ok(AuthMethod::PrivateKey {
                path: expand_home(path),
                passphrase: self.passphrase.clone().filter(|p| !p.is_empty()),
            });
        }
        if let Some(password) = &self.password {
            return Ok(AuthMethod::Password(password.clone()));
        }
        Err(SyncError::Config(format!(
            "{}@{} 未配置密码或私钥",
            self.username, self.hostname
        )))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches(['/', '\\']));
        }
    }
    PathBuf::from(path)
}

/// 本地/远程文件夹配对，一个同步根
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedFolder {
    pub local_path: String,
    pub remote_path: String,
}

impl PairedFolder {
    /// 根名称：本地路径的最后一段
    pub fn root_name(&self) -> String {
        Path::new(&self.local_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.local_path.clone())
    }
}

/// 配置提供者：核心只通过这个接口读取配置
pub trait ConfigProvider: Send + Sync {
    fn resolved_connection(&self) -> Result<ConnectionSettings>;
    fn paired_folders(&self) -> Result<Vec<PairedFolder>>;
    fn ignore_patterns(&self) -> Vec<String>;
}

/// 工作区配置文件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionSettings>,
    #[serde(default)]
    pub paired_folders: Vec<PairedFolder>,
    #[serde(default)]
    pub ignore_list: Vec<String>,
}

impl WorkspaceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("无法读取工作区配置 {}: {}", path.display(), e))
        })?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// 按根名称查找配对文件夹
    pub fn paired_folder(&self, root_name: &str) -> Option<&PairedFolder> {
        self.paired_folders
            .iter()
            .find(|f| f.root_name() == root_name)
    }
}

impl ConfigProvider for WorkspaceConfig {
    fn resolved_connection(&self) -> Result<ConnectionSettings> {
        let connection = self
            .connection
            .clone()
            .ok_or_else(|| SyncError::Config("未配置远程服务器".to_string()))?;
        // 提前校验认证方式
        connection.auth()?;
        Ok(connection)
    }

    fn paired_folders(&self) -> Result<Vec<PairedFolder>> {
        if self.paired_folders.is_empty() {
            return Err(SyncError::Config("未配置配对文件夹".to_string()));
        }
        Ok(self.paired_folders.clone())
    }

    fn ignore_patterns(&self) -> Vec<String> {
        self.ignore_list.clone()
    }
}
