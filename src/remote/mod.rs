pub mod connection;
pub mod russh_client;

#[cfg(test)]
pub(crate) mod fake;

use crate::config::ConnectionSettings;
use crate::core::node::NodeKind;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use connection::{ConnectionManager, ConnectionRegistry};
pub use russh_client::RusshConnector;

/// 远程命令的执行结果
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

/// 远程目录项
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// 可关闭的会话
#[async_trait]
pub trait Session: Send + Sync {
    /// 关闭会话（尽力而为）
    async fn close(&self);
}

/// SSH 命令执行接口
#[async_trait]
pub trait SshSession: Session {
    async fn exec(&self, command: &str) -> Result<CommandOutput>;
}

/// SFTP 文件操作接口
#[async_trait]
pub trait SftpSession: Session {
    /// 列出目录内容（不含 . 和 ..）
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    async fn stat(&self, path: &str) -> Result<RemoteEntry>;

    /// 下载到本地文件，返回字节数
    async fn get(&self, remote_path: &str, local_path: &Path) -> Result<u64>;

    /// 上传本地文件，返回字节数
    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<u64>;

    /// 删除文件或目录（目录递归删除）
    async fn delete(&self, path: &str, is_dir: bool) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<()>;

    /// 不存在时返回 None
    async fn exists(&self, path: &str) -> Result<Option<NodeKind>>;
}

/// 建立远程会话
#[async_trait]
pub trait Connector: Send + Sync {
    /// TCP 可达性探测
    async fn probe(&self, settings: &ConnectionSettings, timeout: Duration) -> Result<()> {
        let unreachable = || SyncError::Unreachable {
            host: settings.hostname.clone(),
            port: settings.port,
        };
        match tokio::time::timeout(
            timeout,
            tokio::net::TcpStream::connect((settings.hostname.as_str(), settings.port)),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(unreachable()),
        }
    }

    async fn connect_ssh(&self, settings: &ConnectionSettings) -> Result<Arc<dyn SshSession>>;

    async fn connect_sftp(&self, settings: &ConnectionSettings) -> Result<Arc<dyn SftpSession>>;
}

/// POSIX 路径拼接
pub fn posix_join(base: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return relative.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), relative)
}

/// POSIX 父目录
pub fn posix_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

/// 单引号转义，用于拼接 shell 命令
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
