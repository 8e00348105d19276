//! 基于 russh / russh-sftp 的远程传输实现

use super::{CommandOutput, Connector, RemoteEntry, Session, SftpSession, SshSession};
use crate::config::{AuthMethod, ConnectionSettings};
use crate::core::node::NodeKind;
use crate::error::{Result, SyncError, TransportErrorKind};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use russh::{client, ChannelMsg, Disconnect};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::FileAttributes;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

/// known_hosts 校验结果
#[derive(Debug, Clone, PartialEq, Eq)]
enum HostKey {
    Known,
    Unknown,
    /// 与 known_hosts 第 N 行记录的密钥不一致
    Changed(usize),
    Unreadable(String),
}

fn classify_host_key(result: std::result::Result<bool, russh_keys::Error>) -> HostKey {
    match result {
        Ok(true) => HostKey::Known,
        Ok(false) => HostKey::Unknown,
        Err(russh_keys::Error::KeyChanged { line }) => HostKey::Changed(line),
        Err(e) => HostKey::Unreadable(e.to_string()),
    }
}

/// russh 客户端回调
///
/// 主机密钥按 `~/.ssh/known_hosts` 校验：记录不一致时拒绝连接，
/// 没有记录（或文件不可读）时接受并记录警告，不会写回 known_hosts。
pub(crate) struct SshHandler {
    host: String,
    port: u16,
}

#[async_trait]
impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let checked = russh_keys::check_known_hosts(&self.host, self.port, server_public_key);
        match classify_host_key(checked) {
            HostKey::Known => Ok(true),
            HostKey::Unknown => {
                warn!("{}:{} 不在 known_hosts 中，接受该主机密钥", self.host, self.port);
                Ok(true)
            }
            HostKey::Changed(line) => {
                error!(
                    "{}:{} 的主机密钥与 known_hosts 第 {} 行不一致，拒绝连接",
                    self.host, self.port, line
                );
                Ok(false)
            }
            HostKey::Unreadable(e) => {
                warn!("无法读取 known_hosts ({})，接受 {}:{} 的主机密钥", e, self.host, self.port);
                Ok(true)
            }
        }
    }
}

fn ssh_error(context: &str, e: russh::Error) -> SyncError {
    let kind = match &e {
        russh::Error::IO(io) => match io.kind() {
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                TransportErrorKind::ConnectionReset
            }
            std::io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
            _ => TransportErrorKind::GenericClient,
        },
        russh::Error::Disconnect => TransportErrorKind::ConnectionReset,
        other if other.to_string().to_lowercase().contains("timeout") => TransportErrorKind::Timeout,
        _ => TransportErrorKind::GenericClient,
    };
    SyncError::transport(kind, format!("{}: {}", context, e))
}

fn sftp_error(context: &str, path: &str, e: SftpError) -> SyncError {
    match e {
        SftpError::Status(status) => SyncError::Remote(format!(
            "{} '{}': {:?} {}",
            context, path, status.status_code, status.error_message
        )),
        SftpError::Timeout => {
            SyncError::transport(TransportErrorKind::Timeout, format!("{} '{}': 超时", context, path))
        }
        other => SyncError::transport(
            TransportErrorKind::GenericClient,
            format!("{} '{}': {}", context, path, other),
        ),
    }
}

fn io_error(context: &str, path: &str, e: std::io::Error) -> SyncError {
    SyncError::transport(
        TransportErrorKind::GenericClient,
        format!("{} '{}': {}", context, path, e),
    )
}

fn to_datetime(mtime: Option<u32>) -> DateTime<Utc> {
    mtime
        .and_then(|t| Utc.timestamp_opt(t as i64, 0).single())
        .unwrap_or_else(Utc::now)
}

fn entry_from(name: String, attrs: &FileAttributes) -> RemoteEntry {
    let is_dir = attrs.is_dir();
    RemoteEntry {
        name,
        kind: if is_dir { NodeKind::Directory } else { NodeKind::File },
        size: if is_dir { 0 } else { attrs.size.unwrap_or(0) },
        modified: to_datetime(attrs.mtime),
    }
}

/// 使用 russh 建立 SSH / SFTP 会话
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new() -> Self {
        let config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }

    async fn authenticated(&self, settings: &ConnectionSettings) -> Result<client::Handle<SshHandler>> {
        let mut ssh = client::connect(
            self.config.clone(),
            (settings.hostname.as_str(), settings.port),
            SshHandler {
                host: settings.hostname.clone(),
                port: settings.port,
            },
        )
        .await
        .map_err(|e| ssh_error("SSH 连接失败", e))?;

        let accepted = match settings.auth()? {
            AuthMethod::Password(password) => ssh
                .authenticate_password(&settings.username, password)
                .await
                .map_err(|e| SyncError::Auth(format!("密码认证失败: {}", e)))?,
            AuthMethod::PrivateKey { path, passphrase } => {
                let key_pair = russh_keys::load_secret_key(&path, passphrase.as_deref())
                    .map_err(|e| SyncError::Auth(format!("无法加载私钥 {}: {}", path.display(), e)))?;
                ssh.authenticate_publickey(&settings.username, Arc::new(key_pair))
                    .await
                    .map_err(|e| SyncError::Auth(format!("密钥认证失败: {}", e)))?
            }
        };

        if !accepted {
            return Err(SyncError::Auth(format!(
                "服务器拒绝了 {}@{} 的认证",
                settings.username, settings.hostname
            )));
        }

        debug!("SSH 认证成功: {}@{}", settings.username, settings.address());
        Ok(ssh)
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect_ssh(&self, settings: &ConnectionSettings) -> Result<Arc<dyn SshSession>> {
        let handle = self.authenticated(settings).await?;
        Ok(Arc::new(RusshSsh { handle }))
    }

    async fn connect_sftp(&self, settings: &ConnectionSettings) -> Result<Arc<dyn SftpSession>> {
        let handle = self.authenticated(settings).await?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ssh_error("打开通道失败", e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ssh_error("请求 SFTP 子系统失败", e))?;
        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| sftp_error("初始化 SFTP 会话失败", "", e))?;

        Ok(Arc::new(RusshSftp { handle, sftp }))
    }
}

async fn disconnect(handle: &client::Handle<SshHandler>) {
    if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
        debug!("断开 SSH 连接时出错: {}", e);
    }
}

/// SSH 命令会话
pub struct RusshSsh {
    handle: client::Handle<SshHandler>,
}

#[async_trait]
impl Session for RusshSsh {
    async fn close(&self) {
        disconnect(&self.handle).await;
    }
}

#[async_trait]
impl SshSession for RusshSsh {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ssh_error("打开通道失败", e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ssh_error("执行命令失败", e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code: Option<u32> = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } => {
                    if ext == 1 {
                        stderr.extend_from_slice(data);
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                _ => {}
            }
        }

        let exit_code = exit_code.ok_or_else(|| {
            SyncError::transport(TransportErrorKind::GenericClient, "通道关闭但未返回退出码")
        })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code,
        })
    }
}

/// SFTP 会话
pub struct RusshSftp {
    handle: client::Handle<SshHandler>,
    sftp: RusshSftpSession,
}

impl RusshSftp {
    async fn remove_dir_recursive(&self, path: &str) -> Result<()> {
        let entries = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| sftp_error("读取目录失败", path, e))?;

        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let child = super::posix_join(path, &name);
            if entry.metadata().is_dir() {
                Box::pin(self.remove_dir_recursive(&child)).await?;
            } else {
                self.sftp
                    .remove_file(&child)
                    .await
                    .map_err(|e| sftp_error("删除文件失败", &child, e))?;
            }
        }

        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| sftp_error("删除目录失败", path, e))
    }
}

#[async_trait]
impl Session for RusshSftp {
    async fn close(&self) {
        disconnect(&self.handle).await;
    }
}

#[async_trait]
impl SftpSession for RusshSftp {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| sftp_error("读取目录失败", path, e))?;

        Ok(dir
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| entry_from(entry.file_name(), &entry.metadata()))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<RemoteEntry> {
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| sftp_error("获取元数据失败", path, e))?;
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        Ok(entry_from(name, &attrs))
    }

    async fn get(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        let mut remote = self
            .sftp
            .open(remote_path)
            .await
            .map_err(|e| sftp_error("打开远程文件失败", remote_path, e))?;
        let mut local = tokio::fs::File::create(local_path).await?;
        let bytes = tokio::io::copy(&mut remote, &mut local)
            .await
            .map_err(|e| io_error("下载失败", remote_path, e))?;
        local.flush().await?;
        Ok(bytes)
    }

    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<u64> {
        let mut local = tokio::fs::File::open(local_path).await?;
        let mut remote = self
            .sftp
            .create(remote_path)
            .await
            .map_err(|e| sftp_error("创建远程文件失败", remote_path, e))?;
        let bytes = tokio::io::copy(&mut local, &mut remote)
            .await
            .map_err(|e| io_error("上传失败", remote_path, e))?;
        remote
            .shutdown()
            .await
            .map_err(|e| io_error("关闭远程文件失败", remote_path, e))?;
        Ok(bytes)
    }

    async fn delete(&self, path: &str, is_dir: bool) -> Result<()> {
        if is_dir {
            self.remove_dir_recursive(path).await
        } else {
            self.sftp
                .remove_file(path)
                .await
                .map_err(|e| sftp_error("删除文件失败", path, e))
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| sftp_error("重命名失败", from, e))
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<()> {
        if !recursive {
            return self
                .sftp
                .create_dir(path)
                .await
                .map_err(|e| sftp_error("创建目录失败", path, e));
        }

        // 逐级创建缺失的目录
        let mut current = String::new();
        if path.starts_with('/') {
            current.push('/');
        }
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = if current.is_empty() || current == "/" {
                format!("{}{}", current, segment)
            } else {
                format!("{}/{}", current, segment)
            };
            let exists = self
                .sftp
                .try_exists(&current)
                .await
                .map_err(|e| sftp_error("检查目录失败", &current, e))?;
            if !exists {
                if let Err(e) = self.sftp.create_dir(&current).await {
                    warn!("创建目录失败 '{}': {}", current, e);
                    return Err(sftp_error("创建目录失败", &current, e));
                }
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeKind>> {
        let exists = self
            .sftp
            .try_exists(path)
            .await
            .map_err(|e| sftp_error("检查路径失败", path, e))?;
        if !exists {
            return Ok(None);
        }
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| sftp_error("获取元数据失败", path, e))?;
        Ok(Some(if attrs.is_dir() {
            NodeKind::Directory
        } else {
            NodeKind::File
        }))
    }
}
