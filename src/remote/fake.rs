//! 测试用的远程实现：SSH 命令在本机 `sh -c` 执行，SFTP 直接操作本地文件系统

use super::{CommandOutput, Connector, RemoteEntry, Session, SftpSession, SshSession};
use crate::config::ConnectionSettings;
use crate::core::node::NodeKind;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn settings(host: &str) -> ConnectionSettings {
    ConnectionSettings {
        hostname: host.to_string(),
        port: 22,
        username: "tester".to_string(),
        password: Some("secret".to_string()),
        private_key_path: None,
        passphrase: None,
    }
}

#[derive(Default)]
pub struct FakeConnector {
    ssh_connects: AtomicU32,
    sftp_connects: AtomicU32,
    closes: Arc<AtomicU32>,
    unreachable: Mutex<HashSet<String>>,
    denied: Arc<Mutex<Vec<String>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unreachable(&self, host: &str) {
        self.unreachable.lock().unwrap().insert(host.to_string());
    }

    /// 让 `find` / `sha256sum` 把该相对路径当作无权读取：
    /// 其下的条目不再输出，stderr 报告 Permission denied，退出码为 1
    pub fn deny(&self, relative: &str) {
        self.denied.lock().unwrap().push(relative.to_string());
    }

    pub fn ssh_connects(&self) -> u32 {
        self.ssh_connects.load(Ordering::SeqCst)
    }

    pub fn sftp_connects(&self) -> u32 {
        self.sftp_connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn probe(&self, settings: &ConnectionSettings, _timeout: Duration) -> Result<()> {
        if self.unreachable.lock().unwrap().contains(&settings.hostname) {
            return Err(SyncError::Unreachable {
                host: settings.hostname.clone(),
                port: settings.port,
            });
        }
        Ok(())
    }

    async fn connect_ssh(&self, _settings: &ConnectionSettings) -> Result<Arc<dyn SshSession>> {
        self.ssh_connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LocalShell {
            closes: self.closes.clone(),
            denied: self.denied.clone(),
        }))
    }

    async fn connect_sftp(&self, _settings: &ConnectionSettings) -> Result<Arc<dyn SftpSession>> {
        self.sftp_connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LocalFs {
            closes: self.closes.clone(),
        }))
    }
}

pub struct LocalShell {
    closes: Arc<AtomicU32>,
    denied: Arc<Mutex<Vec<String>>>,
}

impl LocalShell {
    fn apply_denied(&self, output: &mut CommandOutput) {
        for denied in self.denied.lock().unwrap().iter() {
            let inside = format!("./{}/", denied);
            output.stdout = output
                .stdout
                .lines()
                .filter(|line| !line.contains(&inside))
                .map(|line| format!("{}\n", line))
                .collect();
            output.stderr.push_str(&format!("find: './{}': Permission denied\n", denied));
            if output.exit_code == 0 {
                output.exit_code = 1;
            }
        }
    }
}

#[async_trait]
impl Session for LocalShell {
    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SshSession for LocalShell {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await?;
        let mut result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().map(|c| c as u32).unwrap_or(255),
        };
        if command.contains("find ") && result.exit_code <= 1 {
            self.apply_denied(&mut result);
        }
        Ok(result)
    }
}

pub struct LocalFs {
    closes: Arc<AtomicU32>,
}

fn entry_from(name: String, meta: &std::fs::Metadata) -> RemoteEntry {
    let modified = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    RemoteEntry {
        name,
        kind: if meta.is_dir() { NodeKind::Directory } else { NodeKind::File },
        size: if meta.is_dir() { 0 } else { meta.len() },
        modified,
    }
}

#[async_trait]
impl Session for LocalFs {
    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SftpSession for LocalFs {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            entries.push(entry_from(entry.file_name().to_string_lossy().to_string(), &meta));
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<RemoteEntry> {
        let meta = tokio::fs::metadata(path).await?;
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(entry_from(name, &meta))
    }

    async fn get(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        Ok(tokio::fs::copy(remote_path, local_path).await?)
    }

    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<u64> {
        Ok(tokio::fs::copy(local_path, remote_path).await?)
    }

    async fn delete(&self, path: &str, is_dir: bool) -> Result<()> {
        if is_dir {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        Ok(tokio::fs::rename(from, to).await?)
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<()> {
        if recursive {
            tokio::fs::create_dir_all(path).await?;
        } else {
            tokio::fs::create_dir(path).await?;
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeKind>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(Some(NodeKind::Directory)),
            Ok(_) => Ok(Some(NodeKind::File)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
