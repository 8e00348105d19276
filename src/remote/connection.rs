//! 连接管理
//!
//! 每个远程配置共享一个 SSH 会话和一个 SFTP 会话：按需建立连接，
//! 按活动操作计数保持连接，计数归零后延迟断开；瞬时错误按指数退避重试。

use super::{Connector, Session, SftpSession, SshSession};
use crate::config::{ConnectionSettings, SyncSettings};
use crate::error::{Result, SyncError, TransportErrorKind};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 单个传输通道的状态
struct Slot<S: ?Sized> {
    label: &'static str,
    session: Mutex<Option<Arc<S>>>,
    active: AtomicUsize,
    pending_disconnect: StdMutex<Option<CancellationToken>>,
    idle_timeout: Duration,
}

impl<S: Session + ?Sized + 'static> Slot<S> {
    fn new(label: &'static str, idle_timeout: Duration) -> Self {
        Self {
            label,
            session: Mutex::new(None),
            active: AtomicUsize::new(0),
            pending_disconnect: StdMutex::new(None),
            idle_timeout,
        }
    }

    /// 操作开始：计数加一，并取消尚未触发的断开
    fn begin(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
        let pending = self
            .pending_disconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(token) = pending {
            debug!("{} 有新操作，取消空闲断开", self.label);
            token.cancel();
        }
    }

    /// 操作结束：计数归零时安排空闲断开
    fn end(self: &Arc<Self>) {
        if self.active.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }

        let token = CancellationToken::new();
        {
            let mut pending = self.pending_disconnect.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old) = pending.replace(token.clone()) {
                old.cancel();
            }
        }

        let slot = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(slot.idle_timeout) => {
                    let mut guard = slot.session.lock().await;
                    // 等待锁期间可能已有新操作开始
                    if token.is_cancelled() || slot.active.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    if let Some(session) = guard.take() {
                        drop(guard);
                        info!("{} 空闲超过 {:?}，断开连接", slot.label, slot.idle_timeout);
                        session.close().await;
                    }
                }
            }
        });
    }

    async fn current_or_connect<C, CFut>(&self, connect: C) -> Result<Arc<S>>
    where
        C: FnOnce() -> CFut,
        CFut: Future<Output = Result<Arc<S>>>,
    {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = connect().await?;
        debug!("{} 已连接", self.label);
        *guard = Some(session.clone());
        Ok(session)
    }

    /// 丢弃出错的会话，下次使用时重新连接
    async fn invalidate(&self, failed: &Arc<S>) {
        let mut guard = self.session.lock().await;
        let is_current = guard
            .as_ref()
            .map(|current| Arc::ptr_eq(current, failed))
            .unwrap_or(false);
        if is_current {
            guard.take();
            drop(guard);
            failed.close().await;
        }
    }

    async fn shutdown(&self) {
        let pending = self
            .pending_disconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(token) = pending {
            token.cancel();
        }
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }
    }

    async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }
}

struct Inner {
    settings: ConnectionSettings,
    sync: SyncSettings,
    connector: Arc<dyn Connector>,
    probed: Mutex<bool>,
    ssh: Arc<Slot<dyn SshSession>>,
    sftp: Arc<Slot<dyn SftpSession>>,
}

/// 连接管理器，可廉价克隆，克隆共享同一组会话
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        sync: SyncSettings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let idle = sync.idle_timeout();
        Self {
            inner: Arc::new(Inner {
                settings,
                sync,
                connector,
                probed: Mutex::new(false),
                ssh: Arc::new(Slot::new("SSH", idle)),
                sftp: Arc::new(Slot::new("SFTP", idle)),
            }),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    /// 在共享 SSH 会话上执行操作
    pub async fn with_ssh<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn SshSession>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let inner = &self.inner;
        self.run(&inner.ssh, || inner.connector.connect_ssh(&inner.settings), op)
            .await
    }

    /// 在共享 SFTP 会话上执行操作
    pub async fn with_sftp<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn SftpSession>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let inner = &self.inner;
        self.run(&inner.sftp, || inner.connector.connect_sftp(&inner.settings), op)
            .await
    }

    async fn run<S, T, C, CFut, F, Fut>(&self, slot: &Arc<Slot<S>>, connect: C, op: F) -> Result<T>
    where
        S: Session + ?Sized + 'static,
        C: Fn() -> CFut,
        CFut: Future<Output = Result<Arc<S>>>,
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        slot.begin();
        let _active = scopeguard::guard(slot.clone(), |slot| slot.end());

        let max_retries = self.inner.sync.max_retries;
        let base_delay = self.inner.sync.retry_base_delay();
        let mut attempt = 0u32;

        loop {
            let session = match slot.current_or_connect(|| self.open(&connect)).await {
                Ok(session) => session,
                Err(e) if e.is_transient() && attempt < max_retries => {
                    Self::backoff(slot.label, attempt, max_retries, base_delay, &e).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match op(session.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    slot.invalidate(&session).await;
                    Self::backoff(slot.label, attempt, max_retries, base_delay, &e).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        error!("{} 操作最终失败 (已重试{}次): {}", slot.label, max_retries, e);
                        slot.invalidate(&session).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn backoff(label: &str, attempt: u32, max_retries: u32, base: Duration, e: &SyncError) {
        let delay = backoff_delay(base, attempt);
        warn!(
            "{} 操作失败，{}ms 后重试 ({}/{}): {}",
            label,
            delay.as_millis(),
            attempt + 1,
            max_retries,
            e
        );
        tokio::time::sleep(delay).await;
    }

    /// 首次连接前做可达性探测，连接本身带超时
    async fn open<S, C, CFut>(&self, connect: &C) -> Result<Arc<S>>
    where
        S: ?Sized,
        C: Fn() -> CFut,
        CFut: Future<Output = Result<Arc<S>>>,
    {
        self.ensure_reachable().await?;
        let timeout = self.inner.sync.connect_timeout();
        match tokio::time::timeout(timeout, connect()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::transport(
                TransportErrorKind::Timeout,
                format!("连接 {} 超时 ({:?})", self.inner.settings.address(), timeout),
            )),
        }
    }

    async fn ensure_reachable(&self) -> Result<()> {
        let mut probed = self.inner.probed.lock().await;
        if *probed {
            return Ok(());
        }
        self.probe().await?;
        *probed = true;
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        debug!("探测 {} 可达性", self.inner.settings.address());
        self.inner
            .connector
            .probe(&self.inner.settings, self.inner.sync.probe_timeout())
            .await
    }

    async fn mark_probed(&self) {
        *self.inner.probed.lock().await = true;
    }

    pub async fn is_ssh_connected(&self) -> bool {
        self.inner.ssh.is_connected().await
    }

    pub async fn is_sftp_connected(&self) -> bool {
        self.inner.sftp.is_connected().await
    }

    /// 立即关闭所有会话
    pub async fn shutdown(&self) {
        self.inner.ssh.shutdown().await;
        self.inner.sftp.shutdown().await;
        debug!("已关闭 {} 的所有会话", self.inner.settings.address());
    }
}

/// 进程内唯一的连接管理器持有者。配置变化时先验证新目标再替换
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    sync: SyncSettings,
    current: Mutex<Option<ConnectionManager>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>, sync: SyncSettings) -> Self {
        Self {
            connector,
            sync,
            current: Mutex::new(None),
        }
    }

    /// 配置相同则复用，不同则在新目标可达后替换旧实例
    pub async fn get(&self, settings: &ConnectionSettings) -> Result<ConnectionManager> {
        let mut current = self.current.lock().await;
        if let Some(manager) = current.as_ref() {
            if manager.settings() == settings {
                return Ok(manager.clone());
            }
        }

        let candidate = ConnectionManager::new(settings.clone(), self.sync.clone(), self.connector.clone());
        // 新目标不可达时保留旧实例
        candidate.probe().await?;
        candidate.mark_probed().await;

        if let Some(old) = current.replace(candidate.clone()) {
            info!(
                "连接配置已变化: {} -> {}",
                old.settings().address(),
                settings.address()
            );
            old.shutdown().await;
        }
        Ok(candidate)
    }

    pub async fn current(&self) -> Option<ConnectionManager> {
        self.current.lock().await.clone()
    }

    pub async fn shutdown(&self) {
        if let Some(manager) = self.current.lock().await.take() {
            manager.shutdown().await;
        }
    }
}

/// 重试等待的上限
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// 指数退避：base * 2^attempt，不超过 [`MAX_BACKOFF`]
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempt)).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::{settings, FakeConnector};
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    fn sync_settings() -> SyncSettings {
        SyncSettings::default()
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 0), base);
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(base, 10), MAX_BACKOFF);
        assert_eq!(backoff_delay(base, 40), MAX_BACKOFF);
        assert_eq!(backoff_delay(base, u32::MAX), MAX_BACKOFF);
    }

    fn manager(connector: &Arc<FakeConnector>) -> ConnectionManager {
        ConnectionManager::new(settings("host-a"), sync_settings(), connector.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_connect_and_idle_disconnect() {
        let connector = FakeConnector::new();
        let manager = manager(&connector);
        assert!(!manager.is_ssh_connected().await);

        let out = manager.with_ssh(|_ssh| async move { Ok(42) }).await.unwrap();
        assert_eq!(out, 42);
        assert_eq!(connector.ssh_connects(), 1);
        assert!(manager.is_ssh_connected().await);

        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert!(manager.is_ssh_connected().await);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!manager.is_ssh_connected().await);
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_operation_blocks_idle_disconnect() {
        let connector = FakeConnector::new();
        let manager = manager(&connector);
        let release = Arc::new(Notify::new());

        let long_running = {
            let manager = manager.clone();
            let release = release.clone();
            tokio::spawn(async move {
                manager
                    .with_ssh(|_ssh| {
                        let release = release.clone();
                        async move {
                            release.notified().await;
                            Ok(())
                        }
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager
            .with_ssh(|_ssh| async move { Ok(()) })
            .await
            .unwrap();

        // 第二个操作仍在进行，不能断开
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(manager.is_ssh_connected().await);
        assert_eq!(connector.closes(), 0);

        release.notify_one();
        long_running.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!manager.is_ssh_connected().await);
        assert_eq!(connector.closes(), 1);
        assert_eq!(connector.ssh_connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_operation_cancels_pending_disconnect() {
        let connector = FakeConnector::new();
        let manager = manager(&connector);

        manager.with_ssh(|_ssh| async move { Ok(()) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3000)).await;
        manager.with_ssh(|_ssh| async move { Ok(()) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3000)).await;

        // 距第一次结束已超过 5s，但第二次操作重置了计时
        assert!(manager.is_ssh_connected().await);
        assert_eq!(connector.ssh_connects(), 1);
        assert_eq!(connector.closes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let connector = FakeConnector::new();
        let manager = manager(&connector);
        let calls = Arc::new(AtomicU32::new(0));

        let result = manager
            .with_ssh(|_ssh| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SyncError::transport(TransportErrorKind::ConnectionReset, "reset by peer"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 每次失败后都会丢弃会话并重连
        assert_eq!(connector.ssh_connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_retries() {
        let connector = FakeConnector::new();
        let manager = manager(&connector);
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = manager
            .with_sftp(|_sftp| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::transport(TransportErrorKind::Other, "Instance unusable"))
                }
            })
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_errors_fail_fast() {
        let connector = FakeConnector::new();
        let manager = manager(&connector);
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = manager
            .with_ssh(|_ssh| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::Remote("no such file".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Remote(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host_fails_before_connect() {
        let connector = FakeConnector::new();
        connector.set_unreachable("host-a");
        let manager = manager(&connector);

        let result = manager.with_ssh(|_ssh| async move { Ok(()) }).await;
        assert!(matches!(result, Err(SyncError::Unreachable { .. })));
        assert_eq!(connector.ssh_connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_validates_before_replacing() {
        let connector = FakeConnector::new();
        let registry = ConnectionRegistry::new(connector.clone(), sync_settings());

        let first = registry.get(&settings("host-a")).await.unwrap();
        first.with_ssh(|_ssh| async move { Ok(()) }).await.unwrap();

        // 相同配置复用同一实例
        let same = registry.get(&settings("host-a")).await.unwrap();
        assert!(Arc::ptr_eq(&first.inner, &same.inner));

        // 新目标不可达：保留旧实例和它的会话
        connector.set_unreachable("host-b");
        assert!(registry.get(&settings("host-b")).await.is_err());
        let current = registry.current().await.unwrap();
        assert_eq!(current.settings().hostname, "host-a");
        assert!(first.is_ssh_connected().await);

        // 新目标可达：替换并关闭旧实例
        let replaced = registry.get(&settings("host-c")).await.unwrap();
        assert_eq!(replaced.settings().hostname, "host-c");
        assert!(!first.is_ssh_connected().await);
        assert_eq!(connector.closes(), 1);
    }
}
