//! 尾沿去抖写入
//!
//! 窗口内的多次写入合并为一次，只写最后一个值；每次调度都会重置计时。
//! `flush` 立即写出待写的值，`shutdown` 写出后停止后台任务。

use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

enum Message<T> {
    Schedule(T),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<Message<T>>,
}

impl<T: Send + 'static> Debouncer<T> {
    /// 启动后台任务，需要在 tokio 运行时内调用
    pub fn new<F, Fut>(window: Duration, write: F) -> Self
    where
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message<T>>();

        tokio::spawn(async move {
            let mut pending: Option<T> = None;
            let mut deadline: Option<Instant> = None;

            loop {
                let message = match deadline {
                    Some(at) => tokio::select! {
                        message = rx.recv() => message,
                        _ = tokio::time::sleep_until(at) => {
                            deadline = None;
                            if let Some(value) = pending.take() {
                                write(value).await;
                            }
                            continue;
                        }
                    },
                    None => rx.recv().await,
                };

                match message {
                    Some(Message::Schedule(value)) => {
                        pending = Some(value);
                        deadline = Some(Instant::now() + window);
                    }
                    Some(Message::Flush(ack)) => {
                        deadline = None;
                        if let Some(value) = pending.take() {
                            write(value).await;
                        }
                        let _ = ack.send(());
                    }
                    Some(Message::Shutdown(ack)) => {
                        if let Some(value) = pending.take() {
                            write(value).await;
                        }
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        if let Some(value) = pending.take() {
                            write(value).await;
                        }
                        break;
                    }
                }
            }
            debug!("去抖写入任务已退出");
        });

        Self { tx }
    }

    /// 调度一次写入，覆盖之前尚未写出的值
    pub fn schedule(&self, value: T) {
        if self.tx.send(Message::Schedule(value)).is_err() {
            debug!("去抖写入任务已停止，忽略本次写入");
        }
    }

    /// 立即写出待写的值并等待完成
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Message::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Message::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }
}
