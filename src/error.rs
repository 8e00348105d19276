//! 错误类型

use thiserror::Error;

/// 传输层错误的细分类型，用于判断是否可以重试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// 连接被重置
    ConnectionReset,
    /// 连接或握手超时
    Timeout,
    /// SSH/SFTP 客户端的一般性故障
    GenericClient,
    /// 其他传输错误（不重试）
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::ConnectionReset => write!(f, "ECONNRESET"),
            TransportErrorKind::Timeout => write!(f, "ETIMEDOUT"),
            TransportErrorKind::GenericClient => write!(f, "ERR_GENERIC_CLIENT"),
            TransportErrorKind::Other => write!(f, "EOTHER"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("服务器 {host}:{port} 不可达")]
    Unreachable { host: String, port: u16 },

    #[error("认证失败: {0}")]
    Auth(String),

    #[error("传输错误 [{kind}]: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("远程命令失败 (exit {code}): {stderr}")]
    Command { code: u32, stderr: String },

    #[error("远程操作失败: {0}")]
    Remote(String),

    #[error("根节点不存在: {0}")]
    RootNotFound(String),

    #[error("父节点不存在: {0}")]
    ParentNotFound(String),

    #[error("节点不存在: {0}")]
    NodeNotFound(String),

    #[error("不是目录: {0}")]
    NotADirectory(String),

    #[error("无法移动 '{from}' 到 '{to}'")]
    InvalidMove { from: String, to: String },

    #[error("节点数据无效: {0}")]
    InvalidNode(String),

    #[error("远程文件自上次列举后已被修改: {0}")]
    RemoteChanged(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        SyncError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// 是否属于可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transport { kind, message } => {
                matches!(
                    kind,
                    TransportErrorKind::ConnectionReset
                        | TransportErrorKind::Timeout
                        | TransportErrorKind::GenericClient
                ) || message.contains("Instance unusable")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
