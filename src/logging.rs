//! 日志：按大小轮转的文件日志

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

const LOG_FILE: &str = "livesync.log";
const APP_DIR: &str = "livesync";

/// 日志配置，对应 config.json 的 `log` 段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件上限（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// "error" / "warn" / "info" / "debug" / "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    pub fn load(config_dir: &Path) -> Self {
        fs::read_to_string(config_dir.join("config.json"))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("log").cloned())
            .and_then(|log| serde_json::from_value(log).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        let config_file = config_dir.join("config.json");
        let mut config: serde_json::Value = fs::read_to_string(&config_file)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_else(|| serde_json::json!({}));
        config["log"] = serde_json::to_value(self)?;
        fs::write(&config_file, serde_json::to_string_pretty(&config)?)
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

struct LogFile {
    path: PathBuf,
    max_size: u64,
    writer: Option<BufWriter<File>>,
}

impl LogFile {
    fn open(path: &Path) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    /// 超过上限时把当前文件改名为 .old（覆盖旧备份）并重新打开
    fn rotate_if_needed(&mut self) -> io::Result<()> {
        let size = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if size <= self.max_size {
            return Ok(());
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
        let backup = self.path.with_extension("log.old");
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        fs::rename(&self.path, &backup)?;
        self.writer = Some(Self::open(&self.path)?);
        Ok(())
    }
}

/// 带大小限制的日志写入器，克隆共享同一个文件
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file: Arc<Mutex<LogFile>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(LOG_FILE);
        let mut file = LogFile {
            writer: None,
            max_size: u64::from(max_size_mb) * 1024 * 1024,
            path,
        };
        file.rotate_if_needed()?;
        if file.writer.is_none() {
            file.writer = Some(LogFile::open(&file.path)?);
        }
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    #[cfg(test)]
    fn with_limit_bytes(log_dir: &Path, max_size: u64) -> io::Result<Self> {
        let writer = Self::new(log_dir, 0)?;
        lock(&writer.file).max_size = max_size;
        Ok(writer)
    }

    pub fn path(&self) -> PathBuf {
        lock(&self.file).path.clone()
    }
}

fn lock(file: &Mutex<LogFile>) -> MutexGuard<'_, LogFile> {
    file.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct LogWriter {
    file: Arc<Mutex<LogFile>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = lock(&self.file);
        let written = match file.writer.as_mut() {
            Some(writer) => {
                let n = writer.write(buf)?;
                writer.flush()?;
                n
            }
            None => return Err(io::Error::other("日志文件不可用")),
        };
        // 轮转失败不影响本次写入
        let _ = file.rotate_if_needed();
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.file).writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            file: self.file.clone(),
        }
    }
}

/// 应用数据目录，日志与持久化状态都放在这里
pub fn get_app_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_DIR)))
}

/// 初始化全局日志。文件日志不可用时退回控制台
pub fn init_logging(log_dir: &Path) {
    let _ = fs::create_dir_all(log_dir);
    let config = LogConfig::load(log_dir);

    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(config.tracing_level().into());
    // russh 的协议细节日志太多
    for directive in ["russh=warn", "russh_sftp=warn"] {
        if let Ok(d) = directive.parse() {
            env_filter = env_filter.add_directive(d);
        }
    }

    let console_layer = cfg!(debug_assertions).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
    });

    match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false);
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer);
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        Err(e) => {
            eprintln!("无法创建日志文件 {:?}: {}", log_dir, e);
            let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
        }
    }
}
