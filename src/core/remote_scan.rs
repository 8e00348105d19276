//! 远程列举
//!
//! 整个远程树只用三条批量命令：列出目录、列出文件、计算文件校验和。
//! 往返次数与树的大小无关，代价是需要解析命令的文本输出。

use super::ignore::IgnorePolicy;
use super::node::{normalize_relative, NodeKind, Origin, RawNode};
use super::scanner::{assemble, ListingEntry};
use crate::error::{Result, SyncError};
use crate::remote::{posix_join, shell_quote, CommandOutput, ConnectionManager};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// 起点不存在时命令返回的退出码
const ABSENT_EXIT: u32 = 44;

/// 三条批量命令
#[derive(Debug, Clone, PartialEq)]
pub struct ListingCommands {
    pub directories: String,
    pub files: String,
    pub checksums: String,
}

impl ListingCommands {
    pub fn new(remote_root: &str, relative: &str) -> Self {
        let start = if relative.is_empty() {
            ".".to_string()
        } else {
            format!("./{}", relative)
        };
        let prelude = format!(
            "cd {} 2>/dev/null || exit {}; test -e {} || exit {};",
            shell_quote(remote_root),
            ABSENT_EXIT,
            shell_quote(&start),
            ABSENT_EXIT
        );
        let start = shell_quote(&start);
        Self {
            directories: format!(r"{} find {} -type d -printf '%p\t%s\t%T@\n'", prelude, start),
            files: format!(r"{} find {} -type f -printf '%p\t%s\t%T@\n'", prelude, start),
            checksums: format!("{} find {} -type f -exec sha256sum {{}} +", prelude, start),
        }
    }

    fn all(&self) -> [&str; 3] {
        [&self.directories, &self.files, &self.checksums]
    }
}

/// 一行 stat 输出
#[derive(Debug, Clone, PartialEq)]
pub struct StatLine {
    pub relative_path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// 解析 `find -printf '%p\t%s\t%T@\n'` 的输出
pub fn parse_stat_output(stdout: &str) -> Vec<StatLine> {
    stdout
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            // 路径里可能有制表符，从右侧拆分
            let mut parts = line.rsplitn(3, '\t');
            let modified = parse_timestamp(parts.next()?)?;
            let size = parts.next()?.parse().ok()?;
            let path = parts.next()?;
            Some(StatLine {
                relative_path: normalize_relative(path),
                size,
                modified,
            })
        })
        .collect()
}

/// 解析 `%T@` 形式的时间戳（秒.小数）
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = match value.split_once('.') {
        Some((s, f)) => (s, f),
        None => (value, ""),
    };
    let secs: i64 = secs.parse().ok()?;
    let mut digits: String = frac.chars().take(9).collect();
    while digits.len() < 9 {
        digits.push('0');
    }
    let nanos: u32 = digits.parse().ok()?;
    Utc.timestamp_opt(secs, nanos).single()
}

/// 解析 `sha256sum` 的输出：路径 -> 内容哈希
pub fn parse_checksum_output(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| {
            // 文件名含反斜杠或换行时 sha256sum 在行首加反斜杠，并转义文件名
            let (escaped, line) = match line.strip_prefix('\\') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            let (hash, rest) = line.split_once(' ')?;
            let path = rest.strip_prefix(' ').or_else(|| rest.strip_prefix('*'))?;
            if hash.len() != 64 {
                return None;
            }
            let path = if escaped { unescape_checksum_name(path) } else { path.to_string() };
            Some((normalize_relative(&path), hash.to_lowercase()))
        })
        .collect()
}

/// 还原 sha256sum 转义过的文件名（`\\`、`\n`、`\r`）
fn unescape_checksum_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some(other) => result.push(other),
            None => result.push('\\'),
        }
    }
    result
}

/// 从 stderr 中提取拒绝访问的路径
pub fn parse_denied(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_suffix(": Permission denied")?;
            let path = rest
                .strip_prefix("find: ")
                .or_else(|| rest.strip_prefix("sha256sum: "))?;
            let path = path.trim_matches(|c| matches!(c, '\'' | '"' | '‘' | '’'));
            Some(normalize_relative(path))
        })
        .collect()
}

/// 0：成功；1：部分路径出错（如拒绝访问）；44：起点不存在
fn check_exit(output: &CommandOutput) -> Result<bool> {
    match output.exit_code {
        0 | 1 => Ok(true),
        ABSENT_EXIT => Ok(false),
        code => Err(SyncError::Command {
            code,
            stderr: output.stderr.trim().to_string(),
        }),
    }
}

/// 远程扫描器
#[derive(Clone)]
pub struct RemoteScanner {
    ignore: IgnorePolicy,
}

impl RemoteScanner {
    pub fn new(ignore: IgnorePolicy) -> Self {
        Self { ignore }
    }

    /// 列举远程 `remote_root` 下的 `relative` 路径。路径不存在或被忽略时返回 None
    pub async fn list(
        &self,
        connections: &ConnectionManager,
        remote_root: &str,
        root_name: &str,
        relative: &str,
    ) -> Result<Option<RawNode>> {
        let relative = normalize_relative(relative);
        if self.ignore.is_ignored(&relative) {
            return Ok(None);
        }

        let commands = ListingCommands::new(remote_root, &relative);
        let outputs = connections
            .with_ssh(|ssh| {
                let commands = commands.clone();
                async move {
                    let mut outputs = Vec::with_capacity(3);
                    for command in commands.all() {
                        let output = ssh.exec(command).await?;
                        let present = check_exit(&output)?;
                        outputs.push(output);
                        if !present {
                            break;
                        }
                    }
                    Ok(outputs)
                }
            })
            .await?;

        if outputs.len() < 3 {
            debug!("远程路径不存在: {}", posix_join(remote_root, &relative));
            return Ok(None);
        }

        for output in &outputs {
            for denied in parse_denied(&output.stderr) {
                warn!("远程路径拒绝访问，加入忽略列表: {}", denied);
                self.ignore.add_denied(&denied);
            }
        }

        let checksums = parse_checksum_output(&outputs[2].stdout);
        let mut entries = Vec::new();
        for (kind, output) in [(NodeKind::Directory, &outputs[0]), (NodeKind::File, &outputs[1])] {
            for line in parse_stat_output(&output.stdout) {
                if self.ignore.is_ignored(&line.relative_path) {
                    continue;
                }
                let content_hash = match kind {
                    NodeKind::File => {
                        let hash = checksums.get(&line.relative_path).cloned();
                        if hash.is_none() {
                            warn!("远程文件缺少校验和: {}", line.relative_path);
                        }
                        hash
                    }
                    NodeKind::Directory => None,
                };
                entries.push(ListingEntry {
                    full_path: posix_join(remote_root, &line.relative_path),
                    relative_path: line.relative_path,
                    kind,
                    size: if kind == NodeKind::Directory { 0 } else { line.size },
                    modified: line.modified,
                    content_hash,
                });
            }
        }

        info!(
            "远程扫描完成: {}, {} 个条目",
            posix_join(remote_root, &relative),
            entries.len()
        );
        Ok(assemble(root_name, &relative, Origin::Remote, entries))
    }
}
