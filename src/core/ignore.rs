//! 忽略规则
//!
//! 本地与远程列举共用同一份规则，保证两侧快照可比较。
//! 远程列举中遇到的拒绝访问路径会在运行时追加进来。

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// 编译后的 glob 规则
#[derive(Debug, Clone)]
struct Pattern {
    regex: Regex,
    /// 不含 '/' 的规则匹配任意一级路径名，否则匹配完整相对路径
    segment_only: bool,
}

/// 忽略规则：glob 列表 + 拒绝访问路径
#[derive(Debug, Clone, Default)]
pub struct IgnorePolicy {
    patterns: Vec<Pattern>,
    denied: Arc<RwLock<BTreeSet<String>>>,
}

/// glob 转正则：`**` 跨目录，`*` / `?` 不跨目录
fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // "**/" 也匹配零级目录
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        regex.push_str("(?:.*/)?");
                    } else {
                        regex.push_str(".*");
                    }
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    regex
}

impl IgnorePolicy {
    pub fn new<S: AsRef<str>>(globs: &[S]) -> Self {
        let mut patterns = Vec::new();
        for glob in globs {
            let glob = glob.as_ref().trim().trim_start_matches("./").trim_matches('/');
            if glob.is_empty() {
                continue;
            }
            match Regex::new(&glob_to_regex(glob)) {
                Ok(regex) => patterns.push(Pattern {
                    regex,
                    segment_only: !glob.contains('/'),
                }),
                Err(e) => warn!("忽略规则无效 '{}': {}", glob, e),
            }
        }
        Self {
            patterns,
            denied: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    /// 路径本身或任一上级目录命中规则即忽略。根目录永不忽略
    pub fn is_ignored(&self, relative_path: &str) -> bool {
        if relative_path.is_empty() {
            return false;
        }
        let denied = self.denied.read().unwrap_or_else(|e| e.into_inner());

        let mut prefix = String::new();
        for segment in relative_path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);

            if denied.contains(&prefix) {
                return true;
            }
            for pattern in &self.patterns {
                let candidate = if pattern.segment_only { segment } else { prefix.as_str() };
                if pattern.regex.is_match(candidate) {
                    return true;
                }
            }
        }
        false
    }

    /// 记录拒绝访问的路径，之后的列举都会跳过
    pub fn add_denied(&self, relative_path: &str) {
        if relative_path.is_empty() {
            return;
        }
        let mut denied = self.denied.write().unwrap_or_else(|e| e.into_inner());
        if denied.insert(relative_path.to_string()) {
            debug!("加入忽略列表（拒绝访问）: {}", relative_path);
        }
    }

    pub fn denied_paths(&self) -> Vec<String> {
        let denied = self.denied.read().unwrap_or_else(|e| e.into_inner());
        denied.iter().cloned().collect()
    }
}
