//! 哈希计算
//!
//! 节点 hash = SHA256(relativePath || kind || 内容指纹)。
//! 文件的内容指纹是文件内容的 SHA-256；目录的内容指纹由子节点 hash
//! 按名称顺序组合而成，因此任何后代变化都会改变所有祖先的 hash。

use super::node::{NodeKind, TreeNode};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 流式计算本地文件内容的 SHA-256
pub async fn file_content_hash(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

/// 内存数据的 SHA-256（十六进制）
pub fn content_hash(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

/// 组合路径、类型和内容指纹得到节点 hash
pub fn node_hash(relative_path: &str, kind: NodeKind, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(relative_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.as_bytes());
    to_hex(&hasher.finalize())
}

/// 目录内容指纹：按名称顺序组合子节点 hash；任一子节点缺少 hash 时返回 None
pub fn directory_fingerprint<M>(children: &BTreeMap<String, TreeNode<M>>) -> Option<String> {
    let mut hasher = Sha256::new();
    for (name, child) in children {
        let hash = child.hash.as_deref()?;
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash.as_bytes());
        hasher.update([b'\n']);
    }
    Some(to_hex(&hasher.finalize()))
}

/// 自底向上计算目录 hash，文件 hash 须已就绪
pub fn finalize_directory_hashes<M>(node: &mut TreeNode<M>) {
    let fingerprint = match node.children_mut() {
        Some(children) => {
            for child in children.values_mut() {
                finalize_directory_hashes(child);
            }
            directory_fingerprint(children)
        }
        None => return,
    };
    node.hash = fingerprint.map(|fp| node_hash(&node.relative_path, NodeKind::Directory, &fp));
}
