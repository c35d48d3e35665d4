//! 文件检查点存储
//!
//! 目录布局：<root>/<编码后的 thread_id>/<seq 补零 20 位>.json。
//! 先写临时文件并 fsync，再 rename 并 fsync 目录，同一文件系统上是原子且掉电后仍在的；
//! 读取时忽略残留的临时文件。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{validate, Checkpoint, CheckpointStore, StoreError};
use crate::core::SessionState;

pub struct FileCheckpointStore {
    root: PathBuf,
    /// 串行化 seq 分配与写入
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// 打开（必要时创建）根目录
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.root.join(encode_thread_id(thread_id))
    }

    /// 线程目录下的版本号（升序）
    async fn versions(&self, dir: &Path) -> Result<Vec<u64>, StoreError> {
        let mut seqs = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(seqs),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(seq) = name.strip_suffix(".json").and_then(|s| s.parse::<u64>().ok()) {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    async fn read_version(&self, dir: &Path, seq: u64) -> Result<Checkpoint, StoreError> {
        let data = tokio::fs::read(dir.join(version_file(seq))).await?;
        let checkpoint: Checkpoint = serde_json::from_slice(&data)?;
        checkpoint.check_version()
    }
}

fn version_file(seq: u64) -> String {
    format!("{:020}.json", seq)
}

/// 文件名安全编码：[A-Za-z0-9_-] 原样保留，其余字节写成 %XX
fn encode_thread_id(thread_id: &str) -> String {
    let mut out = String::with_capacity(thread_id.len());
    for b in thread_id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode_thread_id(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// 写入 <dir>/<name>：临时文件落盘后才 rename，返回前目录项也已落盘
async fn write_durable(dir: &Path, name: &str, data: &[u8]) -> std::io::Result<()> {
    let tmp = dir.join(format!(".{}.tmp", name));
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, dir.join(name)).await?;
    sync_dir(dir).await
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

// 非 unix 平台不能以文件方式打开目录
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, thread_id: &str, state: &SessionState) -> Result<Checkpoint, StoreError> {
        validate(thread_id, state)?;
        let _guard = self.write_lock.lock().await;

        let dir = self.thread_dir(thread_id);
        tokio::fs::create_dir_all(&dir).await?;
        let seq = self.versions(&dir).await?.last().map(|s| s + 1).unwrap_or(1);
        let checkpoint = Checkpoint::new(thread_id, seq, state.clone());

        let data = serde_json::to_vec_pretty(&checkpoint)?;
        write_durable(&dir, &version_file(seq), &data).await?;

        tracing::debug!(thread_id, seq, "checkpoint written");
        Ok(checkpoint)
    }

    async fn latest(&self, thread_id: &str) -> Result<Checkpoint, StoreError> {
        let dir = self.thread_dir(thread_id);
        match self.versions(&dir).await?.last() {
            Some(&seq) => self.read_version(&dir, seq).await,
            None => Err(StoreError::NotFound(thread_id.to_string())),
        }
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let dir = self.thread_dir(thread_id);
        let mut out = Vec::new();
        for seq in self.versions(&dir).await? {
            out.push(self.read_version(&dir, seq).await?);
        }
        Ok(out)
    }

    async fn list_threads(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = decode_thread_id(&name.to_string_lossy()) else {
                tracing::warn!("Skipping unrecognised checkpoint directory {:?}", name);
                continue;
            };
            if !self.versions(&entry.path()).await?.is_empty() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
