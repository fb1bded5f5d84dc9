//! 存储索引
//!
//! 文件键 → 所有者的进程级映射。启动时扫描存储目录重建，此后只在上传和删除时修改。
//! 锁只在读写映射本身时持有，任何文件 I/O 都在锁外完成。

use log::{debug, warn};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::sync::Mutex;

use crate::transfer::protocol::{file_key, is_valid_client_name};

const PART_SUFFIX: &str = ".part";

/// 存储错误
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// 已打开、等待发送的文件
#[derive(Debug)]
pub struct StoredFile {
    pub file: File,
    pub size: u64,
    pub owner: String,
}

/// 正在写入的上传临时文件
///
/// 完成后通过 [`StorageIndex::commit_upload`] 改名到文件键下；
/// 失败时调用 [`PendingUpload::discard`]。未提交就被丢弃（例如会话被取消）时，
/// 临时文件在后台删除。
#[derive(Debug)]
pub struct PendingUpload {
    path: PathBuf,
    file: File,
    settled: bool,
}

impl PendingUpload {
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub async fn discard(mut self) {
        self.settled = true;
        if let Err(e) = fs::remove_file(&self.path).await {
            debug!("Failed to remove temporary upload {:?}: {}", self.path, e);
        }
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let path = std::mem::take(&mut self.path);
        debug!("Removing abandoned upload {:?}", path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = fs::remove_file(&path).await;
                });
            }
            Err(_) => {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

/// 存储索引
#[derive(Debug)]
pub struct StorageIndex {
    root: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl StorageIndex {
    /// 打开存储目录并扫描已有文件
    ///
    /// 文件名中第一个 `_` 之前的部分视为所有者；没有 `_` 的文件以整个文件名为所有者。
    /// 隐藏文件被跳过，上次中断留下的 `.part` 临时文件会被清理。
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut entries = BTreeMap::new();
        let mut dir = fs::read_dir(&root).await?;

        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }

            let Ok(name) = entry.file_name().into_string() else {
                warn!("Skipping non UTF-8 file name in {:?}", root);
                continue;
            };

            if name.starts_with('.') {
                if name.ends_with(PART_SUFFIX) {
                    debug!("Removing stale upload {}", name);
                    let _ = fs::remove_file(entry.path()).await;
                }
                continue;
            }

            let owner = name.split('_').next().unwrap_or(&name).to_string();
            entries.insert(name, owner);
        }

        debug!("Indexed {} files in {:?}", entries.len(), root);

        Ok(Self {
            root,
            entries: Mutex::new(entries),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 所有 `(文件键, 所有者)`，按文件键排序
    pub async fn list(&self) -> Vec<(String, String)> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(|(key, owner)| (key.clone(), owner.clone()))
            .collect()
    }

    pub async fn owner_of(&self, key: &str) -> Option<String> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// 创建上传临时文件
    pub async fn begin_upload(&self) -> Result<PendingUpload, StorageError> {
        let path = self
            .root
            .join(format!(".{}{}", uuid::Uuid::new_v4(), PART_SUFFIX));
        let file = File::create(&path).await?;
        Ok(PendingUpload {
            path,
            file,
            settled: false,
        })
    }

    /// 把临时文件改名到 `<owner>_<filename>` 下并登记所有者
    ///
    /// 返回该文件键之前是否已存在（覆盖上传）。
    pub async fn commit_upload(
        &self,
        mut pending: PendingUpload,
        owner: &str,
        filename: &str,
    ) -> Result<(String, bool), StorageError> {
        if let Err(e) = validate_file_name(filename) {
            pending.discard().await;
            return Err(e);
        }
        let key = file_key(owner, filename);
        let target = self.root.join(&key);
        if !is_valid_client_name(owner) || target.parent() != Some(self.root.as_path()) {
            pending.discard().await;
            return Err(StorageError::InvalidFileName(key));
        }

        let finished = async {
            use tokio::io::AsyncWriteExt;
            pending.file.flush().await?;
            pending.file.sync_all().await?;
            let existed = fs::try_exists(&target).await.unwrap_or(false);
            fs::rename(&pending.path, &target).await?;
            Ok::<bool, io::Error>(existed)
        }
        .await;

        let existed_on_disk = match finished {
            Ok(existed) => {
                pending.settled = true;
                existed
            }
            Err(e) => {
                pending.discard().await;
                return Err(e.into());
            }
        };

        let was_indexed = self
            .entries
            .lock()
            .await
            .insert(key.clone(), owner.to_string())
            .is_some();

        Ok((key, existed_on_disk || was_indexed))
    }

    /// 打开一个已索引的文件
    pub async fn open_file(&self, key: &str) -> Result<StoredFile, StorageError> {
        let owner = self
            .owner_of(key)
            .await
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        let file = File::open(self.root.join(key)).await?;
        let size = file.metadata().await?.len();
        Ok(StoredFile { file, size, owner })
    }

    /// 删除文件及其索引项
    ///
    /// 磁盘上已不存在的文件仍会从索引中移除，但调用方会收到 `NotFound`。
    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        if self.owner_of(key).await.is_none() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        match fs::remove_file(self.root.join(key)).await {
            Ok(()) => {
                self.entries.lock().await.remove(key);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("{} was indexed but missing on disk", key);
                self.entries.lock().await.remove(key);
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// 上传的文件名必须是单个路径分量
pub fn validate_file_name(filename: &str) -> Result<(), StorageError> {
    let invalid = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\', '\0'])
        || filename.chars().any(char::is_whitespace);

    if invalid {
        Err(StorageError::InvalidFileName(filename.to_string()))
    } else {
        Ok(())
    }
}
