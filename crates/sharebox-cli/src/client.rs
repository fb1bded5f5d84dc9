//! 连接与交互选择

use anyhow::{Result, bail};
use serde::Serialize;
use sharebox_core::{ClientError, ClientSession, ClientSettings, RemoteFile};
use std::ffi::OsStr;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

/// `list --json` 的输出记录
#[derive(Serialize, Debug)]
pub struct FileRecord<'a> {
    pub key: &'a str,
    pub owner: &'a str,
}

impl<'a> From<&'a RemoteFile> for FileRecord<'a> {
    fn from(file: &'a RemoteFile) -> Self {
        Self {
            key: &file.file_key,
            owner: &file.owner,
        }
    }
}

pub async fn connect(settings: &ClientSettings) -> Result<ClientSession> {
    match ClientSession::connect(settings).await {
        Ok(session) => Ok(session),
        Err(ClientError::Rejected(response)) => {
            eprintln!("❌ {}", response);
            eprintln!("   换一个名称再试: sharebox --name <NAME> ...");
            bail!("registration refused by {}", settings.server);
        }
        Err(e) => {
            eprintln!("❌ 无法连接到服务器 {}: {}", settings.server, e);
            eprintln!("   请确保 sharebox-server 正在运行");
            Err(e.into())
        }
    }
}

/// 打印编号列表并从标准输入读取选择，空行或无效输入表示放弃
pub fn prompt_choice(files: &[RemoteFile], action: &str) -> Option<RemoteFile> {
    for (i, file) in files.iter().enumerate() {
        println!("   [{}] {}", i + 1, file);
    }
    print!("选择要{}的文件编号 (回车取消): ", action);
    let _ = io::stdout().flush();

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok()?;
    let index: usize = line.trim().parse().ok()?;
    files.get(index.checked_sub(1)?).cloned()
}

/// 按文件键查找，没有给出键时交互选择
pub fn pick(files: &[RemoteFile], key: Option<&str>, action: &str) -> Option<RemoteFile> {
    match key {
        Some(key) => {
            let found = files.iter().find(|f| f.file_key == key).cloned();
            if found.is_none() {
                eprintln!("❌ 服务器上没有文件 {}", key);
            }
            found
        }
        None => prompt_choice(files, action),
    }
}

/// 下载保存位置：显式给出的路径，或下载目录下以文件键命名
pub fn destination(output: Option<&Path>, download_dir: &Path, file: &RemoteFile) -> PathBuf {
    match output {
        Some(path) if path.is_dir() => path.join(local_name(&file.file_key)),
        Some(path) => path.to_path_buf(),
        None => download_dir.join(local_name(&file.file_key)),
    }
}

/// 文件键来自服务器，只取最后一段作为本地文件名
fn local_name(file_key: &str) -> &OsStr {
    Path::new(file_key)
        .file_name()
        .unwrap_or_else(|| OsStr::new("download"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(key: &str, owner: &str) -> RemoteFile {
        RemoteFile {
            file_key: key.to_string(),
            owner: owner.to_string(),
        }
    }

    #[test]
    fn test_pick_by_key() {
        let files = vec![remote("alice_a.txt", "alice"), remote("bob_b.txt", "bob")];
        assert_eq!(
            pick(&files, Some("bob_b.txt"), "下载"),
            Some(remote("bob_b.txt", "bob"))
        );
        assert_eq!(pick(&files, Some("carol_c.txt"), "下载"), None);
    }

    #[test]
    fn test_destination() {
        let dir = tempfile::tempdir().unwrap();
        let file = remote("alice_a.txt", "alice");

        assert_eq!(
            destination(None, dir.path(), &file),
            dir.path().join("alice_a.txt")
        );
        assert_eq!(
            destination(Some(dir.path()), Path::new("/unused"), &file),
            dir.path().join("alice_a.txt")
        );
        let explicit = dir.path().join("renamed.txt");
        assert_eq!(
            destination(Some(&explicit), Path::new("/unused"), &file),
            explicit
        );
    }

    #[test]
    fn test_destination_stays_in_download_dir() {
        let dir = tempfile::tempdir().unwrap();

        for key in ["../evil", "/etc/passwd", "nested/dir/evil"] {
            let dest = destination(None, dir.path(), &remote(key, "mallory"));
            assert_eq!(dest.parent(), Some(dir.path()), "{key}");
        }
        for key in ["..", "/"] {
            assert_eq!(
                destination(None, dir.path(), &remote(key, "mallory")),
                dir.path().join("download")
            );
        }
    }

    #[test]
    fn test_json_record() {
        let file = remote("alice_a.txt", "alice");
        let json = serde_json::to_string(&FileRecord::from(&file)).unwrap();
        assert_eq!(json, r#"{"key":"alice_a.txt","owner":"alice"}"#);
    }
}
