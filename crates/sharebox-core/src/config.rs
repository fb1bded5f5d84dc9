//! 应用配置和持久化
//!
//! 服务端和客户端的设置存储和读取。配置文件为 TOML，缺失的字段使用默认值。

use log::debug;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认监听端口
pub const DEFAULT_PORT: u16 = 5000;
/// 单个帧的默认最大长度
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
/// 文件流分块的默认大小
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// 服务端设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// 监听地址
    pub bind_address: String,
    /// 监听端口（0 表示随机端口）
    pub port: u16,
    /// 文件存储目录
    pub storage_dir: PathBuf,
    /// 心跳间隔（毫秒）
    pub heartbeat_interval_ms: u64,
    /// 单次读写的超时时间（秒）
    pub io_timeout_secs: u64,
    /// 单个帧的最大长度
    pub max_frame_bytes: usize,
    /// 文件流分块大小
    pub chunk_size: usize,
    /// 日志流队列容量
    pub log_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            storage_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("sharebox")
                .join("storage"),
            heartbeat_interval_ms: 2000,
            io_timeout_secs: 30,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            log_capacity: 256,
        }
    }
}

impl ServerSettings {
    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        load_or_default(&config_path("server.toml"))
    }

    pub fn load_from(path: &Path) -> Self {
        load_or_default(path)
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&config_path("server.toml"))
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        save(self, path)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs.max(1))
    }

    /// 分块大小不能超过帧上限
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, self.max_frame_bytes.max(1))
    }
}

/// 客户端设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// 服务器地址，形如 `host:port`
    pub server: String,
    /// 客户端名称（默认主机名）
    pub client_name: String,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 单次读写的超时时间（秒）
    pub io_timeout_secs: u64,
    /// 超过该时间未收到心跳则认为连接已断开（秒）
    pub liveness_timeout_secs: u64,
    /// 单个帧的最大长度
    pub max_frame_bytes: usize,
    /// 文件流分块大小
    pub chunk_size: usize,
    /// 后台事件队列容量
    pub event_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{DEFAULT_PORT}"),
            client_name: get_default_client_name(),
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            io_timeout_secs: 30,
            liveness_timeout_secs: 10,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            event_capacity: 64,
        }
    }
}

impl ClientSettings {
    pub fn load() -> Self {
        load_or_default(&config_path("client.toml"))
    }

    pub fn load_from(path: &Path) -> Self {
        load_or_default(path)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&config_path("client.toml"))
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        save(self, path)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs.max(1))
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs.max(1))
    }

    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, self.max_frame_bytes.max(1))
    }
}

/// 获取配置文件路径
fn config_path(file_name: &str) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sharebox")
        .join(file_name)
}

fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    if path.exists() {
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => {
                    debug!("Loaded settings from {:?}", path);
                    return settings;
                }
                Err(e) => {
                    log::warn!("Failed to parse settings: {}, using defaults", e);
                }
            },
            Err(e) => {
                log::warn!("Failed to read settings file: {}, using defaults", e);
            }
        }
    }
    T::default()
}

fn save<T: Serialize>(settings: &T, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(settings)?;
    fs::write(path, content)?;
    debug!("Saved settings to {:?}", path);
    Ok(())
}

/// 获取默认客户端名称（主机名）
fn get_default_client_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "sharebox".to_string())
}
