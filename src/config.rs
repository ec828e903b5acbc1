// rust_connection_transport/src/config.rs

//! 连接处理器的配置。
//!
//! 配置以 JSON 文件保存，缺失的字段取默认值。

use crate::error::WsError;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 入站消息的默认最大大小 (字节)。
pub const DEFAULT_MAX_INCOMING_MESSAGE_SIZE: usize = 64 * 1024;
/// 关闭握手的默认超时 (毫秒)。
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 250;
/// 发送停滞检查的默认周期 (毫秒)。
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 5_000;

/// 单个连接处理器的配置。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct HandlerConfig {
    /// 一条入站消息允许的最大总字节数，`None` 表示不限制。
    pub max_incoming_message_size: Option<usize>,
    /// 单次分片读取使用的缓冲区大小 (字节)。
    pub receive_buffer_size: usize,
    /// 收到对端关闭帧后，等待本端关闭帧发出的最长时间 (毫秒)。
    pub close_timeout_ms: u64,
    /// 停滞监视器的心跳周期 (毫秒)；为 0 时不启动监视器定时器。
    pub stall_timeout_ms: u64,
    /// 发送队列中同时排队的最大单元数，`None` 表示不限制。
    pub max_send_queue_size: Option<usize>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_incoming_message_size: Some(DEFAULT_MAX_INCOMING_MESSAGE_SIZE),
            receive_buffer_size: crate::reader::DEFAULT_RECEIVE_BUFFER_SIZE,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT_MS,
            max_send_queue_size: None,
        }
    }
}

impl HandlerConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        (self.stall_timeout_ms > 0).then(|| Duration::from_millis(self.stall_timeout_ms))
    }

    /// 从 JSON 字符串解析配置。
    pub fn from_json_str(content: &str) -> Result<Self, WsError> {
        serde_json::from_str(content)
            .map_err(|e| WsError::ConfigError(format!("解析处理器配置失败: {}", e)))
    }

    /// 从 JSON 文件加载配置；文件不存在或内容损坏时返回错误。
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, WsError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| WsError::ConfigError(format!("读取配置文件 {:?} 失败: {}", path, e)))?;
        let config = Self::from_json_str(&content)?;
        info!("[配置模块] 已成功从配置文件 {:?} 加载处理器配置。", path);
        Ok(config)
    }

    /// 从 JSON 文件加载配置，失败时记录警告并使用默认配置。
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "[配置模块] 无法从 {:?} 加载处理器配置 ({}). 将使用默认配置。",
                    path, e
                );
                Self::default()
            }
        }
    }

    /// 把配置美化序列化后写入文件，必要时创建父目录。
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), WsError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| WsError::ConfigError(format!("序列化处理器配置失败: {}", e)))?;
        fs::write(path, content)?;
        info!("[配置模块] 已将处理器配置保存到 {:?}.", path);
        Ok(())
    }
}
