//! 客户端配置模块
//!
//! 定义 mongolink 客户端的配置选项:
//! - 操作超时与批量大小
//! - 编解码限制(文档体积、嵌套深度)
//! - 日志配置
//!
//! 支持从 TOML 文件加载配置。

use crate::error::{MongoError, MongoResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// BSON 文档的最大体积 (16 MiB)
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;
/// 默认最大嵌套深度
pub const MAX_NESTING_DEPTH: usize = 100;

/// 客户端主配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 单次操作超时(毫秒)，None 表示由传输层决定
    #[serde(default)]
    pub op_timeout_ms: Option<u64>,

    /// 游标每批请求的文档数 (默认: 101, 0 表示由服务端决定)
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// 编解码限制
    #[serde(default)]
    pub codec: CodecLimits,

    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

fn default_batch_size() -> u32 { 101 }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            op_timeout_ms: None,
            batch_size: default_batch_size(),
            codec: CodecLimits::default(),
            log: LogConfig::default(),
        }
    }
}

/// 编解码限制
///
/// 解码畸形输入时用来限制递归深度和缓冲区大小。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecLimits {
    #[serde(default = "default_max_document_size")]
    pub max_document_size: usize,

    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,
}

fn default_max_document_size() -> usize { MAX_DOCUMENT_SIZE }
fn default_max_nesting_depth() -> usize { MAX_NESTING_DEPTH }

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_document_size: MAX_DOCUMENT_SIZE,
            max_nesting_depth: MAX_NESTING_DEPTH,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别过滤表达式 (默认: info)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl ClientConfig {
    /// 从 TOML 文件加载配置
    pub fn from_file(path: &Path) -> MongoResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            MongoError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> MongoResult<Self> {
        let config: ClientConfig = toml::from_str(content)
            .map_err(|e| MongoError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> MongoResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| MongoError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// 校验配置的取值范围
    pub fn validate(&self) -> MongoResult<()> {
        if self.codec.max_document_size < 5 {
            return Err(MongoError::Config(
                "codec.max_document_size must be at least 5 bytes".to_string(),
            ));
        }
        if self.codec.max_document_size > i32::MAX as usize {
            return Err(MongoError::Config(
                "codec.max_document_size exceeds the BSON length prefix range".to_string(),
            ));
        }
        if self.codec.max_nesting_depth == 0 {
            return Err(MongoError::Config(
                "codec.max_nesting_depth must be positive".to_string(),
            ));
        }
        if self.batch_size > i32::MAX as u32 {
            return Err(MongoError::Config("batch_size is too large".to_string()));
        }
        if self.op_timeout_ms == Some(0) {
            return Err(MongoError::Config(
                "op_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}
