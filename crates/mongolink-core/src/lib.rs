//! mongolink 核心库
//!
//! - `transport`: 与服务端交互的传输层接口
//! - `cursor`: 查询结果游标
//! - `connection`: 查询与命令接口
//! - `memory`: 进程内传输层

pub mod connection;
pub mod cursor;
pub mod memory;
pub mod transport;

pub use mongolink_bson as bson;
pub use mongolink_common as common;

pub use connection::{index_name, Connection, IndexFlags, UpdateType, WriteConcern};
pub use cursor::{Cursor, CursorState};
pub use memory::MemoryTransport;
pub use transport::{QueryFlags, QueryRequest, StreamHandle, Transport};

pub use bson::{Document, DocumentBuilder, RawDocument, Value};
pub use common::{ClientConfig, LogConfig, MongoError, MongoResult, Namespace, ObjectId};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_PORT: u16 = 27017;

/// 安装全局日志订阅器
///
/// `RUST_LOG` 优先，否则使用配置中的级别。重复安装返回 Config 错误。
pub fn init_logging(config: &LogConfig) -> MongoResult<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| MongoError::Config(format!("Invalid log filter '{}': {}", config.level, e)))?;

    tracing_subscriber::registry()
        .with(config.json.then(|| fmt::layer().json()))
        .with((!config.json).then(|| fmt::layer().with_target(true).with_thread_ids(true)))
        .with(filter)
        .try_init()
        .map_err(|e| MongoError::Config(format!("Failed to install logger: {}", e)))
}
