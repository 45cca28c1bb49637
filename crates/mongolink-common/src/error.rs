//! 错误类型定义模块
//!
//! 定义 mongolink 的统一错误类型 MongoError 和 Result 别名。
//! 编解码器、构建器、游标和传输层的故障最终都映射为同一个结构化错误:
//! 错误种类 + 可读消息 + 可选的出错字段名。

use bitflags::bitflags;
use std::fmt;
use thiserror::Error;

/// 错误种类
///
/// 供调用方按原因分支处理，不依赖消息文本。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Decode,
    InvalidState,
    AlreadyFinished,
    NotUtf8,
    InvalidFieldName,
    Cursor,
    Transport,
    Config,
    Validation,
}

/// 字段名校验失败的具体原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldNameFault {
    /// 字段名为空
    Empty,
    /// 字段名包含 '.'
    HasDot,
    /// 字段名以 '$' 开头
    InitDollar,
    /// 字段名包含 NUL 字节
    ContainsNul,
}

impl FieldNameFault {
    pub fn code(&self) -> &'static str {
        match self {
            FieldNameFault::Empty => "EMPTY_FIELD",
            FieldNameFault::HasDot => "HAS_DOT",
            FieldNameFault::InitDollar => "INIT_DOLLAR",
            FieldNameFault::ContainsNul => "HAS_NUL",
        }
    }
}

impl fmt::Display for FieldNameFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FieldNameFault::Empty => "field name is empty",
            FieldNameFault::HasDot => "field has dot",
            FieldNameFault::InitDollar => "field has initial dollar sign",
            FieldNameFault::ContainsNul => "field contains NUL byte",
        };
        f.write_str(msg)
    }
}

/// 游标故障
///
/// `Exhausted` 是正常的结果结束条件，其余均对该游标致命。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorFault {
    Exhausted,
    Invalid,
    Pending,
    QueryFail,
    BsonError,
}

impl CursorFault {
    pub fn code(&self) -> &'static str {
        match self {
            CursorFault::Exhausted => "CURSOR_EXHAUSTED",
            CursorFault::Invalid => "CURSOR_INVALID",
            CursorFault::Pending => "CURSOR_PENDING",
            CursorFault::QueryFail => "CURSOR_QUERY_FAIL",
            CursorFault::BsonError => "CURSOR_BSON_ERROR",
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, CursorFault::Exhausted)
    }
}

impl fmt::Display for CursorFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 连接/传输层故障
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFault {
    NoSocket,
    ConnFail,
    AddrFail,
    NotMaster,
    BadSetName,
    NoPrimary,
    IoError,
    SocketError,
    ReadSizeError,
    CommandFailed,
    WriteError,
    NsInvalid,
    BsonInvalid,
    BsonNotFinished,
    BsonTooLarge,
    WriteConcernInvalid,
}

impl ConnectionFault {
    pub fn code(&self) -> &'static str {
        match self {
            ConnectionFault::NoSocket => "CONN_NO_SOCKET",
            ConnectionFault::ConnFail => "CONN_FAIL",
            ConnectionFault::AddrFail => "CONN_ADDR_FAIL",
            ConnectionFault::NotMaster => "CONN_NOT_MASTER",
            ConnectionFault::BadSetName => "CONN_BAD_SET_NAME",
            ConnectionFault::NoPrimary => "CONN_NO_PRIMARY",
            ConnectionFault::IoError => "CONN_IO_ERROR",
            ConnectionFault::SocketError => "CONN_SOCKET_ERROR",
            ConnectionFault::ReadSizeError => "CONN_READ_SIZE_ERROR",
            ConnectionFault::CommandFailed => "COMMAND_FAILED",
            ConnectionFault::WriteError => "WRITE_ERROR",
            ConnectionFault::NsInvalid => "NS_INVALID",
            ConnectionFault::BsonInvalid => "BSON_INVALID",
            ConnectionFault::BsonNotFinished => "BSON_NOT_FINISHED",
            ConnectionFault::BsonTooLarge => "BSON_TOO_LARGE",
            ConnectionFault::WriteConcernInvalid => "WRITE_CONCERN_INVALID",
        }
    }
}

impl fmt::Display for ConnectionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

bitflags! {
    /// 构建器累积的状态位
    ///
    /// 每次追加失败都会在构建器上留下对应的位，
    /// 与返回的 MongoError 一一对应。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BsonStatus: u8 {
        const NOT_UTF8 = 1 << 1;
        const FIELD_HAS_DOT = 1 << 2;
        const FIELD_INIT_DOLLAR = 1 << 3;
        const ALREADY_FINISHED = 1 << 4;
    }
}

impl BsonStatus {
    /// 状态位对应的错误码列表
    pub fn codes(&self) -> Vec<&'static str> {
        let mut codes = Vec::new();
        if self.contains(BsonStatus::NOT_UTF8) {
            codes.push("NOT_UTF8");
        }
        if self.contains(BsonStatus::FIELD_HAS_DOT) {
            codes.push("HAS_DOT");
        }
        if self.contains(BsonStatus::FIELD_INIT_DOLLAR) {
            codes.push("INIT_DOLLAR");
        }
        if self.contains(BsonStatus::ALREADY_FINISHED) {
            codes.push("ALREADY_FINISHED");
        }
        codes
    }

    /// 由错误推导出需要记录的状态位
    pub fn from_error(err: &MongoError) -> Self {
        match err {
            MongoError::NotUtf8 { .. } => BsonStatus::NOT_UTF8,
            MongoError::InvalidFieldName {
                reason: FieldNameFault::HasDot,
                ..
            } => BsonStatus::FIELD_HAS_DOT,
            MongoError::InvalidFieldName {
                reason: FieldNameFault::InitDollar,
                ..
            } => BsonStatus::FIELD_INIT_DOLLAR,
            MongoError::AlreadyFinished => BsonStatus::ALREADY_FINISHED,
            _ => BsonStatus::empty(),
        }
    }
}

/// mongolink 错误类型
///
/// 包含所有可能的错误情况。实现了 `Clone`，游标可以同时记录并返回同一个故障。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MongoError {
    /// 二进制输入格式错误或被截断
    #[error("Decode error at offset {offset}: {reason}")]
    Decode { offset: usize, reason: String },

    /// 构建器未按协议使用
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// 对已完成的文档再次 finish
    #[error("bson already finished")]
    AlreadyFinished,

    /// 内容不是有效的 UTF-8
    #[error("bson not utf8 in field '{field}'")]
    NotUtf8 { field: String },

    /// 字段名校验失败
    #[error("Invalid field name '{field}': {reason}")]
    InvalidFieldName { field: String, reason: FieldNameFault },

    /// 游标协议故障
    #[error("Cursor error: {0}")]
    Cursor(CursorFault),

    /// 传输层故障，附带连接上下文
    #[error("Transport error ({context}): {fault}: {message}")]
    Transport {
        context: String,
        fault: ConnectionFault,
        message: String,
    },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 参数校验错误
    #[error("Validation error: {0}")]
    Validation(String),
}

impl MongoError {
    pub fn decode(offset: usize, reason: impl Into<String>) -> Self {
        MongoError::Decode {
            offset,
            reason: reason.into(),
        }
    }

    pub fn transport(
        context: impl Into<String>,
        fault: ConnectionFault,
        message: impl Into<String>,
    ) -> Self {
        MongoError::Transport {
            context: context.into(),
            fault,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MongoError::Decode { .. } => ErrorKind::Decode,
            MongoError::InvalidState(_) => ErrorKind::InvalidState,
            MongoError::AlreadyFinished => ErrorKind::AlreadyFinished,
            MongoError::NotUtf8 { .. } => ErrorKind::NotUtf8,
            MongoError::InvalidFieldName { .. } => ErrorKind::InvalidFieldName,
            MongoError::Cursor(_) => ErrorKind::Cursor,
            MongoError::Transport { .. } => ErrorKind::Transport,
            MongoError::Config(_) => ErrorKind::Config,
            MongoError::Validation(_) => ErrorKind::Validation,
        }
    }

    /// 出错的字段名（如有）
    pub fn field(&self) -> Option<&str> {
        match self {
            MongoError::NotUtf8 { field } | MongoError::InvalidFieldName { field, .. } => {
                Some(field.as_str())
            }
            _ => None,
        }
    }

    /// 结构化错误码
    ///
    /// 第一个元素是来源域 (`BSON` / `MONGO` / `CONFIG`)，其后是具体代码。
    pub fn error_code(&self) -> Vec<&'static str> {
        match self {
            MongoError::Decode { .. } => vec!["BSON", "DECODE_ERROR"],
            MongoError::InvalidState(_) => vec!["BSON", "INVALID_STATE"],
            MongoError::AlreadyFinished => vec!["BSON", "ALREADY_FINISHED"],
            MongoError::NotUtf8 { .. } => vec!["BSON", "NOT_UTF8"],
            MongoError::InvalidFieldName { reason, .. } => vec!["BSON", reason.code()],
            MongoError::Cursor(fault) => vec!["MONGO", fault.code()],
            MongoError::Transport { fault, .. } => vec!["MONGO", fault.code()],
            MongoError::Config(_) => vec!["CONFIG", "INVALID"],
            MongoError::Validation(_) => vec!["MONGO", "INVALID_ARGUMENT"],
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            MongoError::Cursor(fault) => fault.is_fatal(),
            _ => true,
        }
    }
}

/// mongolink Result 类型别名
pub type MongoResult<T> = Result<T, MongoError>;
