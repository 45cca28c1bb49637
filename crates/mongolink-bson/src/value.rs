//! BSON 值类型定义模块
//!
//! 定义了 BSON 中可编解码的全部数据类型。每个线格式类型标记对应一个枚举分支，
//! 编码和解码都是对该枚举的一次穷尽匹配。

use crate::document::Document;
use crate::spec::{BinarySubtype, ElementType};
use chrono::{DateTime, TimeZone, Utc};
use mongolink_common::{MongoError, MongoResult, ObjectId};
use uuid::Uuid;

/// BSON 值的枚举类型
///
/// # 支持的类型
///
/// - **数值**: Double, Int32, Int64
/// - **文本**: String, Symbol, Code
/// - **标识/时间**: ObjectId, DateTime(毫秒), Timestamp(内部时间戳)
/// - **复合类型**: Document, Array(键为 "0","1",... 的文档), CodeWithScope
/// - **其他**: Binary, Boolean, Null, Undefined, Regex
/// - **Unknown**: 解码到无法识别的类型标记时的占位，携带原始标记值
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Double(f64),
    String(String),
    Document(Document),
    Array(Document),
    Binary(Binary),
    Undefined,
    ObjectId(ObjectId),
    Boolean(bool),
    /// UTC 毫秒时间戳
    DateTime(i64),
    Null,
    Regex(Regex),
    Code(String),
    Symbol(String),
    CodeWithScope(CodeWithScope),
    Int32(i32),
    Timestamp(Timestamp),
    Int64(i64),
    Unknown(u8),
}

/// 二进制数据及其子类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub subtype: BinarySubtype,
    pub bytes: Vec<u8>,
}

impl Binary {
    pub fn new(subtype: BinarySubtype, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            subtype,
            bytes: bytes.into(),
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self::new(BinarySubtype::Uuid, uuid.as_bytes().to_vec())
    }

    /// 子类型为 UUID 且长度为 16 时返回 UUID
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self.subtype {
            BinarySubtype::Uuid | BinarySubtype::UuidOld => {
                Uuid::from_slice(&self.bytes).ok()
            }
            _ => None,
        }
    }
}

/// 正则表达式值
///
/// 包含正则表达式的模式和选项（如 i, m, s, x）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regex {
    pub pattern: String,
    pub options: String,
}

impl Regex {
    pub fn new(pattern: impl Into<String>, options: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            options: options.into(),
        }
    }

    /// 编译为 `regex::Regex`
    ///
    /// # Brief
    /// 将 BSON 选项 i/m/s/x 映射为内联标志，其余选项 (如 l, u) 忽略
    ///
    /// # Returns
    /// 成功返回编译后的正则，模式非法返回 Validation 错误
    pub fn compile(&self) -> MongoResult<regex::Regex> {
        let flags: String = self
            .options
            .chars()
            .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
            .collect();
        let source = if flags.is_empty() {
            self.pattern.clone()
        } else {
            format!("(?{}){}", flags, self.pattern)
        };
        regex::Regex::new(&source)
            .map_err(|e| MongoError::Validation(format!("Invalid regex '{}': {}", self.pattern, e)))
    }
}

/// 带作用域的代码
#[derive(Debug, Clone, PartialEq)]
pub struct CodeWithScope {
    pub code: String,
    pub scope: Document,
}

/// BSON 内部时间戳 (复制集 oplog 使用)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub increment: u32,
    pub time: u32,
}

impl Timestamp {
    pub fn new(time: u32, increment: u32) -> Self {
        Self { increment, time }
    }

    pub(crate) fn to_u64(self) -> u64 {
        ((self.time as u64) << 32) | self.increment as u64
    }

    pub(crate) fn from_u64(raw: u64) -> Self {
        Self {
            increment: raw as u32,
            time: (raw >> 32) as u32,
        }
    }
}

impl Value {
    /// 线格式类型标记，`Unknown` 返回 None
    pub fn element_type(&self) -> Option<ElementType> {
        let t = match self {
            Value::Double(_) => ElementType::Double,
            Value::String(_) => ElementType::String,
            Value::Document(_) => ElementType::Document,
            Value::Array(_) => ElementType::Array,
            Value::Binary(_) => ElementType::Binary,
            Value::Undefined => ElementType::Undefined,
            Value::ObjectId(_) => ElementType::ObjectId,
            Value::Boolean(_) => ElementType::Boolean,
            Value::DateTime(_) => ElementType::DateTime,
            Value::Null => ElementType::Null,
            Value::Regex(_) => ElementType::RegularExpression,
            Value::Code(_) => ElementType::JavaScriptCode,
            Value::Symbol(_) => ElementType::Symbol,
            Value::CodeWithScope(_) => ElementType::JavaScriptCodeWithScope,
            Value::Int32(_) => ElementType::Int32,
            Value::Timestamp(_) => ElementType::Timestamp,
            Value::Int64(_) => ElementType::Int64,
            Value::Unknown(_) => return None,
        };
        Some(t)
    }

    /// 原始类型标记字节
    pub fn tag(&self) -> u8 {
        match self {
            Value::Unknown(tag) => *tag,
            other => other.element_type().map(|t| t as u8).unwrap_or_default(),
        }
    }

    /// 获取值的类型名称
    ///
    /// 与脚本绑定层输出的类型名一致。
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Document(_) => "object",
            Value::Array(_) => "array",
            Value::Binary(_) => "bin",
            Value::Undefined => "undefined",
            Value::ObjectId(_) => "oid",
            Value::Boolean(_) => "bool",
            Value::DateTime(_) => "date",
            Value::Null => "null",
            Value::Regex(_) => "regex",
            Value::Code(_) => "code",
            Value::Symbol(_) => "symbol",
            Value::CodeWithScope(_) => "codewscope",
            Value::Int32(_) => "int",
            Value::Timestamp(_) => "timestamp",
            Value::Int64(_) => "long",
            Value::Unknown(_) => "unknown",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Value::Unknown(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(n) => Some(*n),
            _ => None,
        }
    }

    /// 整数类型（Int32 或 Int64）统一取 i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(n) => Some(*n as i64),
            Value::Int64(n) => Some(*n),
            _ => None,
        }
    }

    /// 数值类型统一取 f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(n) => Some(*n),
            Value::Int32(n) => Some(*n as f64),
            Value::Int64(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Symbol(s) | Value::Code(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// 数组以文档形式保存，键为下标字符串
    pub fn as_array(&self) -> Option<&Document> {
        match self {
            Value::Array(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<&ObjectId> {
        match self {
            Value::ObjectId(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Binary> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// DateTime 转为 chrono 时间，超出可表示范围返回 None
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(millis) => Utc.timestamp_millis_opt(*millis).single(),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::ObjectId(v)
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Document(v)
    }
}

impl From<Binary> for Value {
    fn from(v: Binary) -> Self {
        Value::Binary(v)
    }
}

impl From<Regex> for Value {
    fn from(v: Regex) -> Self {
        Value::Regex(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Timestamp(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v.timestamp_millis())
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Binary(Binary::from_uuid(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
