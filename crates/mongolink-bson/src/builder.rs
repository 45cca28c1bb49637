//! 文档构建器模块
//!
//! 以追加方式直接写出 BSON 字节:
//!
//! ```rust,ignore
//! use mongolink_bson::DocumentBuilder;
//!
//! let mut b = DocumentBuilder::new();
//! b.append_str("name", "alice")?.append_i32("age", 30)?;
//! b.start_array("tags")?.push("a")?.push("b")?;
//! b.finish_array()?;
//! let raw = b.finish()?;
//! ```
//!
//! 每个打开的子文档/数组在上下文栈上占一帧，记录其长度前缀的位置，
//! 关闭时回填长度。`finish()` 之后构建器只读。

use crate::codec::{self, Encoder};
use crate::document::{Document, RawDocument};
use crate::spec::{BinarySubtype, ElementType};
use crate::value::{Binary, CodeWithScope, Regex, Timestamp, Value};
use bytes::{BufMut, BytesMut};
use mongolink_common::{
    BsonStatus, CodecLimits, FieldNameFault, MongoError, MongoResult, ObjectId,
};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Object,
    Array,
}

impl FrameKind {
    fn name(self) -> &'static str {
        match self {
            FrameKind::Object => "object",
            FrameKind::Array => "array",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    kind: FrameKind,
    /// 长度前缀在缓冲区中的偏移
    start: usize,
    /// 数组中下一个元素的下标
    next_index: u32,
}

/// 字段名校验模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// 存储文档: 禁止 '.' 和开头的 '$'
    Strict,
    /// 查询/更新/投影文档: 允许操作符和点路径
    Query,
}

/// BSON 文档构建器
#[derive(Debug)]
pub struct DocumentBuilder {
    buf: BytesMut,
    stack: SmallVec<[Frame; 8]>,
    finished: Option<RawDocument>,
    status: BsonStatus,
    mode: KeyMode,
    limits: CodecLimits,
}

impl Default for DocumentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentBuilder {
    /// 创建严格模式的构建器
    pub fn new() -> Self {
        Self::with_mode(KeyMode::Strict)
    }

    /// 创建查询模式的构建器
    pub fn query() -> Self {
        Self::with_mode(KeyMode::Query)
    }

    pub fn with_mode(mode: KeyMode) -> Self {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_i32_le(0);
        Self {
            buf,
            stack: SmallVec::new(),
            finished: None,
            status: BsonStatus::empty(),
            mode,
            limits: CodecLimits::default(),
        }
    }

    /// 替换编解码限制
    pub fn limits(mut self, limits: CodecLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    /// 累积的状态位
    pub fn status(&self) -> BsonStatus {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// 当前打开的子文档/数组层数
    pub fn open_contexts(&self) -> usize {
        self.stack.len()
    }

    /// 已写入的字节数
    pub fn len(&self) -> usize {
        match &self.finished {
            Some(raw) => raw.len(),
            None => self.buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.finished.is_none() && self.buf.len() == 4 && self.stack.is_empty()
    }

    pub fn append_double(&mut self, key: &str, value: f64) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::Double(value))
    }

    pub fn append_str(&mut self, key: &str, value: &str) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::String(value.to_string()))
    }

    /// 追加来自外部的字节串，必须是合法的 UTF-8
    pub fn append_str_bytes(&mut self, key: &str, value: &[u8]) -> MongoResult<&mut Self> {
        self.check_key(key)?;
        let s = match std::str::from_utf8(value) {
            Ok(s) => s,
            Err(_) => {
                return Err(self.fail(MongoError::NotUtf8 {
                    field: key.to_string(),
                }))
            }
        };
        self.append_value(key, &Value::String(s.to_string()))
    }

    pub fn append_symbol(&mut self, key: &str, value: &str) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::Symbol(value.to_string()))
    }

    pub fn append_object_id(&mut self, key: &str, oid: ObjectId) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::ObjectId(oid))
    }

    /// 生成并追加一个新的 ObjectId
    pub fn append_new_oid(&mut self, key: &str) -> MongoResult<&mut Self> {
        self.append_object_id(key, ObjectId::new())
    }

    pub fn append_bool(&mut self, key: &str, value: bool) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::Boolean(value))
    }

    /// 追加 UTC 毫秒时间戳
    pub fn append_date_time(&mut self, key: &str, millis: i64) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::DateTime(millis))
    }

    /// 追加 Unix 秒数，按毫秒存储
    pub fn append_time_t(&mut self, key: &str, secs: i64) -> MongoResult<&mut Self> {
        let millis = secs.checked_mul(1000).ok_or_else(|| {
            MongoError::Validation(format!("time value {} out of range", secs))
        })?;
        self.append_date_time(key, millis)
    }

    pub fn append_binary(
        &mut self,
        key: &str,
        subtype: BinarySubtype,
        bytes: &[u8],
    ) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::Binary(Binary::new(subtype, bytes)))
    }

    pub fn append_null(&mut self, key: &str) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::Null)
    }

    pub fn append_undefined(&mut self, key: &str) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::Undefined)
    }

    pub fn append_regex(&mut self, key: &str, pattern: &str, options: &str) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::Regex(Regex::new(pattern, options)))
    }

    pub fn append_code(&mut self, key: &str, code: &str) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::Code(code.to_string()))
    }

    pub fn append_code_with_scope(
        &mut self,
        key: &str,
        code: &str,
        scope: &Document,
    ) -> MongoResult<&mut Self> {
        self.append_value(
            key,
            &Value::CodeWithScope(CodeWithScope {
                code: code.to_string(),
                scope: scope.clone(),
            }),
        )
    }

    pub fn append_i32(&mut self, key: &str, value: i32) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::Int32(value))
    }

    pub fn append_i64(&mut self, key: &str, value: i64) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::Int64(value))
    }

    pub fn append_timestamp(&mut self, key: &str, ts: Timestamp) -> MongoResult<&mut Self> {
        self.append_value(key, &Value::Timestamp(ts))
    }

    /// 嵌入已完成的文档，原样复制其字节 (含长度前缀)
    ///
    /// 嵌入前按剩余嵌套层数、文档大小上限和字段名模式检查。
    pub fn append_document(&mut self, key: &str, doc: &RawDocument) -> MongoResult<&mut Self> {
        self.append_raw(key, ElementType::Document, doc)
    }

    /// 把已完成的文档作为数组嵌入
    pub fn append_array_document(&mut self, key: &str, doc: &RawDocument) -> MongoResult<&mut Self> {
        self.append_raw(key, ElementType::Array, doc)
    }

    /// 追加任意值
    ///
    /// # Brief
    /// 校验状态与字段名 (包括嵌套子文档里的字段名) 后写入一个完整元素；
    /// 写入失败时缓冲区回退到追加前
    ///
    /// # Arguments
    /// * `key` - 字段名
    /// * `value` - 字段值
    ///
    /// # Returns
    /// 成功返回构建器自身以便链式调用
    pub fn append_value(&mut self, key: &str, value: &Value) -> MongoResult<&mut Self> {
        self.check_key(key)?;
        if let Some((field, reason)) = nested_key_fault(self.mode, value) {
            return Err(self.fail(MongoError::InvalidFieldName { field, reason }));
        }
        let mark = self.buf.len();
        let depth = self.stack.len() + 1;
        let result =
            Encoder::with_depth(&mut self.buf, &self.limits, depth).write_element(key, value);
        match result {
            Ok(()) => {
                self.bump_index();
                Ok(self)
            }
            Err(e) => {
                self.buf.truncate(mark);
                Err(self.fail(e))
            }
        }
    }

    /// 追加字符串键值对列表
    ///
    /// 先校验全部键，任何一个不合法都不会写入。
    pub fn append_kv_list<K, V>(&mut self, pairs: &[(K, V)]) -> MongoResult<&mut Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, _) in pairs {
            self.check_key(key.as_ref())?;
        }
        for (key, value) in pairs {
            self.append_str(key.as_ref(), value.as_ref())?;
        }
        Ok(self)
    }

    /// 向当前打开的数组追加下一个元素
    pub fn push(&mut self, value: impl Into<Value>) -> MongoResult<&mut Self> {
        let index = match self.stack.last() {
            Some(frame) if frame.kind == FrameKind::Array => frame.next_index,
            _ => {
                return Err(self.fail(MongoError::InvalidState(
                    "push requires an open array".to_string(),
                )))
            }
        };
        self.append_value(&index.to_string(), &value.into())
    }

    pub fn start_array(&mut self, key: &str) -> MongoResult<&mut Self> {
        self.start_context(key, FrameKind::Array)
    }

    pub fn finish_array(&mut self) -> MongoResult<&mut Self> {
        self.finish_context(FrameKind::Array)
    }

    pub fn start_object(&mut self, key: &str) -> MongoResult<&mut Self> {
        self.start_context(key, FrameKind::Object)
    }

    pub fn finish_object(&mut self) -> MongoResult<&mut Self> {
        self.finish_context(FrameKind::Object)
    }

    /// 完成文档
    ///
    /// # Brief
    /// 写入终止符并回填长度。所有子文档/数组必须已关闭。
    /// 重复调用每次都返回 AlreadyFinished。
    ///
    /// # Returns
    /// 成功返回编码完成的文档
    pub fn finish(&mut self) -> MongoResult<RawDocument> {
        if self.finished.is_some() {
            return Err(self.fail(MongoError::AlreadyFinished));
        }
        if let Some(frame) = self.stack.last() {
            let msg = format!(
                "finish with {} open context(s), innermost is an {}",
                self.stack.len(),
                frame.kind.name()
            );
            return Err(self.fail(MongoError::InvalidState(msg)));
        }
        if self.buf.len() + 1 > self.limits.max_document_size {
            return Err(self.fail(MongoError::Validation(format!(
                "Document too large: max {} bytes",
                self.limits.max_document_size
            ))));
        }
        self.buf.put_u8(0);
        if let Err(e) = codec::patch_length(&mut self.buf, 0) {
            return Err(self.fail(e));
        }
        let raw = RawDocument::from_encoded(std::mem::take(&mut self.buf).freeze());
        self.finished = Some(raw.clone());
        Ok(raw)
    }

    /// 再次取得已完成的文档
    pub fn raw(&self) -> MongoResult<RawDocument> {
        self.finished
            .clone()
            .ok_or_else(|| MongoError::InvalidState("document is not finished".to_string()))
    }

    fn start_context(&mut self, key: &str, kind: FrameKind) -> MongoResult<&mut Self> {
        self.check_key(key)?;
        if self.stack.len() + 2 > self.limits.max_nesting_depth {
            return Err(self.fail(MongoError::Validation(format!(
                "Nesting too deep: max {}",
                self.limits.max_nesting_depth
            ))));
        }
        let tag = match kind {
            FrameKind::Object => ElementType::Document,
            FrameKind::Array => ElementType::Array,
        };
        self.buf.put_u8(tag as u8);
        self.buf.put_slice(key.as_bytes());
        self.buf.put_u8(0);
        self.bump_index();
        let start = self.buf.len();
        self.buf.put_i32_le(0);
        self.stack.push(Frame {
            kind,
            start,
            next_index: 0,
        });
        Ok(self)
    }

    fn finish_context(&mut self, kind: FrameKind) -> MongoResult<&mut Self> {
        if self.finished.is_some() {
            return Err(self.fail(MongoError::InvalidState(format!(
                "finish_{} after finish",
                kind.name()
            ))));
        }
        let frame = match self.stack.last() {
            Some(frame) if frame.kind == kind => *frame,
            Some(frame) => {
                let msg = format!(
                    "finish_{} but the innermost open context is an {}",
                    kind.name(),
                    frame.kind.name()
                );
                return Err(self.fail(MongoError::InvalidState(msg)));
            }
            None => {
                let msg = format!("finish_{} with no open {}", kind.name(), kind.name());
                return Err(self.fail(MongoError::InvalidState(msg)));
            }
        };
        self.stack.pop();
        self.buf.put_u8(0);
        if let Err(e) = codec::patch_length(&mut self.buf, frame.start) {
            return Err(self.fail(e));
        }
        Ok(self)
    }

    fn append_raw(&mut self, key: &str, tag: ElementType, doc: &RawDocument) -> MongoResult<&mut Self> {
        self.check_key(key)?;
        // 嵌入文档自身占一层，剩余层数留给它的内部
        let remaining = self
            .limits
            .max_nesting_depth
            .saturating_sub(self.stack.len() + 1);
        if remaining == 0 {
            return Err(self.fail(MongoError::Validation(format!(
                "Nesting too deep: max {}",
                self.limits.max_nesting_depth
            ))));
        }
        let inner_limits = CodecLimits {
            max_nesting_depth: remaining,
            ..self.limits
        };
        let decoded = match codec::decode_document_with_limits(doc.as_bytes(), &inner_limits) {
            Ok(decoded) => decoded,
            Err(e) => {
                return Err(self.fail(MongoError::Validation(format!(
                    "cannot embed '{}': {}",
                    key, e
                ))))
            }
        };
        let embedded = match tag {
            ElementType::Array => Value::Array(decoded),
            _ => Value::Document(decoded),
        };
        if let Some((field, reason)) = nested_key_fault(self.mode, &embedded) {
            return Err(self.fail(MongoError::InvalidFieldName { field, reason }));
        }
        // 类型标记 + 键 + 终止符 + 文档 + 外层终止符
        if self.buf.len() + key.len() + doc.len() + 3 > self.limits.max_document_size {
            return Err(self.fail(MongoError::Validation(format!(
                "Document too large: max {} bytes",
                self.limits.max_document_size
            ))));
        }
        self.buf.put_u8(tag as u8);
        self.buf.put_slice(key.as_bytes());
        self.buf.put_u8(0);
        self.buf.put_slice(doc.as_bytes());
        self.bump_index();
        Ok(self)
    }

    /// 追加前的统一检查: 未完成且字段名合法
    fn check_key(&mut self, key: &str) -> MongoResult<()> {
        if self.finished.is_some() {
            return Err(self.fail(MongoError::InvalidState(format!(
                "append '{}' after finish",
                key
            ))));
        }
        match key_fault(self.mode, key) {
            Some(reason) => Err(self.fail(MongoError::InvalidFieldName {
                field: key.to_string(),
                reason,
            })),
            None => Ok(()),
        }
    }

    fn bump_index(&mut self) {
        if let Some(frame) = self.stack.last_mut() {
            frame.next_index += 1;
        }
    }

    fn fail(&mut self, err: MongoError) -> MongoError {
        self.status |= BsonStatus::from_error(&err);
        err
    }
}

fn key_fault(mode: KeyMode, key: &str) -> Option<FieldNameFault> {
    if key.is_empty() {
        Some(FieldNameFault::Empty)
    } else if key.as_bytes().contains(&0) {
        Some(FieldNameFault::ContainsNul)
    } else if mode == KeyMode::Strict && key.starts_with('$') {
        Some(FieldNameFault::InitDollar)
    } else if mode == KeyMode::Strict && key.contains('.') {
        Some(FieldNameFault::HasDot)
    } else {
        None
    }
}

/// 递归检查值内部子文档的字段名
///
/// 数组下标键由编码器生成，不参与校验。
fn nested_key_fault(mode: KeyMode, value: &Value) -> Option<(String, FieldNameFault)> {
    match value {
        Value::Document(doc) => document_key_fault(mode, doc),
        Value::Array(items) => items.values().find_map(|inner| nested_key_fault(mode, inner)),
        Value::CodeWithScope(cws) => document_key_fault(mode, &cws.scope),
        _ => None,
    }
}

fn document_key_fault(mode: KeyMode, doc: &Document) -> Option<(String, FieldNameFault)> {
    doc.iter().find_map(|(key, inner)| match key_fault(mode, key) {
        Some(reason) => Some((key.to_string(), reason)),
        None => nested_key_fault(mode, inner),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongolink_common::ErrorKind;

    #[test]
    fn test_scenario_document() {
        let mut b = DocumentBuilder::new();
        b.append_str("name", "alice").unwrap().append_i32("age", 30).unwrap();
        b.start_array("tags").unwrap().push("a").unwrap().push("b").unwrap();
        b.finish_array().unwrap();
        let raw = b.finish().unwrap();

        let mut expected = Document::new();
        expected.insert("name", "alice");
        expected.insert("age", 30);
        expected.insert("tags", Value::Array(Document::from_array_values(["a", "b"])));
        assert_eq!(raw.decode().unwrap(), expected);
        assert_eq!(raw, codec::encode_document(&expected).unwrap());
        assert_eq!(b.raw().unwrap(), raw);
    }

    #[test]
    fn test_negative_nesting() {
        let mut b = DocumentBuilder::new();
        let err = b.finish_array().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        b.start_object("o").unwrap();
        assert_eq!(b.finish_array().unwrap_err().kind(), ErrorKind::InvalidState);
        b.finish_object().unwrap();
        assert_eq!(b.finish_object().unwrap_err().kind(), ErrorKind::InvalidState);
        assert!(b.finish().is_ok());
    }

    #[test]
    fn test_double_finish_never_heals() {
        let mut b = DocumentBuilder::new();
        b.append_null("n").unwrap();
        b.finish().unwrap();
        for _ in 0..3 {
            assert_eq!(b.finish().unwrap_err(), MongoError::AlreadyFinished);
        }
        assert!(b.status().contains(BsonStatus::ALREADY_FINISHED));
        assert_eq!(b.append_i32("x", 1).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_finish_with_open_context() {
        let mut b = DocumentBuilder::new();
        b.start_array("a").unwrap();
        assert_eq!(b.finish().unwrap_err().kind(), ErrorKind::InvalidState);
        b.finish_array().unwrap();
        assert!(b.finish().is_ok());
    }

    #[test]
    fn test_field_names_rejected_before_write() {
        let mut b = DocumentBuilder::new();
        let before = b.len();

        let err = b.append_i32("a.b", 1).unwrap_err();
        assert!(matches!(
            err,
            MongoError::InvalidFieldName { reason: FieldNameFault::HasDot, .. }
        ));
        let err = b.append_i32("$foo", 1).unwrap_err();
        assert_eq!(err.field(), Some("$foo"));
        assert!(b.start_object("").is_err());
        assert_eq!(b.len(), before);

        assert!(b.status().contains(BsonStatus::FIELD_HAS_DOT));
        assert!(b.status().contains(BsonStatus::FIELD_INIT_DOLLAR));
        assert!(b.finish().unwrap().decode().unwrap().is_empty());
    }

    #[test]
    fn test_query_mode_allows_operators() {
        let mut b = DocumentBuilder::query();
        b.start_object("age").unwrap().append_i32("$gt", 21).unwrap();
        b.finish_object().unwrap();
        b.append_str("address.city", "Oslo").unwrap();
        let doc = b.finish().unwrap().decode().unwrap();
        assert_eq!(doc.get_document("age").unwrap().get_i32("$gt"), Some(21));
        assert_eq!(doc.get_str("address.city"), Some("Oslo"));
        assert!(DocumentBuilder::query().append_i32("a\0b", 1).is_err());
    }

    #[test]
    fn test_not_utf8() {
        let mut b = DocumentBuilder::new();
        let err = b.append_str_bytes("s", &[0x66, 0xff]).unwrap_err();
        assert_eq!(err, MongoError::NotUtf8 { field: "s".to_string() });
        assert_eq!(b.status().codes(), vec!["NOT_UTF8"]);
        b.append_str_bytes("s", "ok".as_bytes()).unwrap();
        assert_eq!(b.finish().unwrap().decode().unwrap().get_str("s"), Some("ok"));
    }

    #[test]
    fn test_embed_finished_document() {
        let mut inner = DocumentBuilder::new();
        inner.append_i64("n", 7).unwrap();
        let inner = inner.finish().unwrap();

        let mut b = DocumentBuilder::new();
        b.append_document("sub", &inner).unwrap();
        let raw = b.finish().unwrap();

        let bytes = raw.as_bytes();
        let found = bytes
            .windows(inner.len())
            .any(|w| w == inner.as_bytes());
        assert!(found);
        assert_eq!(
            raw.decode().unwrap().get_document("sub"),
            Some(&inner.decode().unwrap())
        );
    }

    #[test]
    fn test_nested_field_names_checked() {
        let mut sub = Document::new();
        sub.insert("ok", 1);
        sub.insert("a.b", 1);
        let mut b = DocumentBuilder::new();
        b.append_i32("before", 1).unwrap();
        let mark = b.buf.len();
        let err = b.append_value("sub", &Value::Document(sub.clone())).unwrap_err();
        assert_eq!(
            err,
            MongoError::InvalidFieldName {
                field: "a.b".to_string(),
                reason: FieldNameFault::HasDot,
            }
        );
        assert!(b.status().contains(BsonStatus::FIELD_HAS_DOT));
        assert_eq!(b.buf.len(), mark);

        // 数组下标键不校验，但数组元素里的子文档要校验
        let mut dollar = Document::new();
        dollar.insert("$x", 2);
        let list = Document::from_array_values([Value::Int32(1), Value::Document(dollar.clone())]);
        let err = b.append_value("list", &Value::Array(list)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFieldName);

        let err = b.append_code_with_scope("f", "return x;", &dollar).unwrap_err();
        assert_eq!(
            err,
            MongoError::InvalidFieldName {
                field: "$x".to_string(),
                reason: FieldNameFault::InitDollar,
            }
        );
        assert!(b.status().contains(BsonStatus::FIELD_INIT_DOLLAR));
        assert_eq!(b.buf.len(), mark);

        let raw = b.finish().unwrap();
        assert_eq!(raw.decode().unwrap().len(), 1);

        let mut q = DocumentBuilder::query();
        q.append_value("sub", &Value::Document(sub)).unwrap();
        q.append_code_with_scope("f", "return x;", &dollar).unwrap();
        assert!(q.status().is_empty());
        assert_eq!(q.finish().unwrap().decode().unwrap().len(), 2);
    }

    #[test]
    fn test_embed_checks_depth_size_and_keys() {
        let mut deep = DocumentBuilder::new();
        deep.start_object("a").unwrap().append_i32("x", 1).unwrap();
        deep.finish_object().unwrap();
        let deep = deep.finish().unwrap();

        let limits = CodecLimits {
            max_nesting_depth: 2,
            ..CodecLimits::default()
        };
        // 顶层 + "sub" + "a" 共三层
        let mut b = DocumentBuilder::new().limits(limits);
        assert_eq!(
            b.append_document("sub", &deep).unwrap_err().kind(),
            ErrorKind::Validation
        );
        let mut flat = DocumentBuilder::new();
        flat.append_i32("x", 1).unwrap();
        let flat = flat.finish().unwrap();
        b.append_document("sub", &flat).unwrap();
        b.start_object("o").unwrap();
        assert_eq!(
            b.append_document("inner", &flat).unwrap_err().kind(),
            ErrorKind::Validation
        );

        let small = CodecLimits {
            max_document_size: 24,
            ..CodecLimits::default()
        };
        let mut b = DocumentBuilder::new().limits(small);
        let err = b.append_document("a_long_key", &flat).unwrap_err();
        assert!(err.to_string().contains("too large"));
        b.append_document("k", &flat).unwrap();
        assert!(b.finish().is_ok());

        let mut q = DocumentBuilder::query();
        q.append_i32("$set", 1).unwrap();
        let operator = q.finish().unwrap();
        let mut b = DocumentBuilder::new();
        assert_eq!(
            b.append_document("u", &operator).unwrap_err().kind(),
            ErrorKind::InvalidFieldName
        );
        assert!(b.status().contains(BsonStatus::FIELD_INIT_DOLLAR));
    }

    #[test]
    fn test_deep_nesting_round_trip() {
        let mut b = DocumentBuilder::new();
        b.start_object("l1").unwrap();
        b.start_array("l2").unwrap();
        b.start_object("0").unwrap();
        b.append_double("pi", 3.5).unwrap();
        b.append_regex("re", "^x", "i").unwrap();
        b.finish_object().unwrap();
        b.push(true).unwrap();
        b.finish_array().unwrap();
        b.finish_object().unwrap();
        let raw = b.finish().unwrap();

        let doc = raw.decode().unwrap();
        let l2 = doc.get_document("l1").unwrap().get_array("l2").unwrap();
        assert_eq!(l2.keys().collect::<Vec<_>>(), vec!["0", "1"]);
        assert_eq!(l2.get_document("0").unwrap().get_f64("pi"), Some(3.5));
        assert_eq!(codec::encode_document(&doc).unwrap(), raw);
    }

    #[test]
    fn test_push_outside_array() {
        let mut b = DocumentBuilder::new();
        assert_eq!(b.push(1).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_kv_list_is_atomic() {
        let mut b = DocumentBuilder::new();
        assert!(b.append_kv_list(&[("a", "1"), ("b.c", "2")]).is_err());
        b.append_kv_list(&[("a", "1"), ("b", "2")]).unwrap();
        let doc = b.finish().unwrap().decode().unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.get_str("b"), Some("2"));
    }

    #[test]
    fn test_nesting_limit() {
        let limits = CodecLimits {
            max_nesting_depth: 2,
            ..CodecLimits::default()
        };
        let mut b = DocumentBuilder::new().limits(limits);
        b.start_object("a").unwrap();
        assert_eq!(b.start_object("b").unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_time_t_and_oid() {
        let mut b = DocumentBuilder::new();
        b.append_time_t("t", 1_700_000_000).unwrap();
        b.append_new_oid("_id").unwrap();
        let doc = b.finish().unwrap().decode().unwrap();
        assert_eq!(doc.get("t"), Some(&Value::DateTime(1_700_000_000_000)));
        assert!(doc.get("_id").and_then(|v| v.as_object_id()).is_some());
        assert!(DocumentBuilder::new().append_time_t("t", i64::MAX).is_err());
    }
}
