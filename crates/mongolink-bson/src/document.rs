//! BSON 文档结构模块
//!
//! - `Document`: 解码后的有序键值序列，保留重复键与插入顺序
//! - `RawDocument`: 完成编码后的不可变二进制缓冲区

use crate::codec;
use crate::value::Value;
use bytes::Bytes;
use compact_str::CompactString;
use mongolink_common::{CodecLimits, MongoError, MongoResult};
use std::fmt;

/// BSON 文档
///
/// 有序的 (键, 值) 序列。BSON 线格式允许重复键，因此这里不用映射结构，
/// 需要按名查找时取第一个匹配项。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    fields: Vec<(CompactString, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// 追加字段
    ///
    /// # Brief
    /// 在文档末尾追加一个字段，不检查重名
    ///
    /// # Arguments
    /// * `key` - 字段名
    /// * `value` - 字段值
    pub fn insert(&mut self, key: impl Into<CompactString>, value: impl Into<Value>) {
        self.fields.push((key.into(), value.into()));
    }

    /// 设置字段
    ///
    /// 已存在同名字段时原位替换第一个匹配项，否则追加。
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| k.as_str() == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((CompactString::from(key), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k.as_str() == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields
            .iter_mut()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v)
    }

    /// 移除第一个同名字段并返回其值
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.fields.iter().position(|(k, _)| k.as_str() == key)?;
        Some(self.fields.remove(pos).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.fields.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(|v| v.as_i32())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_document(&self, key: &str) -> Option<&Document> {
        self.get(key).and_then(|v| v.as_document())
    }

    pub fn get_array(&self, key: &str) -> Option<&Document> {
        self.get(key).and_then(|v| v.as_array())
    }

    /// 把文档当作数组读取，按顺序返回值
    pub fn array_values(&self) -> impl Iterator<Item = &Value> {
        self.values()
    }

    /// 由值序列构造数组文档，键为 "0","1",...
    pub fn from_array_values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let mut doc = Document::new();
        for (i, v) in values.into_iter().enumerate() {
            doc.insert(CompactString::from(i.to_string()), v);
        }
        doc
    }

    /// 是否含有未知类型标记 (递归检查)
    pub fn has_unknown(&self) -> bool {
        self.values().any(|v| match v {
            Value::Unknown(_) => true,
            Value::Document(d) | Value::Array(d) => d.has_unknown(),
            Value::CodeWithScope(c) => c.scope.has_unknown(),
            _ => false,
        })
    }

    /// 编码为 BSON
    pub fn encode(&self) -> MongoResult<RawDocument> {
        codec::encode_document(self)
    }

    /// 转换为宽松扩展 JSON
    pub fn to_relaxed_json(&self) -> serde_json::Value {
        crate::json::document_to_json(self)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_relaxed_json())
    }
}

impl<K: Into<CompactString>, V: Into<Value>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl IntoIterator for Document {
    type Item = (CompactString, Value);
    type IntoIter = std::vec::IntoIter<(CompactString, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// 已完成编码的 BSON 文档
///
/// 内部是引用计数的不可变缓冲区，克隆只增加引用计数；
/// 最后一个持有者释放时缓冲区随之释放。长度前缀始终等于实际字节数。
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RawDocument {
    bytes: Bytes,
}

impl RawDocument {
    /// 空文档 `{}` 的编码
    pub fn empty() -> Self {
        Self {
            bytes: Bytes::from_static(&[5, 0, 0, 0, 0]),
        }
    }

    /// 校验外层框架后包装字节
    ///
    /// # Brief
    /// 检查长度前缀与实际长度一致且以 NUL 结尾；不解析元素内容
    ///
    /// # Arguments
    /// * `bytes` - 完整的 BSON 文档字节
    ///
    /// # Returns
    /// 成功返回 RawDocument，框架错误返回 Decode 错误
    pub fn from_bytes(bytes: impl Into<Bytes>) -> MongoResult<Self> {
        let bytes = bytes.into();
        let declared = codec::read_length_prefix(&bytes, 0)?;
        if declared != bytes.len() {
            return Err(MongoError::decode(
                0,
                format!(
                    "declared length {} does not match buffer length {}",
                    declared,
                    bytes.len()
                ),
            ));
        }
        if bytes[bytes.len() - 1] != 0 {
            return Err(MongoError::decode(
                bytes.len() - 1,
                "document is not NUL terminated",
            ));
        }
        Ok(Self { bytes })
    }

    /// 由编码器产出的缓冲区构造，调用方保证框架合法
    pub(crate) fn from_encoded(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= crate::spec::MIN_DOCUMENT_SIZE
    }

    /// 解码为 Document，未知类型以占位值保留
    pub fn decode(&self) -> MongoResult<Document> {
        codec::decode_document(&self.bytes)
    }

    /// 解码为 Document，遇到未知类型标记即报错
    pub fn decode_strict(&self) -> MongoResult<Document> {
        codec::decode_document_strict(&self.bytes, &CodecLimits::default())
    }
}

impl Default for RawDocument {
    fn default() -> Self {
        Self::empty()
    }
}

impl AsRef<[u8]> for RawDocument {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for RawDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(doc) => write!(f, "RawDocument({})", doc),
            Err(_) => write!(f, "RawDocument({} bytes)", self.bytes.len()),
        }
    }
}

impl TryFrom<&Document> for RawDocument {
    type Error = MongoError;

    fn try_from(doc: &Document) -> MongoResult<Self> {
        doc.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_fields_and_duplicates() {
        let mut doc = Document::new();
        doc.insert("b", 1);
        doc.insert("a", 2);
        doc.insert("b", 3);
        assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["b", "a", "b"]);
        assert_eq!(doc.get_i32("b"), Some(1));

        doc.set("b", 10);
        assert_eq!(doc.get_i32("b"), Some(10));
        assert_eq!(doc.len(), 3);

        assert_eq!(doc.remove("b"), Some(Value::Int32(10)));
        assert_eq!(doc.get_i32("b"), Some(3));
    }

    #[test]
    fn test_array_values() {
        let arr = Document::from_array_values(["a", "b"]);
        assert_eq!(arr.keys().collect::<Vec<_>>(), vec!["0", "1"]);
        let values: Vec<_> = arr.array_values().filter_map(|v| v.as_str()).collect();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[test]
    fn test_raw_document_framing() {
        assert!(RawDocument::empty().is_empty());
        assert!(RawDocument::from_bytes(vec![5u8, 0, 0, 0, 0]).is_ok());
        assert!(RawDocument::from_bytes(vec![6u8, 0, 0, 0, 0]).is_err());
        assert!(RawDocument::from_bytes(vec![5u8, 0, 0, 0, 1]).is_err());
        assert!(RawDocument::from_bytes(Vec::<u8>::new()).is_err());
    }

    #[test]
    fn test_has_unknown() {
        let mut inner = Document::new();
        inner.insert("x", Value::Unknown(0x13));
        let mut doc = Document::new();
        doc.insert("a", 1);
        assert!(!doc.has_unknown());
        doc.insert("nested", inner);
        assert!(doc.has_unknown());
    }
}
