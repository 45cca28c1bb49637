//! BSON 编解码模块
//!
//! 提供 BSON 文档与二进制缓冲区之间的相互转换。
//!
//! 编码: 写入 4 字节长度占位 → 逐个写入 (类型标记, NUL 结尾键, 负载) → 写入终止符 → 回填长度。
//! 解码: 读取长度前缀 → 循环读取类型标记直到终止符，子文档与数组在各自的长度区间内递归。
//! 所有读取都以当前文档的声明区间为界，越界即报 Decode 错误，不返回部分结果。

use crate::document::{Document, RawDocument};
use crate::spec::{BinarySubtype, ElementType, MIN_DOCUMENT_SIZE};
use crate::value::{Binary, CodeWithScope, Regex, Timestamp, Value};
use bytes::{BufMut, Bytes, BytesMut};
use compact_str::CompactString;
use mongolink_common::{CodecLimits, FieldNameFault, MongoError, MongoResult, ObjectId};
use tracing::trace;

/// 编码文档
///
/// # Brief
/// 使用默认限制将 Document 编码为 RawDocument
///
/// # Arguments
/// * `doc` - 要编码的文档
///
/// # Returns
/// 成功返回编码后的文档, 失败返回错误
pub fn encode_document(doc: &Document) -> MongoResult<RawDocument> {
    encode_document_with_limits(doc, &CodecLimits::default())
}

/// 按指定限制编码文档
pub fn encode_document_with_limits(doc: &Document, limits: &CodecLimits) -> MongoResult<RawDocument> {
    let mut buf = BytesMut::with_capacity(64);
    Encoder::new(&mut buf, limits).write_document(doc)?;
    if buf.len() > limits.max_document_size {
        return Err(MongoError::Validation(format!(
            "Document too large: {} > {} bytes",
            buf.len(),
            limits.max_document_size
        )));
    }
    Ok(RawDocument::from_encoded(buf.freeze()))
}

/// 编码文档到 Vec<u8>
pub fn encode_to_vec(doc: &Document) -> MongoResult<Vec<u8>> {
    Ok(encode_document(doc)?.as_bytes().to_vec())
}

/// 解码文档
///
/// # Brief
/// 使用默认限制解码 BSON 缓冲区。空缓冲区解码为空文档。
/// 遇到未知类型标记时以 `Value::Unknown` 占位并停止解析。
///
/// # Arguments
/// * `data` - 要解码的字节切片
///
/// # Returns
/// 成功返回 Document, 格式错误返回 Decode 错误
pub fn decode_document(data: &[u8]) -> MongoResult<Document> {
    decode_document_with_limits(data, &CodecLimits::default())
}

/// 按指定限制解码文档
pub fn decode_document_with_limits(data: &[u8], limits: &CodecLimits) -> MongoResult<Document> {
    Ok(decode_inner(data, limits)?.0)
}

/// 严格解码: 未知类型标记视为 Decode 错误
pub fn decode_document_strict(data: &[u8], limits: &CodecLimits) -> MongoResult<Document> {
    let (doc, unknown) = decode_inner(data, limits)?;
    match unknown {
        Some((offset, tag)) => Err(MongoError::decode(
            offset,
            format!("unknown element type 0x{:02x}", tag),
        )),
        None => Ok(doc),
    }
}

fn decode_inner(data: &[u8], limits: &CodecLimits) -> MongoResult<(Document, Option<(usize, u8)>)> {
    if data.is_empty() {
        return Ok((Document::new(), None));
    }
    if data.len() > limits.max_document_size {
        return Err(MongoError::decode(
            0,
            format!(
                "buffer of {} bytes exceeds maximum document size {}",
                data.len(),
                limits.max_document_size
            ),
        ));
    }

    let mut decoder = Decoder::new(data, limits);
    let doc = decoder.read_document(data.len()).map_err(|e| {
        trace!(error = %e, len = data.len(), "rejected BSON input");
        e
    })?;
    if decoder.unknown.is_none() && decoder.pos != data.len() {
        return Err(MongoError::decode(
            decoder.pos,
            format!("{} trailing bytes after document", data.len() - decoder.pos),
        ));
    }
    Ok((doc, decoder.unknown))
}

/// 读取并校验 `offset` 处的长度前缀
///
/// 长度至少为 5，且不能超出缓冲区剩余字节。
pub(crate) fn read_length_prefix(data: &[u8], offset: usize) -> MongoResult<usize> {
    let end = offset
        .checked_add(4)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| MongoError::decode(offset, "truncated length prefix"))?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[offset..end]);
    let declared = i32::from_le_bytes(raw);
    if declared < MIN_DOCUMENT_SIZE as i32 {
        return Err(MongoError::decode(
            offset,
            format!("invalid document length {}", declared),
        ));
    }
    let declared = declared as usize;
    if declared > data.len() - offset {
        return Err(MongoError::decode(
            offset,
            format!(
                "declared length {} exceeds remaining {} bytes",
                declared,
                data.len() - offset
            ),
        ));
    }
    Ok(declared)
}

/// 连续文档序列
///
/// 查询回复的一个批次由若干首尾相接的 BSON 文档组成，逐个切出 RawDocument。
/// 遇到框架错误时返回一次错误然后结束。
pub struct DocumentSequence {
    buf: Bytes,
    pos: usize,
}

impl DocumentSequence {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    /// 尚未消费的字节数
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

impl Iterator for DocumentSequence {
    type Item = MongoResult<RawDocument>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let start = self.pos;
        let len = match read_length_prefix(&self.buf, start) {
            Ok(len) => len,
            Err(e) => {
                self.pos = self.buf.len();
                return Some(Err(e));
            }
        };
        if self.buf[start + len - 1] != 0 {
            self.pos = self.buf.len();
            return Some(Err(MongoError::decode(
                start + len - 1,
                "document is not NUL terminated",
            )));
        }
        self.pos = start + len;
        Some(Ok(RawDocument::from_encoded(self.buf.slice(start..start + len))))
    }
}

/// BSON 编码器
///
/// 构建器与文档编码共用同一套元素写入逻辑。
pub(crate) struct Encoder<'a> {
    buf: &'a mut BytesMut,
    limits: &'a CodecLimits,
    depth: usize,
}

impl<'a> Encoder<'a> {
    pub(crate) fn new(buf: &'a mut BytesMut, limits: &'a CodecLimits) -> Self {
        Self::with_depth(buf, limits, 0)
    }

    /// 从指定嵌套深度开始写入 (构建器在打开的子文档内追加时使用)
    pub(crate) fn with_depth(buf: &'a mut BytesMut, limits: &'a CodecLimits, depth: usize) -> Self {
        Self { buf, limits, depth }
    }

    pub(crate) fn write_document(&mut self, doc: &Document) -> MongoResult<()> {
        self.depth += 1;
        if self.depth > self.limits.max_nesting_depth {
            return Err(MongoError::Validation(format!(
                "Nesting too deep: max {}",
                self.limits.max_nesting_depth
            )));
        }
        let start = self.buf.len();
        self.buf.put_i32_le(0);
        for (key, value) in doc.iter() {
            self.write_element(key, value)?;
        }
        self.buf.put_u8(0);
        patch_length(self.buf, start)?;
        self.depth -= 1;
        Ok(())
    }

    pub(crate) fn write_element(&mut self, key: &str, value: &Value) -> MongoResult<()> {
        let tag = value.element_type().ok_or_else(|| {
            MongoError::Validation(format!(
                "Cannot encode unknown element type 0x{:02x} for field '{}'",
                value.tag(),
                key
            ))
        })?;
        if key.as_bytes().contains(&0) {
            return Err(MongoError::InvalidFieldName {
                field: key.to_string(),
                reason: FieldNameFault::ContainsNul,
            });
        }
        self.buf.put_u8(tag as u8);
        write_cstring_unchecked(self.buf, key);
        self.write_payload(value)
    }

    fn write_payload(&mut self, value: &Value) -> MongoResult<()> {
        match value {
            Value::Double(n) => self.buf.put_f64_le(*n),
            Value::String(s) | Value::Code(s) | Value::Symbol(s) => write_string(self.buf, s)?,
            Value::Document(doc) | Value::Array(doc) => self.write_document(doc)?,
            Value::Binary(bin) => write_binary(self.buf, bin)?,
            Value::Undefined | Value::Null => {}
            Value::ObjectId(id) => self.buf.put_slice(id.as_bytes()),
            Value::Boolean(b) => self.buf.put_u8(*b as u8),
            Value::DateTime(millis) => self.buf.put_i64_le(*millis),
            Value::Regex(re) => {
                write_cstring(self.buf, &re.pattern)?;
                write_cstring(self.buf, &re.options)?;
            }
            Value::CodeWithScope(cws) => {
                let start = self.buf.len();
                self.buf.put_i32_le(0);
                write_string(self.buf, &cws.code)?;
                self.write_document(&cws.scope)?;
                patch_length(self.buf, start)?;
            }
            Value::Int32(n) => self.buf.put_i32_le(*n),
            Value::Timestamp(ts) => self.buf.put_u64_le(ts.to_u64()),
            Value::Int64(n) => self.buf.put_i64_le(*n),
            Value::Unknown(tag) => {
                return Err(MongoError::Validation(format!(
                    "Cannot encode unknown element type 0x{:02x}",
                    tag
                )))
            }
        }
        Ok(())
    }
}

/// 回填 `start` 处的长度前缀为 `start` 到缓冲区末尾的字节数
pub(crate) fn patch_length(buf: &mut BytesMut, start: usize) -> MongoResult<()> {
    let len = i32::try_from(buf.len() - start)
        .map_err(|_| MongoError::Validation("Document exceeds i32 length range".to_string()))?;
    buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
    Ok(())
}

pub(crate) fn write_cstring(buf: &mut BytesMut, s: &str) -> MongoResult<()> {
    if s.as_bytes().contains(&0) {
        return Err(MongoError::Validation(format!(
            "C string cannot contain NUL: {:?}",
            s
        )));
    }
    write_cstring_unchecked(buf, s);
    Ok(())
}

fn write_cstring_unchecked(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

pub(crate) fn write_string(buf: &mut BytesMut, s: &str) -> MongoResult<()> {
    let len = i32::try_from(s.len() + 1)
        .map_err(|_| MongoError::Validation("String exceeds i32 length range".to_string()))?;
    buf.put_i32_le(len);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

pub(crate) fn write_binary(buf: &mut BytesMut, bin: &Binary) -> MongoResult<()> {
    let extra = if bin.subtype == BinarySubtype::BinaryOld { 4 } else { 0 };
    let len = i32::try_from(bin.bytes.len() + extra)
        .map_err(|_| MongoError::Validation("Binary exceeds i32 length range".to_string()))?;
    buf.put_i32_le(len);
    buf.put_u8(bin.subtype.into());
    if extra > 0 {
        buf.put_i32_le(len - 4);
    }
    buf.put_slice(&bin.bytes);
    Ok(())
}

/// BSON 解码器
///
/// `unknown` 记录遇到的第一个未知类型标记的位置，此后整份文档停止解析。
struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
    limits: &'a CodecLimits,
    unknown: Option<(usize, u8)>,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8], limits: &'a CodecLimits) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
            limits,
            unknown: None,
        }
    }

    /// 读取当前位置的文档，文档必须完整落在 `limit` 之内
    fn read_document(&mut self, limit: usize) -> MongoResult<Document> {
        let start = self.pos;
        let len = read_length_prefix(&self.data[..limit], start)?;
        let end = start + len;

        self.depth += 1;
        if self.depth > self.limits.max_nesting_depth {
            return Err(MongoError::decode(
                start,
                format!("nesting too deep: max {}", self.limits.max_nesting_depth),
            ));
        }
        self.pos += 4;

        let mut doc = Document::new();
        loop {
            let tag_offset = self.pos;
            let tag = self.read_u8(end)?;
            if tag == 0 {
                if self.pos != end {
                    return Err(MongoError::decode(
                        tag_offset,
                        format!("terminator found {} bytes before declared end", end - self.pos),
                    ));
                }
                break;
            }
            let key = self.read_cstring(end)?;
            let Some(element_type) = ElementType::from_u8(tag) else {
                doc.insert(key, Value::Unknown(tag));
                self.unknown = Some((tag_offset, tag));
                return Ok(doc);
            };
            let value = self.read_value(element_type, end)?;
            doc.insert(key, value);
            if self.unknown.is_some() {
                return Ok(doc);
            }
        }
        self.depth -= 1;
        Ok(doc)
    }

    fn read_value(&mut self, element_type: ElementType, end: usize) -> MongoResult<Value> {
        let value = match element_type {
            ElementType::Double => Value::Double(f64::from_le_bytes(self.read_array(end)?)),
            ElementType::String => Value::String(self.read_string(end)?),
            ElementType::Document => Value::Document(self.read_document(end)?),
            ElementType::Array => Value::Array(self.read_document(end)?),
            ElementType::Binary => Value::Binary(self.read_binary(end)?),
            ElementType::Undefined => Value::Undefined,
            ElementType::ObjectId => Value::ObjectId(ObjectId::from_bytes(self.read_array(end)?)),
            ElementType::Boolean => {
                let offset = self.pos;
                match self.read_u8(end)? {
                    0 => Value::Boolean(false),
                    1 => Value::Boolean(true),
                    b => {
                        return Err(MongoError::decode(
                            offset,
                            format!("invalid boolean byte 0x{:02x}", b),
                        ))
                    }
                }
            }
            ElementType::DateTime => Value::DateTime(i64::from_le_bytes(self.read_array(end)?)),
            ElementType::Null => Value::Null,
            ElementType::RegularExpression => {
                let pattern = self.read_cstring(end)?.to_string();
                let options = self.read_cstring(end)?.to_string();
                Value::Regex(Regex { pattern, options })
            }
            ElementType::JavaScriptCode => Value::Code(self.read_string(end)?),
            ElementType::Symbol => Value::Symbol(self.read_string(end)?),
            ElementType::JavaScriptCodeWithScope => Value::CodeWithScope(self.read_code_with_scope(end)?),
            ElementType::Int32 => Value::Int32(i32::from_le_bytes(self.read_array(end)?)),
            ElementType::Timestamp => {
                Value::Timestamp(Timestamp::from_u64(u64::from_le_bytes(self.read_array(end)?)))
            }
            ElementType::Int64 => Value::Int64(i64::from_le_bytes(self.read_array(end)?)),
        };
        Ok(value)
    }

    fn read_binary(&mut self, end: usize) -> MongoResult<Binary> {
        let offset = self.pos;
        let len = self.read_i32(end)?;
        if len < 0 {
            return Err(MongoError::decode(offset, format!("negative binary length {}", len)));
        }
        let subtype = BinarySubtype::from(self.read_u8(end)?);
        let mut len = len as usize;
        if subtype == BinarySubtype::BinaryOld {
            let inner_offset = self.pos;
            let inner = self.read_i32(end)?;
            if inner < 0 || inner as usize + 4 != len {
                return Err(MongoError::decode(
                    inner_offset,
                    format!("old binary inner length {} does not match outer {}", inner, len),
                ));
            }
            len = inner as usize;
        }
        let bytes = self.take(len, end)?.to_vec();
        Ok(Binary { subtype, bytes })
    }

    fn read_code_with_scope(&mut self, end: usize) -> MongoResult<CodeWithScope> {
        let start = self.pos;
        let total = self.read_i32(end)?;
        // 4 字节总长 + 最短字符串 5 字节 + 最短文档 5 字节
        if total < 14 || start + total as usize > end {
            return Err(MongoError::decode(
                start,
                format!("invalid code-with-scope length {}", total),
            ));
        }
        let scope_end = start + total as usize;
        let code = self.read_string(scope_end)?;
        let scope = self.read_document(scope_end)?;
        if self.unknown.is_none() && self.pos != scope_end {
            return Err(MongoError::decode(
                self.pos,
                "code-with-scope length does not match its contents",
            ));
        }
        Ok(CodeWithScope { code, scope })
    }

    fn read_string(&mut self, end: usize) -> MongoResult<String> {
        let offset = self.pos;
        let len = self.read_i32(end)?;
        if len < 1 {
            return Err(MongoError::decode(offset, format!("invalid string length {}", len)));
        }
        let bytes = self.take(len as usize, end)?;
        let (body, terminator) = bytes.split_at(bytes.len() - 1);
        if terminator[0] != 0 {
            return Err(MongoError::decode(
                offset,
                "string is not NUL terminated",
            ));
        }
        std::str::from_utf8(body)
            .map(str::to_string)
            .map_err(|e| MongoError::decode(offset + 4, format!("invalid UTF-8 in string: {}", e)))
    }

    fn read_cstring(&mut self, end: usize) -> MongoResult<CompactString> {
        let offset = self.pos;
        let window = &self.data[self.pos..end];
        let nul = window
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| MongoError::decode(offset, "unterminated C string"))?;
        let s = std::str::from_utf8(&window[..nul])
            .map_err(|e| MongoError::decode(offset, format!("invalid UTF-8 in key: {}", e)))?;
        self.pos += nul + 1;
        Ok(CompactString::from(s))
    }

    fn read_u8(&mut self, end: usize) -> MongoResult<u8> {
        Ok(self.take(1, end)?[0])
    }

    fn read_i32(&mut self, end: usize) -> MongoResult<i32> {
        Ok(i32::from_le_bytes(self.read_array(end)?))
    }

    fn read_array<const N: usize>(&mut self, end: usize) -> MongoResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, end)?);
        Ok(out)
    }

    fn take(&mut self, len: usize, end: usize) -> MongoResult<&'a [u8]> {
        let stop = self
            .pos
            .checked_add(len)
            .filter(|stop| *stop <= end)
            .ok_or_else(|| {
                MongoError::decode(
                    self.pos,
                    format!("need {} bytes, have {}", len, end.saturating_sub(self.pos)),
                )
            })?;
        let data: &'a [u8] = self.data;
        let slice = &data[self.pos..stop];
        self.pos = stop;
        Ok(slice)
    }
}
