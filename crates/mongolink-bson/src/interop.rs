//! 脚本层互操作模块
//!
//! 嵌入式解释器以通用单元格 (`Cell`) 传递字段值，本模块负责:
//! - 按类型提示把 (类型, 键, 值) 三元组构建为 BSON 文档
//! - 把解码后的文档还原为三元组列表或扁平的 键 → 值 映射
//!
//! `to_pair_list` 的输出交回 `build_from_fields` 可以重建出相同的文档。
//! 二进制字段的类型名带子类型 (如 `bin:md5`)。
//! 唯一的例外是未知类型的元素: 它没有可重建的内容，重建时返回错误。

use crate::builder::DocumentBuilder;
use crate::document::{Document, RawDocument};
use crate::spec::BinarySubtype;
use crate::value::{Timestamp, Value};
use indexmap::IndexMap;
use mongolink_common::{MongoError, MongoResult, ObjectId};
use std::str::FromStr;

/// 字段类型提示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeHint {
    String,
    Int,
    Long,
    Double,
    Bool,
    /// Unix 秒数
    Clock,
    /// UTC 毫秒数
    Date,
    Null,
    Undefined,
    Binary(BinarySubtype),
    Symbol,
    Code,
    /// 值为 [代码, 作用域字段列表]
    CodeWithScope,
    Oid,
    NewOid,
    Regex,
    Timestamp,
    Object,
    Array,
}

impl FromStr for TypeHint {
    type Err = MongoError;

    fn from_str(s: &str) -> MongoResult<Self> {
        let hint = match s {
            "string" => TypeHint::String,
            "int" => TypeHint::Int,
            "long" => TypeHint::Long,
            "double" => TypeHint::Double,
            "bool" | "boolean" => TypeHint::Bool,
            "clock" => TypeHint::Clock,
            "date" => TypeHint::Date,
            "null" => TypeHint::Null,
            "undefined" => TypeHint::Undefined,
            "bin" | "binary" => TypeHint::Binary(BinarySubtype::Generic),
            "symbol" => TypeHint::Symbol,
            "code" => TypeHint::Code,
            "codewscope" => TypeHint::CodeWithScope,
            "oid" => TypeHint::Oid,
            "new_oid" => TypeHint::NewOid,
            "regex" => TypeHint::Regex,
            "timestamp" => TypeHint::Timestamp,
            "object" => TypeHint::Object,
            "array" => TypeHint::Array,
            "unknown" => {
                return Err(MongoError::Validation(
                    "element of unknown type cannot be rebuilt".to_string(),
                ))
            }
            other => match other
                .strip_prefix("binary:")
                .or_else(|| other.strip_prefix("bin:"))
            {
                Some(subtype) => TypeHint::Binary(subtype.parse()?),
                None => {
                    return Err(MongoError::Validation(format!("Unknown type hint: {}", other)))
                }
            },
        };
        Ok(hint)
    }
}

/// 解释器传入/传出的通用值
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Str(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    List(Vec<Cell>),
    /// 子文档或数组，按三元组展开
    Fields(Vec<TypedField>),
}

impl Cell {
    fn kind(&self) -> &'static str {
        match self {
            Cell::Null => "null",
            Cell::Str(_) => "string",
            Cell::Int(_) => "int",
            Cell::Double(_) => "double",
            Cell::Bool(_) => "bool",
            Cell::Bytes(_) => "bytes",
            Cell::List(_) => "list",
            Cell::Fields(_) => "fields",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Int(n) => Some(*n),
            Cell::Bool(b) => Some(*b as i64),
            Cell::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Double(n) => Some(*n),
            Cell::Int(n) => Some(*n as f64),
            Cell::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Cell::Bool(b) => Some(*b),
            Cell::Int(n) => Some(*n != 0),
            Cell::Str(s) => match s.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Str(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Str(s)
    }
}

impl From<i64> for Cell {
    fn from(n: i64) -> Self {
        Cell::Int(n)
    }
}

impl From<i32> for Cell {
    fn from(n: i32) -> Self {
        Cell::Int(n as i64)
    }
}

impl From<f64> for Cell {
    fn from(n: f64) -> Self {
        Cell::Double(n)
    }
}

impl From<bool> for Cell {
    fn from(b: bool) -> Self {
        Cell::Bool(b)
    }
}

impl From<Vec<u8>> for Cell {
    fn from(bytes: Vec<u8>) -> Self {
        Cell::Bytes(bytes)
    }
}

/// 带类型名的字段
#[derive(Debug, Clone, PartialEq)]
pub struct TypedField {
    pub type_name: String,
    pub key: String,
    pub value: Cell,
}

impl TypedField {
    pub fn new(type_name: impl Into<String>, key: impl Into<String>, value: impl Into<Cell>) -> Self {
        Self {
            type_name: type_name.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

/// 由 (类型提示, 键, 值) 三元组构建文档
///
/// # Brief
/// 逐个按类型提示转换单元格并追加，字段名按严格模式校验
///
/// # Arguments
/// * `pairs` - 三元组列表
///
/// # Returns
/// 成功返回编码完成的文档；单元格类型与提示不符返回 Validation 错误
pub fn build_from_pairs<K: AsRef<str>>(pairs: &[(TypeHint, K, Cell)]) -> MongoResult<RawDocument> {
    let mut builder = DocumentBuilder::new();
    for (hint, key, cell) in pairs {
        append_cell(&mut builder, *hint, key.as_ref(), cell)?;
    }
    builder.finish()
}

/// 由 `to_pair_list` 形式的字段列表构建文档
pub fn build_from_fields(fields: &[TypedField]) -> MongoResult<RawDocument> {
    let mut builder = DocumentBuilder::new();
    append_fields(&mut builder, fields)?;
    builder.finish()
}

fn append_fields(builder: &mut DocumentBuilder, fields: &[TypedField]) -> MongoResult<()> {
    for field in fields {
        let hint: TypeHint = field.type_name.parse()?;
        append_cell(builder, hint, &field.key, &field.value)?;
    }
    Ok(())
}

fn mismatch(hint: TypeHint, key: &str, cell: &Cell) -> MongoError {
    MongoError::Validation(format!(
        "field '{}': cannot use {} value as {:?}",
        key,
        cell.kind(),
        hint
    ))
}

fn append_cell(builder: &mut DocumentBuilder, hint: TypeHint, key: &str, cell: &Cell) -> MongoResult<()> {
    let bad = || mismatch(hint, key, cell);
    match hint {
        TypeHint::String => match cell {
            Cell::Bytes(bytes) => builder.append_str_bytes(key, bytes)?,
            other => builder.append_str(key, other.as_text().ok_or_else(bad)?)?,
        },
        TypeHint::Int => {
            let n = cell.as_i64().ok_or_else(bad)?;
            let n = i32::try_from(n).map_err(|_| {
                MongoError::Validation(format!("field '{}': {} does not fit in int", key, n))
            })?;
            builder.append_i32(key, n)?
        }
        TypeHint::Long => builder.append_i64(key, cell.as_i64().ok_or_else(bad)?)?,
        TypeHint::Double => builder.append_double(key, cell.as_f64().ok_or_else(bad)?)?,
        TypeHint::Bool => builder.append_bool(key, cell.as_bool().ok_or_else(bad)?)?,
        TypeHint::Clock => builder.append_time_t(key, cell.as_i64().ok_or_else(bad)?)?,
        TypeHint::Date => builder.append_date_time(key, cell.as_i64().ok_or_else(bad)?)?,
        TypeHint::Null => builder.append_null(key)?,
        TypeHint::Undefined => builder.append_undefined(key)?,
        TypeHint::Binary(subtype) => match cell {
            Cell::Bytes(bytes) => builder.append_binary(key, subtype, bytes)?,
            Cell::Str(s) => builder.append_binary(key, subtype, s.as_bytes())?,
            _ => return Err(bad()),
        },
        TypeHint::Symbol => builder.append_symbol(key, cell.as_text().ok_or_else(bad)?)?,
        TypeHint::Code => builder.append_code(key, cell.as_text().ok_or_else(bad)?)?,
        TypeHint::CodeWithScope => match cell {
            Cell::List(parts) => match parts.as_slice() {
                [Cell::Str(code), Cell::Fields(scope)] => {
                    let scope = build_from_fields(scope)?.decode()?;
                    builder.append_code_with_scope(key, code, &scope)?
                }
                _ => return Err(bad()),
            },
            _ => return Err(bad()),
        },
        TypeHint::Oid => {
            let hex = cell.as_text().ok_or_else(bad)?;
            builder.append_object_id(key, ObjectId::from_hex(hex)?)?
        }
        TypeHint::NewOid => builder.append_new_oid(key)?,
        TypeHint::Regex => match cell {
            Cell::Str(pattern) => builder.append_regex(key, pattern, "")?,
            Cell::List(parts) => match parts.as_slice() {
                [Cell::Str(pattern), Cell::Str(options)] => {
                    builder.append_regex(key, pattern, options)?
                }
                _ => return Err(bad()),
            },
            _ => return Err(bad()),
        },
        TypeHint::Timestamp => {
            let ts = parse_timestamp(cell.as_text().ok_or_else(bad)?).ok_or_else(bad)?;
            builder.append_timestamp(key, ts)?
        }
        TypeHint::Object => {
            let Cell::Fields(fields) = cell else {
                return Err(bad());
            };
            builder.start_object(key)?;
            append_fields(builder, fields)?;
            builder.finish_object()?
        }
        TypeHint::Array => {
            builder.start_array(key)?;
            match cell {
                Cell::Fields(fields) => append_fields(builder, fields)?,
                Cell::List(items) => {
                    for item in items {
                        builder.push(cell_to_value(item)?)?;
                    }
                }
                _ => return Err(bad()),
            }
            builder.finish_array()?
        }
    };
    Ok(())
}

/// 无类型提示时按单元格自身的类型转换
fn cell_to_value(cell: &Cell) -> MongoResult<Value> {
    let value = match cell {
        Cell::Null => Value::Null,
        Cell::Str(s) => Value::String(s.clone()),
        Cell::Int(n) => match i32::try_from(*n) {
            Ok(n) => Value::Int32(n),
            Err(_) => Value::Int64(*n),
        },
        Cell::Double(n) => Value::Double(*n),
        Cell::Bool(b) => Value::Boolean(*b),
        Cell::Bytes(bytes) => Value::Binary(crate::value::Binary::new(BinarySubtype::Generic, bytes.as_slice())),
        Cell::List(items) => Value::Array(Document::from_array_values(
            items.iter().map(cell_to_value).collect::<MongoResult<Vec<_>>>()?,
        )),
        Cell::Fields(fields) => Value::Document(build_from_fields(fields)?.decode()?),
    };
    Ok(value)
}

/// 时间戳的文本形式 "increment:time"
fn parse_timestamp(s: &str) -> Option<Timestamp> {
    let (inc, time) = s.split_once(':')?;
    Some(Timestamp::new(time.trim().parse().ok()?, inc.trim().parse().ok()?))
}

fn value_to_cell(value: &Value) -> Cell {
    match value {
        Value::Double(n) => Cell::Double(*n),
        Value::String(s) | Value::Symbol(s) | Value::Code(s) => Cell::Str(s.clone()),
        Value::Document(doc) | Value::Array(doc) => Cell::Fields(to_pair_list(doc)),
        Value::Binary(bin) => Cell::Bytes(bin.bytes.clone()),
        Value::Undefined | Value::Null => Cell::Null,
        Value::ObjectId(oid) => Cell::Str(oid.to_hex()),
        Value::Boolean(b) => Cell::Bool(*b),
        Value::DateTime(millis) => Cell::Int(*millis),
        Value::Regex(re) => Cell::List(vec![
            Cell::Str(re.pattern.clone()),
            Cell::Str(re.options.clone()),
        ]),
        Value::CodeWithScope(cws) => Cell::List(vec![
            Cell::Str(cws.code.clone()),
            Cell::Fields(to_pair_list(&cws.scope)),
        ]),
        Value::Int32(n) => Cell::Int(*n as i64),
        Value::Timestamp(ts) => Cell::Str(format!("{}:{}", ts.increment, ts.time)),
        Value::Int64(n) => Cell::Int(*n),
        Value::Unknown(tag) => Cell::Int(*tag as i64),
    }
}

/// 字段的类型名，非通用子类型的二进制带上子类型
fn field_type_name(value: &Value) -> String {
    match value {
        Value::Binary(bin) if bin.subtype != BinarySubtype::Generic => {
            format!("bin:{}", bin.subtype)
        }
        other => other.type_name().to_string(),
    }
}

/// 文档转为 (类型, 键, 值) 列表，子文档与数组递归展开
pub fn to_pair_list(doc: &Document) -> Vec<TypedField> {
    doc.iter()
        .map(|(key, value)| TypedField {
            type_name: field_type_name(value),
            key: key.to_string(),
            value: value_to_cell(value),
        })
        .collect()
}

/// 文档转为 键 → 值 映射
///
/// 重复键保留最后一个值，位置取第一次出现处。
pub fn to_map(doc: &Document) -> IndexMap<String, Cell> {
    to_map_with_types(doc).0
}

/// 同 `to_map`，另外返回 键 → 类型名 映射
pub fn to_map_with_types(doc: &Document) -> (IndexMap<String, Cell>, IndexMap<String, &'static str>) {
    let mut values = IndexMap::with_capacity(doc.len());
    let mut types = IndexMap::with_capacity(doc.len());
    for (key, value) in doc.iter() {
        values.insert(key.to_string(), value_to_cell(value));
        types.insert(key.to_string(), value.type_name());
    }
    (values, types)
}
