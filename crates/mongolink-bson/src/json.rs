//! 扩展 JSON 模块
//!
//! 在 BSON 值与宽松格式 (relaxed) 扩展 JSON 之间转换。用于诊断打印与 `Display`。
//! JSON 无法直接表示的类型使用 `$` 包装对象:
//! - ObjectId: `{"$oid": "507f1f77bcf86cd799439011"}`
//! - DateTime: `{"$date": "2024-01-01T00:00:00.000Z"}`，超出 1970..=9999 年时为 `{"$date": {"$numberLong": "..."}}`
//! - Binary: `{"$binary": {"base64": "...", "subType": "00"}}`
//! - Regex: `{"$regularExpression": {"pattern": "...", "options": "..."}}`
//! - Timestamp: `{"$timestamp": {"t": 1, "i": 2}}`

use crate::document::Document;
use crate::spec::BinarySubtype;
use crate::value::{Binary, CodeWithScope, Regex, Timestamp, Value};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Datelike, SecondsFormat, TimeZone, Utc};
use mongolink_common::{MongoError, MongoResult, ObjectId};
use serde_json::{json, Map, Number, Value as JsonValue};

/// 文档转为宽松扩展 JSON 对象，字段顺序不变
pub fn document_to_json(doc: &Document) -> JsonValue {
    let mut obj = Map::new();
    for (key, value) in doc.iter() {
        obj.insert(key.to_string(), to_json(value));
    }
    JsonValue::Object(obj)
}

/// 将 BSON 值转换为扩展 JSON
pub fn to_json(value: &Value) -> JsonValue {
    match value {
        Value::Double(f) => match Number::from_f64(*f) {
            Some(n) => JsonValue::Number(n),
            None => {
                let text = if f.is_nan() {
                    "NaN"
                } else if *f > 0.0 {
                    "Infinity"
                } else {
                    "-Infinity"
                };
                json!({"$numberDouble": text})
            }
        },
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Document(doc) => document_to_json(doc),
        Value::Array(doc) => JsonValue::Array(doc.values().map(to_json).collect()),
        Value::Binary(bin) => json!({
            "$binary": {
                "base64": STANDARD.encode(&bin.bytes),
                "subType": format!("{:02x}", u8::from(bin.subtype)),
            }
        }),
        Value::Undefined => json!({"$undefined": true}),
        Value::ObjectId(oid) => json!({"$oid": oid.to_hex()}),
        Value::Boolean(b) => JsonValue::Bool(*b),
        Value::DateTime(millis) => date_to_json(*millis),
        Value::Null => JsonValue::Null,
        Value::Regex(re) => json!({
            "$regularExpression": {"pattern": re.pattern, "options": re.options}
        }),
        Value::Code(code) => json!({"$code": code}),
        Value::Symbol(s) => json!({"$symbol": s}),
        Value::CodeWithScope(cws) => json!({
            "$code": cws.code,
            "$scope": document_to_json(&cws.scope),
        }),
        Value::Int32(n) => json!(*n),
        Value::Timestamp(ts) => json!({"$timestamp": {"t": ts.time, "i": ts.increment}}),
        Value::Int64(n) => json!(*n),
        Value::Unknown(tag) => json!({"$unknown": format!("0x{:02x}", tag)}),
    }
}

fn date_to_json(millis: i64) -> JsonValue {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(dt) if (1970..=9999).contains(&dt.year()) => {
            json!({"$date": dt.to_rfc3339_opts(SecondsFormat::Millis, true)})
        }
        _ => json!({"$date": {"$numberLong": millis.to_string()}}),
    }
}

/// 从扩展 JSON 对象解析文档
///
/// # Brief
/// 识别宽松与规范两种格式的 `$` 包装对象；整数优先解析为 int32
///
/// # Arguments
/// * `json` - 顶层必须是 JSON 对象
///
/// # Returns
/// 成功返回 Document，格式不符返回 Validation 错误
pub fn document_from_json(json: &JsonValue) -> MongoResult<Document> {
    match json {
        JsonValue::Object(obj) => object_to_document(obj),
        other => Err(MongoError::Validation(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

fn object_to_document(obj: &Map<String, JsonValue>) -> MongoResult<Document> {
    let mut doc = Document::with_capacity(obj.len());
    for (key, value) in obj {
        doc.insert(key.as_str(), from_json(value)?);
    }
    Ok(doc)
}

/// 从扩展 JSON 转换为 BSON 值
pub fn from_json(json: &JsonValue) -> MongoResult<Value> {
    let value = match json {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Boolean(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                match i32::try_from(i) {
                    Ok(small) => Value::Int32(small),
                    Err(_) => Value::Int64(i),
                }
            } else {
                Value::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(s) => Value::String(s.clone()),
        JsonValue::Array(items) => Value::Array(Document::from_array_values(
            items.iter().map(from_json).collect::<MongoResult<Vec<_>>>()?,
        )),
        JsonValue::Object(obj) => match extended_value(obj)? {
            Some(value) => value,
            None => Value::Document(object_to_document(obj)?),
        },
    };
    Ok(value)
}

fn invalid(what: &str, json: &JsonValue) -> MongoError {
    MongoError::Validation(format!("invalid {} in extended JSON: {}", what, json))
}

/// 识别 `$` 包装对象，普通对象返回 None
fn extended_value(obj: &Map<String, JsonValue>) -> MongoResult<Option<Value>> {
    let Some((first, inner)) = obj.iter().next() else {
        return Ok(None);
    };
    if !first.starts_with('$') {
        return Ok(None);
    }

    let value = match (first.as_str(), obj.len()) {
        ("$oid", 1) => {
            let hex = inner.as_str().ok_or_else(|| invalid("$oid", inner))?;
            Value::ObjectId(ObjectId::from_hex(hex)?)
        }
        ("$date", 1) => Value::DateTime(parse_date(inner)?),
        ("$numberLong", 1) => {
            let text = inner.as_str().ok_or_else(|| invalid("$numberLong", inner))?;
            Value::Int64(text.parse().map_err(|_| invalid("$numberLong", inner))?)
        }
        ("$numberInt", 1) => {
            let text = inner.as_str().ok_or_else(|| invalid("$numberInt", inner))?;
            Value::Int32(text.parse().map_err(|_| invalid("$numberInt", inner))?)
        }
        ("$numberDouble", 1) => {
            let text = inner.as_str().ok_or_else(|| invalid("$numberDouble", inner))?;
            let f = match text {
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                "NaN" => f64::NAN,
                other => other.parse().map_err(|_| invalid("$numberDouble", inner))?,
            };
            Value::Double(f)
        }
        ("$binary", 1) => {
            let b64 = inner
                .get("base64")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid("$binary", inner))?;
            let subtype = inner
                .get("subType")
                .and_then(JsonValue::as_str)
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| invalid("$binary", inner))?;
            let bytes = STANDARD
                .decode(b64)
                .map_err(|e| MongoError::Validation(format!("invalid base64 in $binary: {}", e)))?;
            Value::Binary(Binary::new(BinarySubtype::from(subtype), bytes))
        }
        ("$undefined", 1) => Value::Undefined,
        ("$regularExpression", 1) => {
            let pattern = inner.get("pattern").and_then(JsonValue::as_str);
            let options = inner.get("options").and_then(JsonValue::as_str);
            match (pattern, options) {
                (Some(p), Some(o)) => Value::Regex(Regex::new(p, o)),
                _ => return Err(invalid("$regularExpression", inner)),
            }
        }
        ("$symbol", 1) => Value::Symbol(
            inner.as_str().ok_or_else(|| invalid("$symbol", inner))?.to_string(),
        ),
        ("$code", 1) => Value::Code(inner.as_str().ok_or_else(|| invalid("$code", inner))?.to_string()),
        ("$code", 2) => {
            let code = inner.as_str().ok_or_else(|| invalid("$code", inner))?;
            let scope = obj.get("$scope").ok_or_else(|| invalid("$scope", inner))?;
            Value::CodeWithScope(CodeWithScope {
                code: code.to_string(),
                scope: document_from_json(scope)?,
            })
        }
        ("$timestamp", 1) => {
            let t = inner.get("t").and_then(JsonValue::as_u64);
            let i = inner.get("i").and_then(JsonValue::as_u64);
            match (t, i) {
                (Some(t), Some(i)) if t <= u32::MAX as u64 && i <= u32::MAX as u64 => {
                    Value::Timestamp(Timestamp::new(t as u32, i as u32))
                }
                _ => return Err(invalid("$timestamp", inner)),
            }
        }
        // 查询操作符等普通的 `$` 键
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn parse_date(inner: &JsonValue) -> MongoResult<i64> {
    match inner {
        JsonValue::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| MongoError::Validation(format!("invalid $date '{}': {}", s, e))),
        JsonValue::Number(n) => n.as_i64().ok_or_else(|| invalid("$date", inner)),
        JsonValue::Object(obj) => obj
            .get("$numberLong")
            .and_then(JsonValue::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| invalid("$date", inner)),
        _ => Err(invalid("$date", inner)),
    }
}
