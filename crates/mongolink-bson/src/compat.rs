//! 与 `bson` crate 的互操作
//!
//! 两边都是标准 BSON，经由字节相互转换。

use crate::codec;
use crate::document::{Document, RawDocument};
use mongolink_common::{MongoError, MongoResult};

/// RawDocument 转为 `bson::Document`
pub fn to_bson_crate(raw: &RawDocument) -> MongoResult<bson::Document> {
    bson::Document::from_reader(raw.as_bytes())
        .map_err(|e| MongoError::decode(0, format!("bson crate rejected document: {}", e)))
}

/// `bson::Document` 转为 Document
pub fn from_bson_crate(doc: &bson::Document) -> MongoResult<Document> {
    let mut bytes = Vec::new();
    doc.to_writer(&mut bytes)
        .map_err(|e| MongoError::Validation(format!("bson crate failed to encode: {}", e)))?;
    codec::decode_document(&bytes)
}
