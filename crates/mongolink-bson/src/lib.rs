//! # mongolink-bson
//!
//! 标准 BSON 文档的编解码与构建:
//!
//! - **codec**: 长度前缀的递归编解码，畸形输入一律报 `Decode` 错误
//! - **builder**: 追加式构建器，带子文档/数组上下文栈与字段名校验
//! - **interop**: 解释器通用值 (`Cell`) 与文档之间的转换
//! - **json**: 宽松扩展 JSON，用于诊断输出
//! - **compat**: 与 `bson` crate 互转
//!
//! ## 快速开始
//!
//! ```rust,ignore
//! use mongolink_bson::{decode_document, DocumentBuilder};
//!
//! let mut b = DocumentBuilder::new();
//! b.append_str("name", "alice")?.append_i32("age", 30)?;
//! let raw = b.finish()?;
//!
//! let doc = decode_document(raw.as_bytes())?;
//! assert_eq!(doc.get_str("name"), Some("alice"));
//! ```

pub mod builder;
pub mod codec;
pub mod compat;
pub mod document;
pub mod interop;
pub mod json;
pub mod spec;
pub mod value;

pub use builder::{DocumentBuilder, KeyMode};
pub use codec::{
    decode_document, decode_document_strict, decode_document_with_limits, encode_document,
    encode_document_with_limits, encode_to_vec, DocumentSequence,
};
pub use document::{Document, RawDocument};
pub use interop::{build_from_fields, build_from_pairs, to_map, to_map_with_types, to_pair_list, Cell, TypeHint, TypedField};
pub use spec::{BinarySubtype, ElementType};
pub use value::{Binary, CodeWithScope, Regex, Timestamp, Value};
