//! BSON 线格式常量
//!
//! 元素类型标记与二进制子类型，取值与 BSON 规范逐位一致。

use mongolink_common::{MongoError, MongoResult};
use std::fmt;
use std::str::FromStr;

/// 最小合法文档: 4 字节长度 + 1 字节终止符
pub const MIN_DOCUMENT_SIZE: usize = 5;

/// 元素类型标记
///
/// 只列出本库可以编解码的类型；其余标记在解码时作为 `Value::Unknown` 上报。
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Double = 0x01,
    String = 0x02,
    Document = 0x03,
    Array = 0x04,
    Binary = 0x05,
    Undefined = 0x06,
    ObjectId = 0x07,
    Boolean = 0x08,
    DateTime = 0x09,
    Null = 0x0A,
    RegularExpression = 0x0B,
    JavaScriptCode = 0x0D,
    Symbol = 0x0E,
    JavaScriptCodeWithScope = 0x0F,
    Int32 = 0x10,
    Timestamp = 0x11,
    Int64 = 0x12,
}

impl ElementType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Double),
            0x02 => Some(Self::String),
            0x03 => Some(Self::Document),
            0x04 => Some(Self::Array),
            0x05 => Some(Self::Binary),
            0x06 => Some(Self::Undefined),
            0x07 => Some(Self::ObjectId),
            0x08 => Some(Self::Boolean),
            0x09 => Some(Self::DateTime),
            0x0A => Some(Self::Null),
            0x0B => Some(Self::RegularExpression),
            0x0D => Some(Self::JavaScriptCode),
            0x0E => Some(Self::Symbol),
            0x0F => Some(Self::JavaScriptCodeWithScope),
            0x10 => Some(Self::Int32),
            0x11 => Some(Self::Timestamp),
            0x12 => Some(Self::Int64),
            _ => None,
        }
    }
}

/// 二进制子类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinarySubtype {
    Generic,
    Function,
    /// 旧式二进制，负载前额外带一个 int32 长度
    BinaryOld,
    UuidOld,
    Uuid,
    Md5,
    UserDefined(u8),
    Reserved(u8),
}

impl From<u8> for BinarySubtype {
    fn from(byte: u8) -> Self {
        match byte {
            0x00 => BinarySubtype::Generic,
            0x01 => BinarySubtype::Function,
            0x02 => BinarySubtype::BinaryOld,
            0x03 => BinarySubtype::UuidOld,
            0x04 => BinarySubtype::Uuid,
            0x05 => BinarySubtype::Md5,
            b if b >= 0x80 => BinarySubtype::UserDefined(b),
            b => BinarySubtype::Reserved(b),
        }
    }
}

impl From<BinarySubtype> for u8 {
    fn from(subtype: BinarySubtype) -> u8 {
        match subtype {
            BinarySubtype::Generic => 0x00,
            BinarySubtype::Function => 0x01,
            BinarySubtype::BinaryOld => 0x02,
            BinarySubtype::UuidOld => 0x03,
            BinarySubtype::Uuid => 0x04,
            BinarySubtype::Md5 => 0x05,
            BinarySubtype::UserDefined(b) | BinarySubtype::Reserved(b) => b,
        }
    }
}

/// 子类型名；没有专名的子类型写成十六进制字节
impl fmt::Display for BinarySubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinarySubtype::Generic => f.write_str("generic"),
            BinarySubtype::Function => f.write_str("function"),
            BinarySubtype::BinaryOld => f.write_str("binary_old"),
            BinarySubtype::UuidOld => f.write_str("uuid_old"),
            BinarySubtype::Uuid => f.write_str("uuid"),
            BinarySubtype::Md5 => f.write_str("md5"),
            BinarySubtype::UserDefined(b) | BinarySubtype::Reserved(b) => write!(f, "0x{:02x}", b),
        }
    }
}

impl FromStr for BinarySubtype {
    type Err = MongoError;

    fn from_str(s: &str) -> MongoResult<Self> {
        match s {
            "generic" => Ok(BinarySubtype::Generic),
            "function" => Ok(BinarySubtype::Function),
            "binary_old" => Ok(BinarySubtype::BinaryOld),
            "uuid_old" => Ok(BinarySubtype::UuidOld),
            "uuid" => Ok(BinarySubtype::Uuid),
            "md5" => Ok(BinarySubtype::Md5),
            "user_defined" => Ok(BinarySubtype::UserDefined(0x80)),
            other => other
                .strip_prefix("0x")
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .map(BinarySubtype::from)
                .ok_or_else(|| {
                    MongoError::Validation(format!("Unknown binary subtype: {}", other))
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_type_tags() {
        for tag in 0u8..=0xff {
            if let Some(t) = ElementType::from_u8(tag) {
                assert_eq!(t as u8, tag);
            }
        }
        assert_eq!(ElementType::from_u8(0x0C), None);
        assert_eq!(ElementType::from_u8(0x13), None);
        assert_eq!(ElementType::from_u8(0x00), None);
    }

    #[test]
    fn test_binary_subtype_bytes() {
        for byte in [0x00u8, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x80, 0xff] {
            assert_eq!(u8::from(BinarySubtype::from(byte)), byte);
        }
        assert_eq!("md5".parse::<BinarySubtype>().unwrap(), BinarySubtype::Md5);
        assert!("bogus".parse::<BinarySubtype>().is_err());
        assert!("0x1ff".parse::<BinarySubtype>().is_err());
        for byte in [0x00u8, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x80, 0x85, 0xff] {
            let subtype = BinarySubtype::from(byte);
            assert_eq!(subtype.to_string().parse::<BinarySubtype>().unwrap(), subtype);
        }
        assert_eq!(BinarySubtype::UserDefined(0x85).to_string(), "0x85");
    }
}
