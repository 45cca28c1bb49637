//! 公共类型定义模块
//!
//! 定义 mongolink 的核心标识类型:
//! - ObjectId: 12 字节唯一标识符(BSON ObjectId)
//! - Namespace: "database.collection" 形式的查询目标

use crate::error::{MongoError, MongoResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// ObjectId - 12 字节唯一标识符
///
/// 格式:
/// - 前 4 字节: 时间戳(秒,大端)
/// - 中 5 字节: 进程级随机值
/// - 后 3 字节: 递增计数器(大端)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self::from_parts(timestamp, next_counter())
    }

    fn from_parts(timestamp: u32, counter: u32) -> Self {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&timestamp.to_be_bytes());
        bytes[4..9].copy_from_slice(process_unique());
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> MongoResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| MongoError::Validation(format!("Invalid ObjectId hex: {}", e)))?;
        let arr: [u8; 12] = bytes
            .try_into()
            .map_err(|_| MongoError::Validation("ObjectId must be 12 bytes".to_string()))?;
        Ok(Self(arr))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = MongoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

fn next_counter() -> u32 {
    static COUNTER: OnceLock<AtomicU32> = OnceLock::new();
    let counter = COUNTER.get_or_init(|| {
        let seed: [u8; 4] = rand_bytes();
        AtomicU32::new(u32::from_le_bytes(seed) & 0x00ff_ffff)
    });
    counter.fetch_add(1, Ordering::SeqCst) & 0x00ff_ffff
}

fn process_unique() -> &'static [u8; 5] {
    static UNIQUE: OnceLock<[u8; 5]> = OnceLock::new();
    UNIQUE.get_or_init(rand_bytes)
}

fn rand_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    #[cfg(target_os = "linux")]
    {
        use std::fs::File;
        use std::io::Read;
        if let Ok(mut f) = File::open("/dev/urandom") {
            if f.read_exact(&mut bytes).is_ok() {
                return bytes;
            }
        }
    }
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let state = RandomState::new();
    for chunk in bytes.chunks_mut(8) {
        let mut hasher = state.build_hasher();
        hasher.write_u32(std::process::id());
        let hash = hasher.finish().to_le_bytes();
        let len = chunk.len();
        chunk.copy_from_slice(&hash[..len]);
    }
    bytes
}

/// 查询目标命名空间
///
/// 形如 `"database.collection"`，集合名本身可以再包含点号
/// (例如 `"db.system.indexes"`)，所以只在第一个点处切分。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> MongoResult<Self> {
        let database = database.into();
        let collection = collection.into();
        if database.is_empty() {
            return Err(MongoError::Validation(
                "Database name cannot be empty".to_string(),
            ));
        }
        if database.contains(['.', ' ', '/', '\\', '"', '$', '\0']) {
            return Err(MongoError::Validation(format!(
                "Invalid database name: {}",
                database
            )));
        }
        if collection.is_empty() {
            return Err(MongoError::Validation(
                "Collection name cannot be empty".to_string(),
            ));
        }
        if collection.contains('\0') {
            return Err(MongoError::Validation(
                "Collection name cannot contain null character".to_string(),
            ));
        }
        Ok(Self {
            database,
            collection,
        })
    }

    pub fn parse(ns: &str) -> MongoResult<Self> {
        let (database, collection) = ns.split_once('.').ok_or_else(|| {
            MongoError::Validation(format!("Namespace must be 'database.collection': {}", ns))
        })?;
        Self::new(database, collection)
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

impl FromStr for Namespace {
    type Err = MongoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
