pub mod error;
pub mod types;
pub mod config;

pub use config::{ClientConfig, CodecLimits, LogConfig};
pub use error::{
    BsonStatus, ConnectionFault, CursorFault, ErrorKind, FieldNameFault, MongoError, MongoResult,
};
pub use types::*;
