//! 传输层接口
//!
//! 游标和连接只通过 `Transport` 与服务端交互，不关心底层是网络连接还是进程内存储。

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use mongolink_bson::RawDocument;
use mongolink_common::{ConnectionFault, MongoError, MongoResult, Namespace};
use std::future::Future;
use std::time::Duration;

bitflags! {
    /// 查询选项位，取值与 OP_QUERY 线协议一致
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueryFlags: u32 {
        const TAILABLE = 1 << 1;
        const SLAVE_OK = 1 << 2;
        const OPLOG_REPLAY = 1 << 3;
        const NO_CURSOR_TIMEOUT = 1 << 4;
        const AWAIT_DATA = 1 << 5;
        const EXHAUST = 1 << 6;
        const PARTIAL = 1 << 7;
    }
}

impl QueryFlags {
    /// 按名称解析单个选项
    pub fn from_name(name: &str) -> MongoResult<Self> {
        let flag = match name {
            "tailable" => QueryFlags::TAILABLE,
            "slave_ok" => QueryFlags::SLAVE_OK,
            "oplog_replay" => QueryFlags::OPLOG_REPLAY,
            "no_timeout" => QueryFlags::NO_CURSOR_TIMEOUT,
            "await_data" => QueryFlags::AWAIT_DATA,
            "exhaust" => QueryFlags::EXHAUST,
            "partial" => QueryFlags::PARTIAL,
            other => {
                return Err(MongoError::Validation(format!(
                    "Unknown cursor option: {}",
                    other
                )))
            }
        };
        Ok(flag)
    }

    /// 解析选项名列表并按位或合并
    pub fn from_names<I, S>(names: I) -> MongoResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .try_fold(QueryFlags::empty(), |acc, name| Ok(acc | Self::from_name(name.as_ref())?))
    }
}

/// 一次查询请求
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub namespace: Namespace,
    pub query: RawDocument,
    /// 投影文档，None 表示返回全部字段
    pub fields: Option<RawDocument>,
    pub skip: i32,
    /// 0 表示不限；负数表示只取一批，批大小为其绝对值
    pub limit: i32,
    /// 每批文档数，0 表示由服务端决定
    pub batch_size: i32,
    pub flags: QueryFlags,
}

impl QueryRequest {
    pub fn new(namespace: Namespace, query: RawDocument) -> Self {
        Self {
            namespace,
            query,
            fields: None,
            skip: 0,
            limit: 0,
            batch_size: 0,
            flags: QueryFlags::empty(),
        }
    }

    /// 本次请求第一批应返回的文档数，0 表示由服务端决定
    pub fn first_batch_size(&self) -> i32 {
        match (self.limit, self.batch_size) {
            (0, size) => size,
            (limit, _) if limit < 0 => limit.saturating_abs(),
            (limit, 0) => limit,
            (limit, size) => limit.min(size),
        }
    }
}

/// 服务端结果流的句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    pub id: u64,
    pub namespace: Namespace,
}

/// 传输层
///
/// `fetch_next` 返回的一批数据是首尾相接的若干 BSON 文档，`None` 表示结果已取完。
/// `release` 在游标析构时同步调用，只能尽力而为，不能阻塞。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 发送查询，返回结果流句柄
    async fn send_query(&self, request: QueryRequest) -> MongoResult<StreamHandle>;

    /// 取下一批结果
    async fn fetch_next(&self, handle: &StreamHandle) -> MongoResult<Option<Bytes>>;

    /// 释放服务端游标
    fn release(&self, handle: StreamHandle);

    /// 在指定数据库上执行命令
    async fn run_command(&self, db: &str, command: RawDocument) -> MongoResult<RawDocument>;

    /// 错误上下文里使用的连接描述
    fn describe(&self) -> String {
        "transport".to_string()
    }

    /// 断开连接，已打开的结果流随之失效
    async fn disconnect(&self) -> MongoResult<()> {
        Ok(())
    }

    /// 断开后重新建立连接
    async fn reconnect(&self) -> MongoResult<()> {
        Ok(())
    }
}

/// 在可选超时内等待传输层操作
pub(crate) async fn with_timeout<T, F>(
    timeout: Option<Duration>,
    transport: &dyn Transport,
    op: &str,
    fut: F,
) -> MongoResult<T>
where
    F: Future<Output = MongoResult<T>>,
{
    match timeout {
        None => fut.await,
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(MongoError::transport(
                transport.describe(),
                ConnectionFault::IoError,
                format!("{} timed out after {} ms", op, limit.as_millis()),
            )),
        },
    }
}
