//! 游标模块
//!
//! 查询结果的逐条迭代。状态机:
//!
//! ```text
//! Unstarted --advance--> Active --(结果取完)--> Exhausted
//!     |                    |
//!     +------(故障)--------+--------> Failed
//! ```
//!
//! 取完是正常结束，`advance()` 返回 `Ok(false)`；故障记录在游标上并作为 `Err` 返回，
//! 之后再调用 `advance()` 返回同一个错误。重试需要新建游标。

use crate::transport::{with_timeout, QueryFlags, QueryRequest, StreamHandle, Transport};
use futures::stream::{self, Stream};
use indexmap::IndexMap;
use mongolink_bson::{
    to_map, to_pair_list, Cell, Document, DocumentBuilder, DocumentSequence, RawDocument,
    TypedField,
};
use mongolink_common::{CodecLimits, CursorFault, MongoError, MongoResult, Namespace};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// 游标状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Unstarted,
    Active,
    Exhausted,
    Failed,
}

pub struct Cursor {
    transport: Arc<dyn Transport>,
    namespace: Namespace,
    query: RawDocument,
    fields: Option<RawDocument>,
    skip: i32,
    limit: i32,
    batch_size: i32,
    flags: QueryFlags,
    limits: CodecLimits,
    op_timeout: Option<Duration>,

    state: CursorState,
    handle: Option<StreamHandle>,
    batch: Option<DocumentSequence>,
    batches: u32,
    current: Option<(RawDocument, Document)>,
    returned: u64,
    last_error: Option<MongoError>,
}

impl Cursor {
    /// 创建未开始的游标，查询条件默认为空文档 (匹配全部)
    pub fn new(transport: Arc<dyn Transport>, namespace: Namespace) -> Self {
        Self {
            transport,
            namespace,
            query: RawDocument::empty(),
            fields: None,
            skip: 0,
            limit: 0,
            batch_size: 0,
            flags: QueryFlags::empty(),
            limits: CodecLimits::default(),
            op_timeout: None,
            state: CursorState::Unstarted,
            handle: None,
            batch: None,
            batches: 0,
            current: None,
            returned: 0,
            last_error: None,
        }
    }

    pub(crate) fn with_limits(mut self, limits: CodecLimits) -> Self {
        self.limits = limits;
        self
    }

    pub(crate) fn with_op_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn flags(&self) -> QueryFlags {
        self.flags
    }

    /// 已返回的文档数
    pub fn returned(&self) -> u64 {
        self.returned
    }

    /// 最近一次记录的故障
    pub fn last_error(&self) -> Option<&MongoError> {
        self.last_error.as_ref()
    }

    fn ensure_unstarted(&self, what: &str) -> MongoResult<()> {
        if self.state != CursorState::Unstarted {
            return Err(MongoError::InvalidState(format!(
                "cannot {} after the cursor has started",
                what
            )));
        }
        Ok(())
    }

    /// 设置查询条件
    pub fn set_query(&mut self, query: RawDocument) -> MongoResult<()> {
        self.ensure_unstarted("set query")?;
        self.query = query;
        Ok(())
    }

    /// 按 (字段名, 1/0) 列表设置投影
    ///
    /// # Brief
    /// 构建一个整数字段的投影文档，1 表示包含，0 表示排除
    ///
    /// # Arguments
    /// * `fields` - 字段名与包含/排除标志
    pub fn set_fields<K: AsRef<str>>(&mut self, fields: &[(K, i32)]) -> MongoResult<()> {
        self.ensure_unstarted("set fields")?;
        let mut builder = DocumentBuilder::query();
        for (name, want) in fields {
            builder.append_i32(name.as_ref(), *want)?;
        }
        self.fields = Some(builder.finish()?);
        Ok(())
    }

    /// 直接设置投影文档
    pub fn set_fields_document(&mut self, fields: RawDocument) -> MongoResult<()> {
        self.ensure_unstarted("set fields")?;
        self.fields = Some(fields);
        Ok(())
    }

    pub fn set_skip(&mut self, skip: i32) -> MongoResult<()> {
        self.ensure_unstarted("set skip")?;
        if skip < 0 {
            return Err(MongoError::Validation(format!("skip must be non-negative: {}", skip)));
        }
        self.skip = skip;
        Ok(())
    }

    /// 设置返回上限
    ///
    /// 0 表示不限；负数表示只取一批，最多返回其绝对值条。
    pub fn set_limit(&mut self, limit: i32) -> MongoResult<()> {
        self.ensure_unstarted("set limit")?;
        if limit == i32::MIN {
            return Err(MongoError::Validation("limit out of range".to_string()));
        }
        self.limit = limit;
        Ok(())
    }

    pub fn set_batch_size(&mut self, batch_size: i32) -> MongoResult<()> {
        self.ensure_unstarted("set batch size")?;
        if batch_size < 0 {
            return Err(MongoError::Validation(format!(
                "batch size must be non-negative: {}",
                batch_size
            )));
        }
        self.batch_size = batch_size;
        Ok(())
    }

    /// 追加查询选项，多次调用按位或累积
    pub fn set_flags(&mut self, flags: QueryFlags) -> MongoResult<()> {
        self.ensure_unstarted("set flags")?;
        self.flags |= flags;
        Ok(())
    }

    /// 清空已累积的查询选项
    pub fn clear_flags(&mut self) -> MongoResult<()> {
        self.ensure_unstarted("clear flags")?;
        self.flags = QueryFlags::empty();
        Ok(())
    }

    fn limit_reached(&self) -> bool {
        self.limit != 0 && self.returned >= self.limit.unsigned_abs() as u64
    }

    fn is_tailable(&self) -> bool {
        self.flags.contains(QueryFlags::TAILABLE)
    }

    /// 前进到下一条文档
    ///
    /// # Brief
    /// 第一次调用时发送查询。本批数据取完后向传输层请求下一批。
    ///
    /// # Returns
    /// `Ok(true)` 有新文档；`Ok(false)` 结果已取完 (可追加游标暂无新数据时也返回
    /// `Ok(false)` 但保持 Active)；`Err` 为记录在游标上的故障
    pub async fn advance(&mut self) -> MongoResult<bool> {
        match self.state {
            CursorState::Exhausted => return Ok(false),
            CursorState::Failed => {
                return Err(self
                    .last_error
                    .clone()
                    .unwrap_or(MongoError::Cursor(CursorFault::Invalid)))
            }
            CursorState::Unstarted => self.start().await?,
            CursorState::Active => {}
        }

        self.current = None;
        if self.limit_reached() {
            self.exhaust(true);
            return Ok(false);
        }

        loop {
            if let Some(batch) = self.batch.as_mut() {
                match batch.next() {
                    Some(Ok(raw)) => return self.accept(raw),
                    Some(Err(e)) => {
                        warn!(ns = %self.namespace, error = %e, "malformed reply batch");
                        return self.fail(MongoError::Cursor(CursorFault::BsonError));
                    }
                    None => self.batch = None,
                }
            }

            if self.limit < 0 && self.batches > 0 {
                self.exhaust(true);
                return Ok(false);
            }

            let Some(handle) = self.handle.clone() else {
                return self.fail(MongoError::Cursor(CursorFault::Invalid));
            };
            let transport = Arc::clone(&self.transport);
            let fetched = with_timeout(
                self.op_timeout,
                transport.as_ref(),
                "fetch_next",
                transport.fetch_next(&handle),
            )
            .await;

            match fetched {
                Ok(Some(bytes)) => {
                    self.batches += 1;
                    trace!(ns = %self.namespace, bytes = bytes.len(), batch = self.batches, "reply batch");
                    if bytes.is_empty() && self.is_tailable() {
                        return Ok(false);
                    }
                    self.batch = Some(DocumentSequence::new(bytes));
                }
                Ok(None) => {
                    self.exhaust(false);
                    return Ok(false);
                }
                Err(e) => return self.fail(e),
            }
        }
    }

    async fn start(&mut self) -> MongoResult<()> {
        let request = QueryRequest {
            namespace: self.namespace.clone(),
            query: self.query.clone(),
            fields: self.fields.clone(),
            skip: self.skip,
            limit: self.limit,
            batch_size: self.batch_size,
            flags: self.flags,
        };
        let transport = Arc::clone(&self.transport);
        let sent = with_timeout(
            self.op_timeout,
            transport.as_ref(),
            "send_query",
            transport.send_query(request),
        )
        .await;
        match sent {
            Ok(handle) => {
                debug!(ns = %self.namespace, stream = handle.id, flags = ?self.flags, "cursor started");
                self.handle = Some(handle);
                self.state = CursorState::Active;
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    fn accept(&mut self, raw: RawDocument) -> MongoResult<bool> {
        match mongolink_bson::decode_document_strict(raw.as_bytes(), &self.limits) {
            Ok(doc) => {
                self.current = Some((raw, doc));
                self.returned += 1;
                Ok(true)
            }
            Err(e) => {
                warn!(ns = %self.namespace, error = %e, "undecodable document in reply");
                self.fail(MongoError::Cursor(CursorFault::BsonError))
            }
        }
    }

    /// 进入 Exhausted；`release` 为 true 时服务端游标仍打开，需要释放
    fn exhaust(&mut self, release: bool) {
        debug!(ns = %self.namespace, returned = self.returned, "cursor exhausted");
        self.state = CursorState::Exhausted;
        self.batch = None;
        self.current = None;
        match self.handle.take() {
            Some(handle) if release => self.transport.release(handle),
            _ => {}
        }
    }

    fn fail<T>(&mut self, err: MongoError) -> MongoResult<T> {
        warn!(ns = %self.namespace, error = %err, "cursor failed");
        self.state = CursorState::Failed;
        self.last_error = Some(err.clone());
        self.batch = None;
        self.current = None;
        if let Some(handle) = self.handle.take() {
            self.transport.release(handle);
        }
        Err(err)
    }

    fn no_current(&self) -> MongoError {
        match self.state {
            CursorState::Exhausted => MongoError::Cursor(CursorFault::Exhausted),
            CursorState::Failed => self
                .last_error
                .clone()
                .unwrap_or(MongoError::Cursor(CursorFault::Invalid)),
            CursorState::Unstarted | CursorState::Active => {
                MongoError::InvalidState("no current document; call advance first".to_string())
            }
        }
    }

    /// 当前文档
    pub fn current(&self) -> MongoResult<&Document> {
        match &self.current {
            Some((_, doc)) => Ok(doc),
            None => Err(self.no_current()),
        }
    }

    /// 当前文档的原始字节
    pub fn current_raw(&self) -> MongoResult<&RawDocument> {
        match &self.current {
            Some((raw, _)) => Ok(raw),
            None => Err(self.no_current()),
        }
    }

    /// 关闭游标并释放服务端资源
    pub fn close(&mut self) {
        if self.state != CursorState::Failed {
            self.exhaust(true);
        }
    }

    /// 取出全部剩余文档
    pub async fn collect_all(&mut self) -> MongoResult<Vec<Document>> {
        let mut docs = Vec::new();
        while self.advance().await? {
            if let Some((_, doc)) = self.current.take() {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// 取出全部剩余文档，每个文档转为 键 → 值 映射
    pub async fn collect_maps(&mut self) -> MongoResult<Vec<IndexMap<String, Cell>>> {
        Ok(self.collect_all().await?.iter().map(to_map).collect())
    }

    /// 取出全部剩余文档，每个文档转为 (类型, 键, 值) 列表
    pub async fn collect_pairs(&mut self) -> MongoResult<Vec<Vec<TypedField>>> {
        Ok(self.collect_all().await?.iter().map(to_pair_list).collect())
    }

    /// 转为异步流，出错时产出一次错误后结束
    pub fn into_stream(self) -> impl Stream<Item = MongoResult<Document>> + Send {
        stream::unfold(Some(self), |cursor| async move {
            let mut cursor = cursor?;
            match cursor.advance().await {
                Ok(true) => {
                    let doc = cursor.current.take().map(|(_, doc)| doc)?;
                    Some((Ok(doc), Some(cursor)))
                }
                Ok(false) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            trace!(ns = %self.namespace, stream = handle.id, "releasing cursor on drop");
            self.transport.release(handle);
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("namespace", &self.namespace)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .field("returned", &self.returned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use futures::StreamExt;
    use mongolink_bson::Value;
    use mongolink_common::ErrorKind;

    fn people(n: usize) -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport::new());
        for i in 0..n {
            let mut b = DocumentBuilder::new();
            b.append_i32("i", i as i32).unwrap();
            b.append_str("name", &format!("user{}", i)).unwrap();
            b.append_bool("even", i % 2 == 0).unwrap();
            transport.insert_raw("test.people", b.finish().unwrap()).unwrap();
        }
        transport
    }

    fn cursor(transport: &Arc<MemoryTransport>) -> Cursor {
        Cursor::new(transport.clone(), Namespace::parse("test.people").unwrap())
    }

    #[tokio::test]
    async fn test_empty_result_is_exhausted() {
        let transport = people(0);
        let mut c = cursor(&transport);
        assert!(!c.advance().await.unwrap());
        assert_eq!(c.state(), CursorState::Exhausted);
        assert!(c.last_error().is_none());
        assert_eq!(c.current().unwrap_err(), MongoError::Cursor(CursorFault::Exhausted));
        assert!(!c.advance().await.unwrap());
    }

    #[tokio::test]
    async fn test_current_before_advance() {
        let transport = people(1);
        let c = cursor(&transport);
        assert_eq!(c.current().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_iterates_across_batches() {
        let transport = people(5);
        let mut c = cursor(&transport);
        c.set_batch_size(2).unwrap();
        let mut seen = Vec::new();
        while c.advance().await.unwrap() {
            seen.push(c.current().unwrap().get_i32("i").unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(c.returned(), 5);
        assert_eq!(transport.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_limit_zero_is_unlimited() {
        let transport = people(250);
        let mut c = cursor(&transport);
        c.set_limit(0).unwrap();
        assert_eq!(c.collect_all().await.unwrap().len(), 250);
    }

    #[tokio::test]
    async fn test_positive_and_negative_limit() {
        let transport = people(10);
        let mut c = cursor(&transport);
        c.set_limit(3).unwrap();
        c.set_batch_size(2).unwrap();
        assert_eq!(c.collect_all().await.unwrap().len(), 3);
        assert_eq!(transport.open_streams(), 0);

        let mut c = cursor(&transport);
        c.set_limit(-4).unwrap();
        c.set_batch_size(2).unwrap();
        assert_eq!(c.collect_all().await.unwrap().len(), 4);
        assert_eq!(transport.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_query_skip_and_fields() {
        let transport = people(6);
        let mut c = cursor(&transport);
        let mut q = DocumentBuilder::new();
        q.append_bool("even", true).unwrap();
        c.set_query(q.finish().unwrap()).unwrap();
        c.set_skip(1).unwrap();
        c.set_fields(&[("name", 1), ("_id", 0)]).unwrap();

        let docs = c.collect_all().await.unwrap();
        let names: Vec<_> = docs.iter().filter_map(|d| d.get_str("name")).collect();
        assert_eq!(names, vec!["user2", "user4"]);
        assert!(docs.iter().all(|d| d.len() == 1));
    }

    #[tokio::test]
    async fn test_mid_stream_drop_fails_cursor() {
        let transport = people(5);
        transport.fail_after_batches(Some(1));
        let mut c = cursor(&transport);
        c.set_batch_size(2).unwrap();

        assert!(c.advance().await.unwrap());
        assert!(c.advance().await.unwrap());
        let err = c.advance().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(c.state(), CursorState::Failed);
        assert_eq!(c.last_error(), Some(&err));
        assert_eq!(c.advance().await.unwrap_err(), err);
        assert!(c.current().is_err());
    }

    #[tokio::test]
    async fn test_unknown_tag_is_bson_error() {
        let transport = Arc::new(MemoryTransport::new());
        let mut bytes = vec![0u8; 4];
        bytes.extend_from_slice(&[0x13, b'd', 0]);
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.push(0);
        let len = (bytes.len() as i32).to_le_bytes();
        bytes[0..4].copy_from_slice(&len);
        transport
            .insert_raw("test.people", RawDocument::from_bytes(bytes).unwrap())
            .unwrap();

        let mut c = cursor(&transport);
        let err = c.advance().await.unwrap_err();
        assert_eq!(err, MongoError::Cursor(CursorFault::BsonError));
        assert_eq!(c.state(), CursorState::Failed);
    }

    #[tokio::test]
    async fn test_configure_after_start() {
        let transport = people(2);
        let mut c = cursor(&transport);
        assert!(c.advance().await.unwrap());
        assert_eq!(c.set_skip(1).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(
            c.set_flags(QueryFlags::SLAVE_OK).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_flags_accumulate_until_start() {
        let transport = people(0);
        let mut c = cursor(&transport);
        c.set_flags(QueryFlags::TAILABLE).unwrap();
        c.set_flags(QueryFlags::from_names(["await_data", "no_timeout"]).unwrap()).unwrap();
        assert_eq!(
            c.flags(),
            QueryFlags::TAILABLE | QueryFlags::AWAIT_DATA | QueryFlags::NO_CURSOR_TIMEOUT
        );
        c.clear_flags().unwrap();
        assert!(c.flags().is_empty());
        assert!(c.set_skip(-1).is_err());
        assert!(c.set_batch_size(-1).is_err());
    }

    #[tokio::test]
    async fn test_tailable_waits_for_data() {
        let transport = people(1);
        let mut c = cursor(&transport);
        c.set_flags(QueryFlags::TAILABLE).unwrap();

        assert!(c.advance().await.unwrap());
        assert!(!c.advance().await.unwrap());
        assert_eq!(c.state(), CursorState::Active);

        let mut b = DocumentBuilder::new();
        b.append_i32("i", 99).unwrap();
        transport.insert_raw("test.people", b.finish().unwrap()).unwrap();

        assert!(c.advance().await.unwrap());
        assert_eq!(c.current().unwrap().get("i"), Some(&Value::Int32(99)));
        assert_eq!(transport.open_streams(), 1);
        drop(c);
        assert_eq!(transport.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_stream() {
        let transport = people(5);
        let mut c = cursor(&transport);
        c.set_batch_size(2).unwrap();
        assert!(c.advance().await.unwrap());
        assert_eq!(transport.open_streams(), 1);
        drop(c);
        assert_eq!(transport.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_close() {
        let transport = people(5);
        let mut c = cursor(&transport);
        c.set_batch_size(2).unwrap();
        assert!(c.advance().await.unwrap());
        c.close();
        assert_eq!(c.state(), CursorState::Exhausted);
        assert_eq!(transport.open_streams(), 0);
        assert!(!c.advance().await.unwrap());
    }

    #[tokio::test]
    async fn test_into_stream() {
        let transport = people(4);
        let docs: Vec<_> = cursor(&transport).into_stream().collect().await;
        assert_eq!(docs.len(), 4);
        assert!(docs.iter().all(|d| d.is_ok()));

        transport.fail_after_batches(Some(0));
        let results: Vec<_> = cursor(&transport).into_stream().collect().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[tokio::test]
    async fn test_collect_maps_and_pairs() {
        let transport = people(3);
        let mut c = cursor(&transport);
        c.set_skip(1).unwrap();
        let maps = c.collect_maps().await.unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].keys().collect::<Vec<_>>(), vec!["i", "name", "even"]);
        assert_eq!(maps[0]["name"], Cell::Str("user1".to_string()));
        assert_eq!(maps[1]["even"], Cell::Bool(true));
        assert_eq!(c.state(), CursorState::Exhausted);

        let pairs = cursor(&transport).collect_pairs().await.unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[2][0], TypedField::new("int", "i", 2));
        assert_eq!(pairs[2][2].type_name, "bool");

        transport.fail_after_batches(Some(0));
        assert!(cursor(&transport).collect_maps().await.is_err());
    }

    #[test]
    fn test_advance_with_block_on() {
        let transport = people(3);
        let mut c = cursor(&transport);
        let docs = tokio_test::block_on(c.collect_all()).unwrap();
        assert_eq!(docs.len(), 3);
    }
}
