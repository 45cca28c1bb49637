//! 连接模块
//!
//! 在 `Transport` 之上提供查询与命令接口。写操作要求调用方显式给出文档与写关注，
//! 命令回复中 `ok != 1` 转为 `Transport { fault: CommandFailed }`，
//! `writeErrors` 转为 `Transport { fault: WriteError }`。

use crate::cursor::Cursor;
use crate::transport::{with_timeout, QueryFlags, Transport};
use bitflags::bitflags;
use mongolink_bson::{Document, DocumentBuilder, RawDocument, Value};
use mongolink_common::{ClientConfig, ConnectionFault, MongoError, MongoResult, Namespace};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

bitflags! {
    /// 建索引选项
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IndexFlags: u32 {
        const UNIQUE = 1 << 0;
        const DROP_DUPS = 1 << 2;
        const BACKGROUND = 1 << 3;
        const SPARSE = 1 << 4;
    }
}

/// 更新方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateType {
    /// 只更新第一个匹配的文档
    #[default]
    Basic,
    /// 更新全部匹配的文档
    Multi,
    /// 无匹配时插入
    Upsert,
}

/// 写关注
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteConcern {
    /// 需要确认的节点数，0 表示不确认
    pub w: i32,
    pub wtimeout_ms: Option<u32>,
    /// 是否等待日志落盘
    pub journal: bool,
}

impl Default for WriteConcern {
    fn default() -> Self {
        Self {
            w: 1,
            wtimeout_ms: None,
            journal: false,
        }
    }
}

impl WriteConcern {
    /// 不等待确认
    pub fn unacknowledged() -> Self {
        Self {
            w: 0,
            ..Self::default()
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.w != 0
    }

    pub fn validate(&self) -> MongoResult<()> {
        let invalid = |message: &str| {
            Err(MongoError::transport(
                "write concern",
                ConnectionFault::WriteConcernInvalid,
                message,
            ))
        };
        if self.w < 0 {
            return invalid("w must be non-negative");
        }
        if self.w == 0 && self.journal {
            return invalid("journal requires an acknowledged write");
        }
        Ok(())
    }

    /// 编码为命令里的 `writeConcern` 子文档
    pub fn to_document(&self) -> MongoResult<RawDocument> {
        self.validate()?;
        let mut b = DocumentBuilder::new();
        b.append_i32("w", self.w)?;
        if self.journal {
            b.append_bool("j", true)?;
        }
        if let Some(ms) = self.wtimeout_ms {
            b.append_i64("wtimeout", ms as i64)?;
        }
        b.finish()
    }
}

/// 由键模式生成索引名，如 `{a: 1, b: -1}` 得到 `a_1_b_-1`
pub fn index_name(key: &Document) -> String {
    key.iter()
        .map(|(field, dir)| {
            let dir = match dir {
                Value::Double(d) if d.fract() == 0.0 => format!("{}", *d as i64),
                other => match (other.as_i64(), other.as_str()) {
                    (Some(n), _) => n.to_string(),
                    (None, Some(s)) => s.to_string(),
                    (None, None) => other.type_name().to_string(),
                },
            };
            format!("{}_{}", field, dir)
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// 一条逻辑连接
pub struct Connection {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: ClientConfig::default(),
        }
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: ClientConfig) -> MongoResult<Self> {
        config.validate()?;
        Ok(Self { transport, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// 设置单次传输操作超时 (毫秒)
    pub fn set_op_timeout(&mut self, ms: u64) -> MongoResult<()> {
        if ms == 0 {
            return Err(MongoError::Validation("op timeout must be positive".to_string()));
        }
        self.config.op_timeout_ms = Some(ms);
        Ok(())
    }

    fn op_timeout(&self) -> Option<Duration> {
        self.config.op_timeout_ms.map(Duration::from_millis)
    }

    /// 创建未开始的游标，带上连接的批大小、解码限制与超时
    pub fn cursor(&self, ns: &str) -> MongoResult<Cursor> {
        let ns = Namespace::parse(ns)?;
        let mut cursor = Cursor::new(Arc::clone(&self.transport), ns)
            .with_limits(self.config.codec)
            .with_op_timeout(self.op_timeout());
        let batch_size = i32::try_from(self.config.batch_size)
            .map_err(|_| MongoError::Config("batch_size out of range".to_string()))?;
        cursor.set_batch_size(batch_size)?;
        Ok(cursor)
    }

    /// 一次配置好的查询
    pub fn find(
        &self,
        ns: &str,
        query: RawDocument,
        fields: Option<RawDocument>,
        limit: i32,
        skip: i32,
        flags: QueryFlags,
    ) -> MongoResult<Cursor> {
        let mut cursor = self.cursor(ns)?;
        cursor.set_query(query)?;
        if let Some(fields) = fields {
            cursor.set_fields_document(fields)?;
        }
        cursor.set_limit(limit)?;
        cursor.set_skip(skip)?;
        cursor.set_flags(flags)?;
        Ok(cursor)
    }

    /// 取第一个匹配的文档
    pub async fn find_one(&self, ns: &str, query: RawDocument) -> MongoResult<Option<Document>> {
        let mut cursor = self.find(ns, query, None, -1, 0, QueryFlags::empty())?;
        if cursor.advance().await? {
            let doc = cursor.current()?.clone();
            Ok(Some(doc))
        } else {
            Ok(None)
        }
    }

    pub async fn insert(&self, ns: &str, doc: &RawDocument, wc: &WriteConcern) -> MongoResult<()> {
        self.insert_batch(ns, std::slice::from_ref(doc), wc).await
    }

    /// 批量插入
    pub async fn insert_batch(
        &self,
        ns: &str,
        docs: &[RawDocument],
        wc: &WriteConcern,
    ) -> MongoResult<()> {
        if docs.is_empty() {
            return Err(MongoError::Validation("insert batch is empty".to_string()));
        }
        let ns = Namespace::parse(ns)?;
        let mut b = DocumentBuilder::new();
        b.append_str("insert", ns.collection())?;
        b.start_array("documents")?;
        for (i, doc) in docs.iter().enumerate() {
            b.append_document(&i.to_string(), doc)?;
        }
        b.finish_array()?;
        b.append_document("writeConcern", &wc.to_document()?)?;

        let reply = self.run_command(ns.database(), b.finish()?).await?;
        if wc.is_acknowledged() {
            check_write_errors(&ns, &reply)?;
        }
        debug!(ns = %ns, count = docs.len(), "inserted");
        Ok(())
    }

    /// 更新，返回匹配 (含 upsert 插入) 的文档数
    pub async fn update(
        &self,
        ns: &str,
        cond: &RawDocument,
        op: &RawDocument,
        kind: UpdateType,
        wc: &WriteConcern,
    ) -> MongoResult<u64> {
        let ns = Namespace::parse(ns)?;
        // 命令里嵌入查询与更新文档，按查询模式校验字段名
        let mut b = DocumentBuilder::query();
        b.append_str("update", ns.collection())?;
        b.start_array("updates")?;
        b.start_object("0")?;
        b.append_document("q", cond)?
            .append_document("u", op)?
            .append_bool("multi", kind == UpdateType::Multi)?
            .append_bool("upsert", kind == UpdateType::Upsert)?;
        b.finish_object()?;
        b.finish_array()?;
        b.append_document("writeConcern", &wc.to_document()?)?;

        let reply = self.run_command(ns.database(), b.finish()?).await?;
        if wc.is_acknowledged() {
            check_write_errors(&ns, &reply)?;
        }
        let n = reply_count(&reply);
        debug!(ns = %ns, kind = ?kind, matched = n, "updated");
        Ok(n)
    }

    pub async fn count(&self, db: &str, coll: &str, query: &RawDocument) -> MongoResult<u64> {
        let ns = Namespace::new(db, coll)?;
        let mut b = DocumentBuilder::query();
        b.append_str("count", ns.collection())?
            .append_document("query", query)?;
        let reply = self.run_command(ns.database(), b.finish()?).await?;
        Ok(reply_count(&reply))
    }

    /// 建索引，返回生成的索引名
    pub async fn create_index(
        &self,
        ns: &str,
        key: &RawDocument,
        flags: IndexFlags,
    ) -> MongoResult<String> {
        let ns = Namespace::parse(ns)?;
        let name = index_name(&key.decode()?);
        if name.is_empty() {
            return Err(MongoError::Validation("index key must not be empty".to_string()));
        }

        let mut b = DocumentBuilder::query();
        b.append_str("createIndexes", ns.collection())?;
        b.start_array("indexes")?;
        b.start_object("0")?;
        b.append_document("key", key)?.append_str("name", &name)?;
        for (flag, field) in [
            (IndexFlags::UNIQUE, "unique"),
            (IndexFlags::DROP_DUPS, "dropDups"),
            (IndexFlags::BACKGROUND, "background"),
            (IndexFlags::SPARSE, "sparse"),
        ] {
            if flags.contains(flag) {
                b.append_bool(field, true)?;
            }
        }
        b.finish_object()?;
        b.finish_array()?;

        self.run_command(ns.database(), b.finish()?).await?;
        info!(ns = %ns, index = %name, "index created");
        Ok(name)
    }

    pub async fn drop_collection(&self, db: &str, coll: &str) -> MongoResult<()> {
        let ns = Namespace::new(db, coll)?;
        let mut b = DocumentBuilder::new();
        b.append_str("drop", ns.collection())?;
        self.run_command(ns.database(), b.finish()?).await?;
        info!(ns = %ns, "collection dropped");
        Ok(())
    }

    pub async fn drop_db(&self, db: &str) -> MongoResult<()> {
        let mut b = DocumentBuilder::new();
        b.append_i32("dropDatabase", 1)?;
        self.run_command(db, b.finish()?).await?;
        info!(db, "database dropped");
        Ok(())
    }

    /// 数据库上最近一次写操作的错误信息
    pub async fn last_error(&self, db: &str) -> MongoResult<Option<String>> {
        let mut b = DocumentBuilder::new();
        b.append_i32("getlasterror", 1)?;
        let reply = self.run_command(db, b.finish()?).await?;
        Ok(reply.get_str("err").map(str::to_string))
    }

    /// 最近一次出错的写操作的错误信息，以及它之后执行过的操作数
    ///
    /// 自上次 `clear_errors` 以来没有出错过时返回 None。
    pub async fn prev_error(&self, db: &str) -> MongoResult<Option<(String, i64)>> {
        let mut b = DocumentBuilder::new();
        b.append_i32("getpreverror", 1)?;
        let reply = self.run_command(db, b.finish()?).await?;
        let n_prev = reply.get("nPrev").and_then(Value::as_i64).unwrap_or(-1);
        Ok(reply.get_str("err").map(|err| (err.to_string(), n_prev)))
    }

    /// 清除数据库上记录的错误
    pub async fn clear_errors(&self, db: &str) -> MongoResult<()> {
        let mut b = DocumentBuilder::new();
        b.append_i32("reseterror", 1)?;
        self.run_command(db, b.finish()?).await?;
        Ok(())
    }

    /// 添加用户，已存在的用户更新口令
    pub async fn add_user(&self, db: &str, user: &str, password: &str) -> MongoResult<()> {
        if user.is_empty() {
            return Err(MongoError::Validation("user name must not be empty".to_string()));
        }
        let mut b = DocumentBuilder::new();
        b.append_str("createUser", user)?.append_str("pwd", password)?;
        b.start_array("roles")?;
        b.finish_array()?;
        self.run_command(db, b.finish()?).await?;
        info!(db, user, "user added");
        Ok(())
    }

    pub async fn disconnect(&self) -> MongoResult<()> {
        self.transport.disconnect().await?;
        info!(transport = %self.transport.describe(), "disconnected");
        Ok(())
    }

    /// 重新连接；断开期间打开的游标不会恢复
    pub async fn reconnect(&self) -> MongoResult<()> {
        let transport = self.transport.as_ref();
        with_timeout(self.op_timeout(), transport, "reconnect", transport.reconnect()).await?;
        info!(transport = %transport.describe(), "reconnected");
        Ok(())
    }

    pub async fn authenticate(&self, db: &str, user: &str, password: &str) -> MongoResult<()> {
        let mut b = DocumentBuilder::new();
        b.append_i32("authenticate", 1)?
            .append_str("user", user)?
            .append_str("pwd", password)?;
        match self.run_command(db, b.finish()?).await {
            Ok(_) => {
                info!(db, user, "authenticated");
                Ok(())
            }
            Err(e) => {
                warn!(db, user, "authentication failed");
                Err(e)
            }
        }
    }

    /// 用 ping 检查连接是否可用
    pub async fn check_connection(&self) -> MongoResult<()> {
        let mut b = DocumentBuilder::new();
        b.append_i32("ping", 1)?;
        self.run_command("admin", b.finish()?).await.map(|_| ())
    }

    /// 执行命令并检查回复中的 `ok`
    pub async fn run_command(&self, db: &str, command: RawDocument) -> MongoResult<Document> {
        let transport = self.transport.as_ref();
        let raw = with_timeout(
            self.op_timeout(),
            transport,
            "run_command",
            transport.run_command(db, command),
        )
        .await?;
        let reply = raw.decode()?;

        let ok = reply.get("ok").and_then(Value::as_f64).unwrap_or(0.0);
        if ok != 1.0 {
            let message = match (reply.get_str("errmsg"), reply.get("code").and_then(Value::as_i64)) {
                (Some(msg), Some(code)) => format!("{} (code {})", msg, code),
                (Some(msg), None) => msg.to_string(),
                (None, _) => "command failed".to_string(),
            };
            debug!(db, error = %message, "command failed");
            return Err(MongoError::transport(
                transport.describe(),
                ConnectionFault::CommandFailed,
                message,
            ));
        }
        Ok(reply)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport.describe())
            .field("config", &self.config)
            .finish()
    }
}

fn reply_count(reply: &Document) -> u64 {
    reply
        .get("n")
        .and_then(|n| n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)))
        .map_or(0, |n| n.max(0) as u64)
}

fn check_write_errors(ns: &Namespace, reply: &Document) -> MongoResult<()> {
    let Some(first) = reply
        .get_array("writeErrors")
        .and_then(|errors| errors.values().next())
        .and_then(Value::as_document)
    else {
        return Ok(());
    };
    let message = first.get_str("errmsg").unwrap_or("write error");
    Err(MongoError::transport(
        ns.to_string(),
        ConnectionFault::WriteError,
        message,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::transport::{QueryRequest, StreamHandle};
    use async_trait::async_trait;
    use bytes::Bytes;
    use mongolink_common::ErrorKind;

    fn conn() -> (Arc<MemoryTransport>, Connection) {
        let transport = Arc::new(MemoryTransport::new());
        let conn = Connection::new(transport.clone());
        (transport, conn)
    }

    fn person(name: &str, age: i32) -> RawDocument {
        let mut b = DocumentBuilder::new();
        b.append_str("name", name).unwrap().append_i32("age", age).unwrap();
        b.finish().unwrap()
    }

    fn query(build: impl FnOnce(&mut DocumentBuilder)) -> RawDocument {
        let mut b = DocumentBuilder::query();
        build(&mut b);
        b.finish().unwrap()
    }

    fn transport_fault(err: &MongoError) -> Option<ConnectionFault> {
        match err {
            MongoError::Transport { fault, .. } => Some(*fault),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let (transport, conn) = conn();
        let wc = WriteConcern::default();
        conn.insert("test.people", &person("alice", 30), &wc).await.unwrap();
        conn.insert_batch("test.people", &[person("bob", 25), person("carol", 41)], &wc)
            .await
            .unwrap();

        let stored = transport.documents("test.people").unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|d| d.keys().next() == Some("_id")));

        let q = query(|b| {
            b.start_object("age").unwrap().append_i32("$gt", 26).unwrap();
            b.finish_object().unwrap();
        });
        let mut cursor = conn
            .find("test.people", q, None, 0, 0, QueryFlags::empty())
            .unwrap();
        let names: Vec<_> = cursor
            .collect_all()
            .await
            .unwrap()
            .iter()
            .filter_map(|d| d.get_str("name").map(str::to_string))
            .collect();
        assert_eq!(names, vec!["alice", "carol"]);

        let found = conn
            .find_one("test.people", query(|b| { b.append_str("name", "bob").unwrap(); }))
            .await
            .unwrap();
        assert_eq!(found.and_then(|d| d.get_i32("age")), Some(25));
        assert_eq!(transport.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let (_, conn) = conn();
        let err = conn
            .insert_batch("test.people", &[], &WriteConcern::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_unique_index_and_last_error() {
        let (transport, conn) = conn();
        let wc = WriteConcern::default();
        let key = query(|b| { b.append_i32("name", 1).unwrap(); });
        let name = conn.create_index("test.people", &key, IndexFlags::UNIQUE).await.unwrap();
        assert_eq!(name, "name_1");
        assert_eq!(transport.indexes("test.people").len(), 1);

        conn.insert("test.people", &person("alice", 30), &wc).await.unwrap();
        assert_eq!(conn.last_error("test").await.unwrap(), None);

        let err = conn.insert("test.people", &person("alice", 31), &wc).await.unwrap_err();
        assert_eq!(transport_fault(&err), Some(ConnectionFault::WriteError));
        let last = conn.last_error("test").await.unwrap().unwrap();
        assert!(last.contains("duplicate key"));

        conn.insert("test.people", &person("alice", 32), &WriteConcern::unacknowledged())
            .await
            .unwrap();
        assert_eq!(transport.documents("test.people").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unique_index_rejects_existing_duplicates() {
        let (transport, conn) = conn();
        let wc = WriteConcern::default();
        for age in [1, 2, 1] {
            conn.insert("test.n", &person("x", age), &wc).await.unwrap();
        }
        let key = query(|b| { b.append_i32("age", 1).unwrap(); });
        let err = conn.create_index("test.n", &key, IndexFlags::UNIQUE).await.unwrap_err();
        assert_eq!(transport_fault(&err), Some(ConnectionFault::CommandFailed));

        conn.create_index("test.n", &key, IndexFlags::UNIQUE | IndexFlags::DROP_DUPS)
            .await
            .unwrap();
        assert_eq!(transport.documents("test.n").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_kinds_and_count() {
        let (_, conn) = conn();
        let wc = WriteConcern::default();
        for (name, age) in [("a", 1), ("b", 1), ("c", 2)] {
            conn.insert("test.p", &person(name, age), &wc).await.unwrap();
        }
        let age1 = query(|b| { b.append_i32("age", 1).unwrap(); });
        let set_flag = query(|b| {
            b.start_object("$set").unwrap().append_bool("flag", true).unwrap();
            b.finish_object().unwrap();
        });
        let flagged = query(|b| { b.append_bool("flag", true).unwrap(); });

        assert_eq!(conn.update("test.p", &age1, &set_flag, UpdateType::Basic, &wc).await.unwrap(), 1);
        assert_eq!(conn.count("test", "p", &flagged).await.unwrap(), 1);

        assert_eq!(conn.update("test.p", &age1, &set_flag, UpdateType::Multi, &wc).await.unwrap(), 2);
        assert_eq!(conn.count("test", "p", &flagged).await.unwrap(), 2);

        let age9 = query(|b| { b.append_i32("age", 9).unwrap(); });
        assert_eq!(conn.update("test.p", &age9, &set_flag, UpdateType::Basic, &wc).await.unwrap(), 0);
        assert_eq!(conn.count("test", "p", &RawDocument::empty()).await.unwrap(), 3);
        assert_eq!(conn.update("test.p", &age9, &set_flag, UpdateType::Upsert, &wc).await.unwrap(), 1);
        assert_eq!(conn.count("test", "p", &RawDocument::empty()).await.unwrap(), 4);
        assert_eq!(conn.count("test", "p", &age9).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drop() {
        let (transport, conn) = conn();
        let wc = WriteConcern::default();
        conn.insert("app.a", &person("a", 1), &wc).await.unwrap();
        conn.insert("app.b", &person("b", 1), &wc).await.unwrap();
        conn.insert("other.c", &person("c", 1), &wc).await.unwrap();

        conn.drop_collection("app", "a").await.unwrap();
        let err = conn.drop_collection("app", "a").await.unwrap_err();
        assert_eq!(transport_fault(&err), Some(ConnectionFault::CommandFailed));
        assert_eq!(err.error_code(), vec!["MONGO", ConnectionFault::CommandFailed.code()]);

        conn.drop_db("app").await.unwrap();
        assert!(transport.documents("app.b").unwrap().is_empty());
        assert_eq!(transport.documents("other.c").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_authenticate_and_ping() {
        let (transport, conn) = conn();
        transport.add_user("admin", "root", "secret");
        conn.authenticate("admin", "root", "secret").await.unwrap();
        let err = conn.authenticate("admin", "root", "wrong").await.unwrap_err();
        assert_eq!(transport_fault(&err), Some(ConnectionFault::CommandFailed));
        conn.check_connection().await.unwrap();
    }

    #[tokio::test]
    async fn test_prev_error_and_clear_errors() {
        let (_, conn) = conn();
        let wc = WriteConcern::default();
        assert_eq!(conn.prev_error("test").await.unwrap(), None);

        let key = query(|b| { b.append_i32("name", 1).unwrap(); });
        conn.create_index("test.people", &key, IndexFlags::UNIQUE).await.unwrap();
        conn.insert("test.people", &person("alice", 30), &wc).await.unwrap();
        assert!(conn.insert("test.people", &person("alice", 31), &wc).await.is_err());
        conn.insert("test.people", &person("bob", 40), &wc).await.unwrap();

        // 最近一次写成功了，但之前的错误仍可取回
        assert_eq!(conn.last_error("test").await.unwrap(), None);
        let (err, n_prev) = conn.prev_error("test").await.unwrap().unwrap();
        assert!(err.contains("duplicate key"));
        assert_eq!(n_prev, 2);

        conn.clear_errors("test").await.unwrap();
        assert_eq!(conn.prev_error("test").await.unwrap(), None);
        assert_eq!(conn.last_error("test").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_user() {
        let (_, conn) = conn();
        conn.add_user("app", "svc", "one").await.unwrap();
        conn.authenticate("app", "svc", "one").await.unwrap();
        assert!(conn.authenticate("other", "svc", "one").await.is_err());

        conn.add_user("app", "svc", "two").await.unwrap();
        assert!(conn.authenticate("app", "svc", "one").await.is_err());
        conn.authenticate("app", "svc", "two").await.unwrap();

        let err = conn.add_user("app", "", "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let (transport, conn) = conn();
        let wc = WriteConcern::default();
        for i in 0..4 {
            conn.insert("test.p", &person("p", i), &wc).await.unwrap();
        }
        let mut cursor = conn.cursor("test.p").unwrap();
        cursor.set_batch_size(2).unwrap();
        assert!(cursor.advance().await.unwrap());

        conn.disconnect().await.unwrap();
        assert_eq!(transport.open_streams(), 0);
        let err = conn.check_connection().await.unwrap_err();
        assert_eq!(transport_fault(&err), Some(ConnectionFault::NoSocket));

        conn.reconnect().await.unwrap();
        conn.check_connection().await.unwrap();
        // 断开前打开的游标不会恢复
        assert!(cursor.advance().await.unwrap());
        assert!(cursor.advance().await.is_err());
        let mut fresh = conn.cursor("test.p").unwrap();
        assert_eq!(fresh.collect_all().await.unwrap().len(), 4);
    }

    #[test]
    fn test_write_concern_validation() {
        assert!(WriteConcern::default().validate().is_ok());
        let bad = WriteConcern { w: 0, wtimeout_ms: None, journal: true };
        let err = bad.validate().unwrap_err();
        assert_eq!(transport_fault(&err), Some(ConnectionFault::WriteConcernInvalid));
        let negative = WriteConcern { w: -1, ..WriteConcern::default() };
        assert!(negative.to_document().is_err());

        let doc = WriteConcern { w: 2, wtimeout_ms: Some(500), journal: true }
            .to_document()
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(doc.get_i32("w"), Some(2));
        assert_eq!(doc.get_bool("j"), Some(true));
        assert_eq!(doc.get_i64("wtimeout"), Some(500));
    }

    #[test]
    fn test_index_name() {
        let mut key = Document::new();
        key.insert("a", 1);
        key.insert("b", -1);
        key.insert("loc", "2d");
        assert_eq!(index_name(&key), "a_1_b_-1_loc_2d");
    }

    #[test]
    fn test_config_applied() {
        let transport = Arc::new(MemoryTransport::new());
        let mut config = ClientConfig::default();
        config.batch_size = 7;
        let mut conn = Connection::with_config(transport, config).unwrap();
        assert!(conn.set_op_timeout(0).is_err());
        conn.set_op_timeout(250).unwrap();
        assert_eq!(conn.config().op_timeout_ms, Some(250));
        assert!(conn.cursor("no-dot").is_err());
    }

    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn send_query(&self, _request: QueryRequest) -> MongoResult<StreamHandle> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(MongoError::Cursor(mongolink_common::CursorFault::Invalid))
        }

        async fn fetch_next(&self, _handle: &StreamHandle) -> MongoResult<Option<Bytes>> {
            Ok(None)
        }

        fn release(&self, _handle: StreamHandle) {}

        async fn run_command(&self, _db: &str, _command: RawDocument) -> MongoResult<RawDocument> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(RawDocument::empty())
        }

        fn describe(&self) -> String {
            "stalled".to_string()
        }
    }

    #[tokio::test]
    async fn test_op_timeout() {
        let mut conn = Connection::new(Arc::new(StalledTransport));
        conn.set_op_timeout(20).unwrap();

        let err = conn.check_connection().await.unwrap_err();
        assert_eq!(transport_fault(&err), Some(ConnectionFault::IoError));

        let mut cursor = conn.cursor("db.c").unwrap();
        let err = cursor.advance().await.unwrap_err();
        assert_eq!(transport_fault(&err), Some(ConnectionFault::IoError));
        assert_eq!(cursor.state(), crate::cursor::CursorState::Failed);
    }
}
