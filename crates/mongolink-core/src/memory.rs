//! 进程内传输层
//!
//! 以命名空间为键保存已编码的文档，实现查询流与常用命令，供测试和嵌入场景使用。
//! 支持的查询条件: 顶层或点路径上的相等匹配、正则匹配，以及 `$eq` `$ne` `$gt`
//! `$gte` `$lt` `$lte` `$in` `$exists` 操作符。
//!
//! `fail_after_batches` 可以让连接在若干批之后"断开"，用来验证游标的故障路径；
//! `disconnect` 之后所有操作都以 NoSocket 失败，`reconnect` 恢复连接并清除故障注入。

use crate::transport::{QueryFlags, QueryRequest, StreamHandle, Transport};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use mongolink_bson::{Document, RawDocument, Value};
use mongolink_common::{ConnectionFault, CursorFault, MongoError, MongoResult, Namespace, ObjectId};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use tracing::{debug, trace};

/// 未指定批大小时每批返回的文档数
const DEFAULT_BATCH_SIZE: usize = 101;
const DUPLICATE_KEY: i32 = 11000;

struct StreamState {
    namespace: String,
    filter: Document,
    fields: Option<Document>,
    to_skip: usize,
    /// 下一个待扫描文档的下标
    position: usize,
    /// 服务端剩余可返回数，None 表示不限
    remaining: Option<usize>,
    first_batch: usize,
    batch_size: usize,
    started: bool,
    single_batch: bool,
    tailable: bool,
    done: bool,
}

/// 进程内传输层
#[derive(Default)]
pub struct MemoryTransport {
    collections: DashMap<String, Vec<RawDocument>>,
    indexes: DashMap<String, Vec<Document>>,
    streams: DashMap<u64, StreamState>,
    users: DashMap<(String, String), String>,
    last_errors: DashMap<String, Document>,
    /// 最近一次出错的写操作及其后的操作数 (nPrev)
    prev_errors: DashMap<String, (Document, i64)>,
    disconnected: AtomicBool,
    next_stream: AtomicU64,
    fail_after: Mutex<Option<usize>>,
    served: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个可以通过 `authenticate` 命令认证的用户
    pub fn add_user(&self, db: &str, user: &str, password: &str) {
        self.users
            .insert((db.to_string(), user.to_string()), password.to_string());
    }

    /// 原样存入一个文档，不补 `_id`
    pub fn insert_raw(&self, ns: &str, doc: RawDocument) -> MongoResult<()> {
        let ns = Namespace::parse(ns)?;
        self.collections.entry(ns.to_string()).or_default().push(doc);
        Ok(())
    }

    /// 命名空间下的全部文档
    pub fn documents(&self, ns: &str) -> MongoResult<Vec<Document>> {
        match self.collections.get(ns) {
            Some(docs) => docs.iter().map(RawDocument::decode).collect(),
            None => Ok(Vec::new()),
        }
    }

    /// 命名空间上的索引定义
    pub fn indexes(&self, ns: &str) -> Vec<Document> {
        self.indexes.get(ns).map(|i| i.clone()).unwrap_or_default()
    }

    /// 仍处于打开状态的结果流数量
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// 再成功返回 `n` 批后，所有 `fetch_next` 都以连接错误失败；None 取消故障注入
    pub fn fail_after_batches(&self, n: Option<usize>) {
        *self.fail_after.lock() = n;
        self.served.store(0, AtomicOrdering::SeqCst);
    }

    fn check_connected(&self) -> MongoResult<()> {
        if self.disconnected.load(AtomicOrdering::SeqCst) {
            return Err(MongoError::transport(
                self.describe(),
                ConnectionFault::NoSocket,
                "not connected",
            ));
        }
        Ok(())
    }

    fn check_fault(&self) -> MongoResult<()> {
        self.check_connected()?;
        if let Some(n) = *self.fail_after.lock() {
            if self.served.load(AtomicOrdering::SeqCst) >= n {
                return Err(MongoError::transport(
                    self.describe(),
                    ConnectionFault::SocketError,
                    "connection reset by peer",
                ));
            }
        }
        Ok(())
    }

    fn execute(&self, db: &str, cmd: &Document) -> MongoResult<Document> {
        let Some((name, arg)) = cmd.iter().next() else {
            return Ok(command_error("empty command", 59));
        };
        trace!(db, command = name, "memory command");
        match name {
            "ping" => Ok(ok_reply()),
            "insert" => self.cmd_insert(db, arg, cmd),
            "update" => self.cmd_update(db, arg, cmd),
            "count" => self.cmd_count(db, arg, cmd),
            "createIndexes" => self.cmd_create_indexes(db, arg, cmd),
            "drop" => self.cmd_drop(db, arg),
            "dropDatabase" => Ok(self.cmd_drop_database(db)),
            "getLastError" | "getlasterror" => Ok(self.cmd_last_error(db)),
            "getPrevError" | "getpreverror" => Ok(self.cmd_prev_error(db)),
            "resetError" | "reseterror" => Ok(self.cmd_reset_error(db)),
            "authenticate" => Ok(self.cmd_authenticate(db, cmd)),
            "createUser" => Ok(self.cmd_create_user(db, arg, cmd)),
            other => Ok(command_error(&format!("no such command: '{}'", other), 59)),
        }
    }

    fn record_last_error(&self, db: &str, err: Option<&str>, n: i64) {
        let mut doc = Document::new();
        doc.insert("err", err.map(str::to_string));
        doc.insert("n", n);
        match err {
            Some(_) => {
                self.prev_errors.insert(db.to_string(), (doc.clone(), 1));
            }
            None => {
                if let Some(mut prev) = self.prev_errors.get_mut(db) {
                    prev.1 += 1;
                }
            }
        }
        self.last_errors.insert(db.to_string(), doc);
    }

    fn cmd_insert(&self, db: &str, arg: &Value, cmd: &Document) -> MongoResult<Document> {
        let ns = collection_ns(db, arg)?;
        let Some(documents) = cmd.get_array("documents") else {
            return Ok(command_error("insert requires 'documents'", 9));
        };

        let mut inserted = 0i64;
        let mut write_errors = Vec::new();
        for (index, value) in documents.values().enumerate() {
            let Some(doc) = value.as_document() else {
                return Ok(command_error("documents must be objects", 2));
            };
            let doc = with_id(doc);
            let mut coll = self.collections.entry(ns.clone()).or_default();
            if let Some(name) = self.unique_violation(&ns, &coll, &doc, None)? {
                write_errors.push(write_error(index, &ns, &name));
                continue;
            }
            coll.push(doc.encode()?);
            inserted += 1;
        }

        let first_error = write_errors
            .first()
            .and_then(|e| e.get_str("errmsg"))
            .map(str::to_string);
        self.record_last_error(db, first_error.as_deref(), 0);

        let mut reply = Document::new();
        reply.insert("n", inserted);
        if !write_errors.is_empty() {
            reply.insert("writeErrors", Value::Array(Document::from_array_values(write_errors)));
        }
        reply.insert("ok", 1.0);
        Ok(reply)
    }

    fn cmd_update(&self, db: &str, arg: &Value, cmd: &Document) -> MongoResult<Document> {
        let ns = collection_ns(db, arg)?;
        let Some(updates) = cmd.get_array("updates") else {
            return Ok(command_error("update requires 'updates'", 9));
        };

        let mut matched = 0i64;
        let mut modified = 0i64;
        let mut upserted = Vec::new();
        let mut write_errors = Vec::new();

        for (index, spec) in updates.values().enumerate() {
            let Some(spec) = spec.as_document() else {
                return Ok(command_error("updates must be objects", 2));
            };
            let (Some(q), Some(u)) = (spec.get_document("q"), spec.get_document("u")) else {
                return Ok(command_error("update requires 'q' and 'u'", 9));
            };
            let multi = spec.get_bool("multi").unwrap_or(false);
            let upsert = spec.get_bool("upsert").unwrap_or(false);
            if let Err(e) = validate_filter(q) {
                return Ok(command_error(&e.to_string(), 2));
            }

            let mut coll = self.collections.entry(ns.clone()).or_default();
            let mut hit = false;
            for i in 0..coll.len() {
                let old = coll[i].decode()?;
                if !matches(&old, q)? {
                    continue;
                }
                hit = true;
                matched += 1;
                let new = match apply_update(&old, u) {
                    Ok(new) => new,
                    Err(e) => return Ok(command_error(&e.to_string(), 9)),
                };
                if let Some(name) = self.unique_violation(&ns, &coll, &new, Some(i))? {
                    write_errors.push(write_error(index, &ns, &name));
                    break;
                }
                if new != old {
                    coll[i] = new.encode()?;
                    modified += 1;
                }
                if !multi {
                    break;
                }
            }

            if !hit && upsert {
                let mut base = Document::new();
                for (key, value) in q.iter() {
                    if !key.starts_with('$') && !is_operator_doc(value) {
                        base.insert(key, value.clone());
                    }
                }
                let new = match apply_update(&base, u) {
                    Ok(new) => with_id(&new),
                    Err(e) => return Ok(command_error(&e.to_string(), 9)),
                };
                if let Some(name) = self.unique_violation(&ns, &coll, &new, None)? {
                    write_errors.push(write_error(index, &ns, &name));
                    continue;
                }
                let mut entry = Document::new();
                entry.insert("index", index as i32);
                entry.insert("_id", new.get("_id").cloned().unwrap_or(Value::Null));
                upserted.push(entry);
                coll.push(new.encode()?);
                matched += 1;
            }
        }

        self.record_last_error(
            db,
            write_errors.first().and_then(|e| e.get_str("errmsg")),
            matched,
        );

        let mut reply = Document::new();
        reply.insert("n", matched);
        reply.insert("nModified", modified);
        if !upserted.is_empty() {
            reply.insert("upserted", Value::Array(Document::from_array_values(upserted)));
        }
        if !write_errors.is_empty() {
            reply.insert("writeErrors", Value::Array(Document::from_array_values(write_errors)));
        }
        reply.insert("ok", 1.0);
        Ok(reply)
    }

    fn cmd_count(&self, db: &str, arg: &Value, cmd: &Document) -> MongoResult<Document> {
        let ns = collection_ns(db, arg)?;
        let empty = Document::new();
        let query = cmd.get_document("query").unwrap_or(&empty);
        if let Err(e) = validate_filter(query) {
            return Ok(command_error(&e.to_string(), 2));
        }
        let mut n = 0i64;
        if let Some(coll) = self.collections.get(&ns) {
            for raw in coll.iter() {
                if matches(&raw.decode()?, query)? {
                    n += 1;
                }
            }
        }
        let mut reply = Document::new();
        reply.insert("n", n);
        reply.insert("ok", 1.0);
        Ok(reply)
    }

    fn cmd_create_indexes(&self, db: &str, arg: &Value, cmd: &Document) -> MongoResult<Document> {
        let ns = collection_ns(db, arg)?;
        let Some(specs) = cmd.get_array("indexes") else {
            return Ok(command_error("createIndexes requires 'indexes'", 9));
        };

        let before = self.indexes.get(&ns).map(|i| i.len()).unwrap_or(0);
        for spec in specs.values() {
            let Some(spec) = spec.as_document() else {
                return Ok(command_error("index specs must be objects", 2));
            };
            let (Some(key), Some(name)) = (spec.get_document("key"), spec.get_str("name")) else {
                return Ok(command_error("index spec requires 'key' and 'name'", 9));
            };
            if key.is_empty() {
                return Ok(command_error("index key pattern cannot be empty", 67));
            }

            if spec.get_bool("unique").unwrap_or(false) {
                let sparse = spec.get_bool("sparse").unwrap_or(false);
                let drop_dups = spec.get_bool("dropDups").unwrap_or(false);
                let mut coll = self.collections.entry(ns.clone()).or_default();
                let mut kept: Vec<RawDocument> = Vec::with_capacity(coll.len());
                let mut seen: Vec<Vec<Value>> = Vec::new();
                for raw in coll.iter() {
                    let doc = raw.decode()?;
                    let Some(values) = index_values(&doc, key, sparse) else {
                        kept.push(raw.clone());
                        continue;
                    };
                    if seen.iter().any(|s| values_list_equal(s, &values)) {
                        if drop_dups {
                            continue;
                        }
                        return Ok(command_error(
                            &format!("E11000 duplicate key error collection: {} index: {}", ns, name),
                            DUPLICATE_KEY,
                        ));
                    }
                    seen.push(values);
                    kept.push(raw.clone());
                }
                *coll = kept;
            }

            let mut indexes = self.indexes.entry(ns.clone()).or_default();
            if !indexes.iter().any(|i| i.get_str("name") == Some(name)) {
                let mut stored = spec.clone();
                stored.set("ns", ns.as_str());
                indexes.push(stored);
            }
        }
        let after = self.indexes.get(&ns).map(|i| i.len()).unwrap_or(0);

        let mut reply = Document::new();
        reply.insert("numIndexesBefore", before as i32);
        reply.insert("numIndexesAfter", after as i32);
        reply.insert("ok", 1.0);
        Ok(reply)
    }

    fn cmd_drop(&self, db: &str, arg: &Value) -> MongoResult<Document> {
        let ns = collection_ns(db, arg)?;
        self.indexes.remove(&ns);
        match self.collections.remove(&ns) {
            Some(_) => {
                let mut reply = Document::new();
                reply.insert("ns", ns);
                reply.insert("ok", 1.0);
                Ok(reply)
            }
            None => Ok(command_error("ns not found", 26)),
        }
    }

    fn cmd_drop_database(&self, db: &str) -> Document {
        let prefix = format!("{}.", db);
        self.collections.retain(|ns, _| !ns.starts_with(&prefix));
        self.indexes.retain(|ns, _| !ns.starts_with(&prefix));
        self.last_errors.remove(db);
        self.prev_errors.remove(db);
        let mut reply = Document::new();
        reply.insert("dropped", db);
        reply.insert("ok", 1.0);
        reply
    }

    fn cmd_last_error(&self, db: &str) -> Document {
        let mut reply = match self.last_errors.get(db) {
            Some(doc) => doc.clone(),
            None => {
                let mut doc = Document::new();
                doc.insert("err", Value::Null);
                doc.insert("n", 0i64);
                doc
            }
        };
        reply.insert("ok", 1.0);
        reply
    }

    /// 没有出错记录时 nPrev 为 -1
    fn cmd_prev_error(&self, db: &str) -> Document {
        let mut reply = match self.prev_errors.get(db) {
            Some(entry) => {
                let (doc, n_prev) = entry.value();
                let mut reply = doc.clone();
                reply.insert("nPrev", *n_prev);
                reply
            }
            None => {
                let mut doc = Document::new();
                doc.insert("err", Value::Null);
                doc.insert("n", 0i64);
                doc.insert("nPrev", -1i64);
                doc
            }
        };
        reply.insert("ok", 1.0);
        reply
    }

    fn cmd_reset_error(&self, db: &str) -> Document {
        self.last_errors.remove(db);
        self.prev_errors.remove(db);
        ok_reply()
    }

    /// 已存在的用户直接替换口令
    fn cmd_create_user(&self, db: &str, arg: &Value, cmd: &Document) -> Document {
        let (Some(user), Some(password)) = (arg.as_str(), cmd.get_str("pwd")) else {
            return command_error("createUser requires a user name and pwd", 2);
        };
        if user.is_empty() {
            return command_error("user name must not be empty", 2);
        }
        self.add_user(db, user, password);
        debug!(db, user, "memory user stored");
        ok_reply()
    }

    fn cmd_authenticate(&self, db: &str, cmd: &Document) -> Document {
        let user = cmd.get_str("user").unwrap_or_default();
        let password = cmd.get_str("pwd").unwrap_or_default();
        match self.users.get(&(db.to_string(), user.to_string())) {
            Some(expected) if expected.as_str() == password => ok_reply(),
            _ => command_error("auth failed", 18),
        }
    }

    /// 检查 `doc` 是否与集合中 (`skip` 之外的) 文档在某个唯一索引上冲突
    fn unique_violation(
        &self,
        ns: &str,
        coll: &[RawDocument],
        doc: &Document,
        skip: Option<usize>,
    ) -> MongoResult<Option<String>> {
        let Some(indexes) = self.indexes.get(ns) else {
            return Ok(None);
        };
        for index in indexes.iter() {
            if !index.get_bool("unique").unwrap_or(false) {
                continue;
            }
            let Some(key) = index.get_document("key") else {
                continue;
            };
            let sparse = index.get_bool("sparse").unwrap_or(false);
            let Some(values) = index_values(doc, key, sparse) else {
                continue;
            };
            for (i, raw) in coll.iter().enumerate() {
                if Some(i) == skip {
                    continue;
                }
                let existing = raw.decode()?;
                if index_values(&existing, key, sparse)
                    .is_some_and(|other| values_list_equal(&other, &values))
                {
                    return Ok(Some(index.get_str("name").unwrap_or("unique").to_string()));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_query(&self, request: QueryRequest) -> MongoResult<StreamHandle> {
        self.check_connected()?;
        let filter = request
            .query
            .decode()
            .map_err(|_| MongoError::Cursor(CursorFault::QueryFail))?;
        validate_filter(&filter).map_err(|e| {
            debug!(ns = %request.namespace, error = %e, "rejected query filter");
            MongoError::Cursor(CursorFault::QueryFail)
        })?;
        let fields = match &request.fields {
            Some(raw) => Some(raw.decode().map_err(|_| MongoError::Cursor(CursorFault::QueryFail))?),
            None => None,
        };

        let first = request.first_batch_size();
        let batch_size = match request.batch_size {
            size if size > 0 => size as usize,
            _ => DEFAULT_BATCH_SIZE,
        };
        let state = StreamState {
            namespace: request.namespace.to_string(),
            filter,
            fields,
            to_skip: request.skip.max(0) as usize,
            position: 0,
            remaining: (request.limit != 0).then(|| request.limit.unsigned_abs() as usize),
            first_batch: if first > 0 { first as usize } else { DEFAULT_BATCH_SIZE },
            batch_size,
            started: false,
            single_batch: request.limit < 0,
            tailable: request.flags.contains(QueryFlags::TAILABLE),
            done: false,
        };

        let id = self.next_stream.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        self.streams.insert(id, state);
        debug!(ns = %request.namespace, stream = id, "memory stream opened");
        Ok(StreamHandle {
            id,
            namespace: request.namespace,
        })
    }

    async fn fetch_next(&self, handle: &StreamHandle) -> MongoResult<Option<Bytes>> {
        self.check_fault()?;

        let mut state = self
            .streams
            .get_mut(&handle.id)
            .ok_or(MongoError::Cursor(CursorFault::Invalid))?;
        if state.done {
            drop(state);
            self.streams.remove(&handle.id);
            return Ok(None);
        }

        let size = if state.started { state.batch_size } else { state.first_batch };
        state.started = true;

        let mut out = BytesMut::new();
        let mut count = 0usize;
        let coll = self.collections.get(&state.namespace);
        let docs: &[RawDocument] = coll.as_ref().map(|c| c.value().as_slice()).unwrap_or(&[]);
        while state.position < docs.len() && count < size && state.remaining != Some(0) {
            let raw = &docs[state.position];
            state.position += 1;
            let doc = raw
                .decode()
                .map_err(|_| MongoError::Cursor(CursorFault::BsonError))?;
            if !matches(&doc, &state.filter)? {
                continue;
            }
            if state.to_skip > 0 {
                state.to_skip -= 1;
                continue;
            }
            match &state.fields {
                Some(spec) => out.extend_from_slice(project(&doc, spec).encode()?.as_bytes()),
                None => out.extend_from_slice(raw.as_bytes()),
            }
            count += 1;
            if let Some(remaining) = state.remaining.as_mut() {
                *remaining -= 1;
            }
        }
        let at_end = state.position >= docs.len();
        drop(coll);

        let limit_hit = state.remaining == Some(0);
        if state.single_batch || limit_hit || (at_end && !state.tailable) {
            state.done = true;
        }
        if count == 0 && state.done {
            drop(state);
            self.streams.remove(&handle.id);
            return Ok(None);
        }
        drop(state);

        self.served.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Some(out.freeze()))
    }

    fn release(&self, handle: StreamHandle) {
        if self.streams.remove(&handle.id).is_some() {
            trace!(stream = handle.id, "memory stream released");
        }
    }

    async fn run_command(&self, db: &str, command: RawDocument) -> MongoResult<RawDocument> {
        self.check_connected()?;
        let cmd = command.decode()?;
        self.execute(db, &cmd)?.encode()
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn disconnect(&self) -> MongoResult<()> {
        self.disconnected.store(true, AtomicOrdering::SeqCst);
        // 服务端游标随连接一起失效
        self.streams.clear();
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        self.disconnected.store(false, AtomicOrdering::SeqCst);
        self.fail_after_batches(None);
        Ok(())
    }
}

fn ok_reply() -> Document {
    let mut doc = Document::new();
    doc.insert("ok", 1.0);
    doc
}

fn command_error(msg: &str, code: i32) -> Document {
    let mut doc = Document::new();
    doc.insert("ok", 0.0);
    doc.insert("errmsg", msg);
    doc.insert("code", code);
    doc
}

fn write_error(index: usize, ns: &str, index_name: &str) -> Document {
    let mut doc = Document::new();
    doc.insert("index", index as i32);
    doc.insert("code", DUPLICATE_KEY);
    doc.insert(
        "errmsg",
        format!("E11000 duplicate key error collection: {} index: {}", ns, index_name),
    );
    doc
}

fn collection_ns(db: &str, arg: &Value) -> MongoResult<String> {
    let coll = arg
        .as_str()
        .ok_or_else(|| MongoError::Validation("command argument must be a collection name".to_string()))?;
    Ok(Namespace::new(db, coll)?.to_string())
}

/// 缺少 `_id` 时在最前面补一个新的 ObjectId
fn with_id(doc: &Document) -> Document {
    if doc.contains_key("_id") {
        return doc.clone();
    }
    let mut out = Document::with_capacity(doc.len() + 1);
    out.insert("_id", ObjectId::new());
    for (key, value) in doc.iter() {
        out.insert(key, value.clone());
    }
    out
}

fn is_operator_doc(value: &Value) -> bool {
    value
        .as_document()
        .and_then(|d| d.keys().next())
        .is_some_and(|k| k.starts_with('$'))
}

/// 按点路径取值，数组按下标字符串访问
fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut value = doc.get(parts.next()?)?;
    for part in parts {
        value = match value {
            Value::Document(d) | Value::Array(d) => d.get(part)?,
            _ => return None,
        };
    }
    Some(value)
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => {
            Some((x.time, x.increment).cmp(&(y.time, y.increment)))
        }
        (Value::ObjectId(x), Value::ObjectId(y)) => Some(x.as_bytes().cmp(y.as_bytes())),
        (Value::Boolean(x), Value::Boolean(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn values_list_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
}

/// 索引键上的取值；稀疏索引且所有键都缺失时返回 None
fn index_values(doc: &Document, key: &Document, sparse: bool) -> Option<Vec<Value>> {
    let values: Vec<Option<&Value>> = key.keys().map(|k| lookup(doc, k)).collect();
    if sparse && values.iter().all(Option::is_none) {
        return None;
    }
    Some(values.into_iter().map(|v| v.cloned().unwrap_or(Value::Null)).collect())
}

const OPERATORS: [&str; 8] = ["$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$exists"];

fn validate_filter(filter: &Document) -> MongoResult<()> {
    for (key, cond) in filter.iter() {
        if key.starts_with('$') {
            return Err(MongoError::Validation(format!("unsupported top-level operator {}", key)));
        }
        match cond {
            Value::Regex(re) => {
                re.compile()?;
            }
            Value::Document(ops) if is_operator_doc(cond) => {
                for (op, arg) in ops.iter() {
                    if !OPERATORS.contains(&op) {
                        return Err(MongoError::Validation(format!("unknown operator {}", op)));
                    }
                    if op == "$in" && arg.as_array().is_none() {
                        return Err(MongoError::Validation("$in needs an array".to_string()));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn matches(doc: &Document, filter: &Document) -> MongoResult<bool> {
    for (key, cond) in filter.iter() {
        let actual = lookup(doc, key);
        let ok = match cond {
            Value::Regex(re) => {
                let re = re.compile()?;
                actual.and_then(Value::as_str).is_some_and(|s| re.is_match(s))
            }
            Value::Document(ops) if is_operator_doc(cond) => {
                let mut all = true;
                for (op, arg) in ops.iter() {
                    all &= match_operator(actual, op, arg)?;
                }
                all
            }
            expected => match actual {
                Some(a) => values_equal(a, expected),
                None => expected.is_null(),
            },
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_operator(actual: Option<&Value>, op: &str, arg: &Value) -> MongoResult<bool> {
    let ordered = |want: &[Ordering]| {
        actual
            .and_then(|a| compare(a, arg))
            .is_some_and(|o| want.contains(&o))
    };
    let result = match op {
        "$eq" => actual.is_some_and(|a| values_equal(a, arg)),
        "$ne" => !actual.is_some_and(|a| values_equal(a, arg)),
        "$gt" => ordered(&[Ordering::Greater]),
        "$gte" => ordered(&[Ordering::Greater, Ordering::Equal]),
        "$lt" => ordered(&[Ordering::Less]),
        "$lte" => ordered(&[Ordering::Less, Ordering::Equal]),
        "$in" => {
            let candidates = arg
                .as_array()
                .ok_or_else(|| MongoError::Validation("$in needs an array".to_string()))?;
            actual.is_some_and(|a| candidates.values().any(|c| values_equal(a, c)))
        }
        "$exists" => {
            let want = match arg {
                Value::Boolean(b) => *b,
                other => other.as_f64().map_or(true, |n| n != 0.0),
            };
            actual.is_some() == want
        }
        other => return Err(MongoError::Validation(format!("unknown operator {}", other))),
    };
    Ok(result)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Boolean(b) => *b,
        Value::Null | Value::Undefined => false,
        other => other.as_f64().map_or(true, |n| n != 0.0),
    }
}

/// 顶层字段投影，包含模式下默认保留 `_id`
fn project(doc: &Document, spec: &Document) -> Document {
    let include = spec.iter().any(|(k, v)| k != "_id" && truthy(v));
    let keep_id = spec.get("_id").map_or(true, truthy);
    let mut out = Document::new();
    for (key, value) in doc.iter() {
        let keep = if key == "_id" {
            keep_id
        } else if include {
            spec.get(key).is_some_and(truthy)
        } else {
            spec.get(key).map_or(true, truthy)
        };
        if keep {
            out.insert(key, value.clone());
        }
    }
    out
}

/// 应用更新: 操作符文档 ($set/$unset/$inc) 或整体替换 (保留原 `_id`)
fn apply_update(old: &Document, update: &Document) -> MongoResult<Document> {
    let is_operator = update.keys().next().is_some_and(|k| k.starts_with('$'));
    if !is_operator {
        let mut new = Document::with_capacity(update.len() + 1);
        if let Some(id) = old.get("_id") {
            new.insert("_id", id.clone());
        }
        for (key, value) in update.iter() {
            if key != "_id" {
                new.insert(key, value.clone());
            }
        }
        return Ok(new);
    }

    let mut new = old.clone();
    for (op, fields) in update.iter() {
        let fields = fields
            .as_document()
            .ok_or_else(|| MongoError::Validation(format!("{} needs a document", op)))?;
        for (key, value) in fields.iter() {
            match op {
                "$set" => new.set(key, value.clone()),
                "$unset" => {
                    new.remove(key);
                }
                "$inc" => {
                    let sum = match (new.get(key), value) {
                        (None, v) => v.clone(),
                        (Some(Value::Int32(a)), Value::Int32(b)) => match a.checked_add(*b) {
                            Some(n) => Value::Int32(n),
                            None => Value::Int64(*a as i64 + *b as i64),
                        },
                        (Some(a), b) => match (a.as_i64(), b.as_i64()) {
                            (Some(x), Some(y)) => Value::Int64(x.wrapping_add(y)),
                            _ => match (a.as_f64(), b.as_f64()) {
                                (Some(x), Some(y)) => Value::Double(x + y),
                                _ => {
                                    return Err(MongoError::Validation(format!(
                                        "cannot $inc non-numeric field {}",
                                        key
                                    )))
                                }
                            },
                        },
                    };
                    new.set(key, sum);
                }
                other => {
                    return Err(MongoError::Validation(format!(
                        "unsupported update operator {}",
                        other
                    )))
                }
            }
        }
    }
    Ok(new)
}
