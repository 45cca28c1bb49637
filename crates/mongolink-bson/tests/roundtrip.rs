use mongolink_bson::{
    compat, decode_document, encode_document, Binary, BinarySubtype, CodeWithScope, Document,
    DocumentBuilder, RawDocument, Regex, Timestamp, Value,
};
use mongolink_common::{MongoResult, ObjectId};
use proptest::prelude::*;

/// `bson` crate 也能读写的标量
fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        (-1.0e12f64..1.0e12).prop_map(Value::Double),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
        any::<bool>().prop_map(Value::Boolean),
        any::<i32>().prop_map(Value::Int32),
        any::<i64>().prop_map(Value::Int64),
        any::<i64>().prop_map(Value::DateTime),
        Just(Value::Null),
        Just(Value::Undefined),
        any::<[u8; 12]>().prop_map(|b| Value::ObjectId(ObjectId::from_bytes(b))),
        (
            prop::sample::select(vec![
                BinarySubtype::Generic,
                BinarySubtype::Function,
                BinarySubtype::Md5,
                BinarySubtype::UserDefined(0x80),
                BinarySubtype::UserDefined(0xfe),
            ]),
            proptest::collection::vec(any::<u8>(), 0..32),
        )
            .prop_map(|(subtype, bytes)| Value::Binary(Binary::new(subtype, bytes))),
        ("[a-z^$.*]{0,8}", prop::sample::select(vec!["", "i", "im", "ms", "imsx"]))
            .prop_map(|(p, o)| Value::Regex(Regex::new(p, o))),
        "[a-z_ ]{0,12}".prop_map(Value::Symbol),
        "[a-z(){};= ]{0,16}".prop_map(Value::Code),
        (any::<u32>(), any::<u32>()).prop_map(|(t, i)| Value::Timestamp(Timestamp::new(t, i))),
    ]
}

/// 在 `leaf` 之外再加上只有本库编解码覆盖的类型
fn full_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        8 => leaf(),
        1 => proptest::collection::vec(any::<u8>(), 0..16)
            .prop_map(|bytes| Value::Binary(Binary::new(BinarySubtype::BinaryOld, bytes))),
        1 => (
            "[a-z(){};= ]{0,16}",
            proptest::collection::btree_map("[a-z_][a-z0-9_]{0,6}", leaf(), 0..3),
        )
            .prop_map(|(code, scope)| {
                Value::CodeWithScope(CodeWithScope {
                    code,
                    scope: scope.into_iter().collect(),
                })
            }),
    ]
}

fn document_of<S>(leaves: S, depth: u32) -> BoxedStrategy<Document>
where
    S: Strategy<Value = Value> + 'static,
{
    let value = leaves.prop_recursive(depth, 32, 4, |inner| {
        prop_oneof![
            proptest::collection::btree_map("[a-z_][a-z0-9_]{0,6}", inner.clone(), 0..4)
                .prop_map(|fields| Value::Document(fields.into_iter().collect())),
            proptest::collection::vec(inner, 0..4)
                .prop_map(|items| Value::Array(Document::from_array_values(items))),
        ]
    });
    proptest::collection::btree_map("[a-z_][a-z0-9_]{0,6}", value, 0..8)
        .prop_map(|fields| fields.into_iter().collect())
        .boxed()
}

fn document(depth: u32) -> BoxedStrategy<Document> {
    document_of(full_leaf(), depth)
}

/// 构建器上的一步操作；键在重放时生成，保证同层不重复
#[derive(Debug, Clone)]
enum Op {
    Append(Value),
    StartObject,
    StartArray,
    Finish,
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        4 => full_leaf().prop_map(Op::Append),
        1 => Just(Op::StartObject),
        1 => Just(Op::StartArray),
        2 => Just(Op::Finish),
    ];
    proptest::collection::vec(op, 0..40)
}

struct Level {
    array: bool,
    key: String,
    doc: Document,
}

/// 把操作序列交给构建器，同时构造期望的文档
fn replay(ops: &[Op]) -> MongoResult<(RawDocument, Document)> {
    let mut b = DocumentBuilder::new();
    let mut levels = vec![Level {
        array: false,
        key: String::new(),
        doc: Document::new(),
    }];
    let mut counter = 0usize;

    for op in ops {
        let top = levels.len() - 1;
        let key = if levels[top].array {
            levels[top].doc.len().to_string()
        } else {
            counter += 1;
            format!("k{}", counter)
        };
        match op {
            Op::Append(value) => {
                if levels[top].array {
                    b.push(value.clone())?;
                } else {
                    b.append_value(&key, value)?;
                }
                levels[top].doc.insert(key.as_str(), value.clone());
            }
            Op::StartObject | Op::StartArray if levels.len() < 8 => {
                let array = matches!(op, Op::StartArray);
                if array {
                    b.start_array(&key)?;
                } else {
                    b.start_object(&key)?;
                }
                levels.push(Level {
                    array,
                    key,
                    doc: Document::new(),
                });
            }
            Op::StartObject | Op::StartArray => {}
            Op::Finish if levels.len() > 1 => close(&mut b, &mut levels)?,
            Op::Finish => {}
        }
    }
    while levels.len() > 1 {
        close(&mut b, &mut levels)?;
    }
    let raw = b.finish()?;
    let expected = levels.pop().map(|level| level.doc).unwrap_or_default();
    Ok((raw, expected))
}

fn close(b: &mut DocumentBuilder, levels: &mut Vec<Level>) -> MongoResult<()> {
    let Some(level) = levels.pop() else {
        return Ok(());
    };
    let value = if level.array {
        b.finish_array()?;
        Value::Array(level.doc)
    } else {
        b.finish_object()?;
        Value::Document(level.doc)
    };
    if let Some(parent) = levels.last_mut() {
        parent.doc.insert(level.key.as_str(), value);
    }
    Ok(())
}

proptest! {
    #[test]
    fn decode_inverts_encode(doc in document(4)) {
        let raw = encode_document(&doc).unwrap();
        prop_assert_eq!(decode_document(raw.as_bytes()).unwrap(), doc);
    }

    #[test]
    fn builder_bytes_survive_decode_and_encode(ops in ops()) {
        let (raw, expected) = replay(&ops).unwrap();
        let decoded = decode_document(raw.as_bytes()).unwrap();
        prop_assert_eq!(&decoded, &expected);
        let reencoded = encode_document(&decoded).unwrap();
        prop_assert_eq!(reencoded.as_bytes(), raw.as_bytes());
    }

    #[test]
    fn bson_crate_reads_our_bytes(doc in document_of(leaf(), 3)) {
        let raw = encode_document(&doc).unwrap();
        let theirs = compat::to_bson_crate(&raw).unwrap();
        prop_assert_eq!(compat::from_bson_crate(&theirs).unwrap(), doc);
    }

    #[test]
    fn truncated_input_never_panics(doc in document(3), cut in 0usize..64) {
        let raw = encode_document(&doc).unwrap();
        let bytes = raw.as_bytes();
        let cut = cut.min(bytes.len().saturating_sub(1));
        prop_assert!(decode_document(&bytes[..cut]).is_err() || cut == 0);
    }
}
