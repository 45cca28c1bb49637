use criterion::{criterion_group, criterion_main, Criterion};
use mongolink_bson::{decode_document, encode_document, Document, DocumentBuilder, DocumentSequence, Value};

fn sample() -> Document {
    let mut doc = Document::new();
    doc.insert("name", "Miku");
    doc.insert("age", 16i64);
    doc.insert("active", true);
    doc.insert("score", 99.5f64);
    doc.insert("tags", Value::Array(Document::from_array_values(["a", "b", "c"])));
    doc
}

fn bench_builder(c: &mut Criterion) {
    c.bench_function("builder_append", |b| {
        b.iter(|| {
            let mut builder = DocumentBuilder::new();
            builder.append_str("name", "Miku").unwrap();
            builder.append_i64("age", 16).unwrap();
            builder.start_object("address").unwrap();
            builder.append_str("city", "Tokyo").unwrap();
            builder.finish_object().unwrap();
            builder.finish().unwrap()
        })
    });
}

fn bench_encode(c: &mut Criterion) {
    let doc = sample();
    c.bench_function("document_encode", |b| b.iter(|| encode_document(&doc)));
}

fn bench_decode(c: &mut Criterion) {
    let raw = encode_document(&sample()).unwrap();
    c.bench_function("document_decode", |b| b.iter(|| decode_document(raw.as_bytes())));
}

fn bench_batch_split(c: &mut Criterion) {
    let raw = encode_document(&sample()).unwrap();
    let mut batch = Vec::new();
    for _ in 0..100 {
        batch.extend_from_slice(raw.as_bytes());
    }
    let batch = bytes::Bytes::from(batch);

    c.bench_function("batch_split_100", |b| {
        b.iter(|| DocumentSequence::new(batch.clone()).count())
    });
}

criterion_group!(benches, bench_builder, bench_encode, bench_decode, bench_batch_split);

criterion_main!(benches);
