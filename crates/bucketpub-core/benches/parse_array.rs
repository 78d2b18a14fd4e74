use std::io::{Cursor, Write};

use bucketpub_core::{JsonPath, archive, json_stream};
use flate2::Compression;
use flate2::write::GzEncoder;

/// `{"meta": {...}, "results": [ {...} x n ]}` shaped like a bulk export page
fn document(n: usize) -> Vec<u8> {
    let mut doc = String::from(r#"{"meta":{"disclaimer":"bench","results":{"skip":0,"total":"#);
    doc.push_str(&n.to_string());
    doc.push_str(r#"}},"results":["#);
    for i in 0..n {
        if i > 0 {
            doc.push(',');
        }
        doc.push_str(&format!(
            r#"{{"safetyreportid":"{i}","receivedate":"20240101","patient":{{"drug":[{{"medicinalproduct":"ASPIRIN","drugindication":"PAIN"}},{{"medicinalproduct":"IBUPROFEN"}}],"reaction":[{{"reactionmeddrapt":"Nausea"}}]}},"serious":1}}"#
        ));
    }
    doc.push_str("]}");
    doc.into_bytes()
}

fn gzipped(doc: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(doc).unwrap();
    enc.finish().unwrap()
}

#[divan::bench(args = [1_000, 10_000])]
fn stream_elements(bencher: divan::Bencher, n: usize) {
    let doc = document(n);
    bencher.bench(|| {
        let count = json_stream::parse(Cursor::new(&doc), JsonPath::default())
            .map(|r| r.unwrap())
            .count();
        assert_eq!(count, n);
    });
}

/// Whole-document parse for comparison; memory grows with the document
#[divan::bench(args = [1_000, 10_000])]
fn sonic_whole_document(bencher: divan::Bencher, n: usize) {
    let doc = document(n);
    bencher.bench(|| {
        let value: sonic_rs::Value = sonic_rs::from_slice(&doc).unwrap();
        value
    });
}

#[divan::bench(args = [10_000])]
fn gzip_then_stream(bencher: divan::Bencher, n: usize) {
    let gz = gzipped(&document(n));
    bencher.bench(|| {
        let member = archive::open(Box::new(Cursor::new(gz.clone()))).unwrap();
        json_stream::parse(member, JsonPath::default())
            .map(|r| r.unwrap())
            .count()
    });
}

fn main() {
    divan::main();
}
