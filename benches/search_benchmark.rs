//! Query latency benchmarks over a synthetic corpus.
//!
//! # Benchmarks
//!
//! - `rank_two_terms`: ranked tf-idf search for two should-terms
//! - `filter_must_metadata`: unranked must-term search restricted by metadata
//! - `significant_bigrams`: collocation detection over the whole vocabulary
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench search_benchmark
//! ```

use criterion::{Criterion, criterion_group, criterion_main};
use framewise_core::{
    DocumentFields, FieldType, IdRange, IndexConfig, IndexReader, IndexWriter, NgramOptions,
    NumericKind, Operator, Schema, SearchQuery,
};
use serde_json::json;
use tempfile::TempDir;

const WORDS: [&str; 12] = [
    "machine", "learning", "neural", "network", "python", "rust", "systems", "programming",
    "web", "development", "storage", "engine",
];

/// Index `documents` random three-paragraph documents.
fn setup_corpus(documents: usize) -> TempDir {
    let dir = TempDir::new().unwrap();
    let schema = Schema::builder()
        .add_text_field("text")
        .add_field("year", FieldType::numeric(NumericKind::Integer))
        .build();
    let mut rng = fastrand::Rng::with_seed(7);
    let mut sentence = || {
        (0..8)
            .map(|_| WORDS[rng.usize(..WORDS.len())])
            .collect::<Vec<_>>()
            .join(" ")
    };
    let corpus: Vec<DocumentFields> = (0..documents)
        .map(|i| {
            let text = format!("{}.\n\n{}.\n\n{}.", sentence(), sentence(), sentence());
            serde_json::from_value(json!({"text": text, "year": 2000 + (i % 20)})).unwrap()
        })
        .collect();

    IndexWriter::open_or_create(dir.path(), IndexConfig::new(schema))
        .unwrap()
        .transact(None, |writer| {
            for fields in &corpus {
                writer.add_document(fields, 1)?;
            }
            Ok(())
        })
        .unwrap();
    dir
}

fn open_reader(dir: &TempDir) -> IndexReader {
    let mut reader = IndexReader::open(dir.path()).unwrap();
    reader.begin().unwrap();
    reader
}

fn bench_rank(c: &mut Criterion) {
    let corpus = setup_corpus(1000);
    let reader = open_reader(&corpus);
    let query = SearchQuery::builder()
        .should("machine")
        .should("learning")
        .limit(10)
        .build();

    c.bench_function("rank_two_terms", |b| {
        b.iter(|| reader.filter_and_rank(&query, None).unwrap());
    });
}

fn bench_filter(c: &mut Criterion) {
    let corpus = setup_corpus(1000);
    let reader = open_reader(&corpus);
    let query = SearchQuery::builder()
        .must("rust")
        .must("storage")
        .metadata("year", Operator::Between, json!([2005, 2010]))
        .build();

    c.bench_function("filter_must_metadata", |b| {
        b.iter(|| reader.filter(&query, IdRange::all()).unwrap());
    });
}

fn bench_bigrams(c: &mut Criterion) {
    let corpus = setup_corpus(300);
    let reader = open_reader(&corpus);
    let options = NgramOptions {
        min_count: 2,
        threshold: 0.0,
        ..NgramOptions::default()
    };

    c.bench_function("significant_bigrams", |b| {
        b.iter(|| reader.detect_significant_ngrams(&options).unwrap());
    });
}

criterion_group!(benches, bench_rank, bench_filter, bench_bigrams);
criterion_main!(benches);
