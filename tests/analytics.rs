//! Integration tests for vocabulary analytics.
//! Tests: collocations, NPMI, skipgrams, case folding, frequency data, metadata index

use framewise_core::{
    DocumentFields, FieldFilter, FieldType, FramewiseError, IdRange, IndexConfig, IndexReader,
    IndexWriter, MetadataOptions, NgramOptions, NumericKind, Scalar, Schema, Skipgram,
    SkipgramOptions,
};
use serde_json::json;
use tempfile::TempDir;

/// Two documents of three one-line paragraphs each, so frames 1-3 belong to
/// document 1 and frames 4-6 to document 2.
fn create_corpus(dir: &TempDir) -> IndexReader {
    let schema = Schema::builder()
        .add_text_field("text")
        .add_field("year", FieldType::numeric(NumericKind::Integer))
        .build();
    let documents = [
        json!({"text": "new york rocks\n\nnew york sleeps\n\nnew york wakes", "year": 2001}),
        json!({"text": "old town sleeps\n\nNew ideas\n\nnew ideas", "year": 2002}),
    ];
    IndexWriter::open_or_create(dir.path(), IndexConfig::new(schema))
        .unwrap()
        .transact(None, |writer| {
            for document in &documents {
                let fields: DocumentFields = serde_json::from_value(document.clone()).unwrap();
                writer.add_document(&fields, 1)?;
            }
            Ok(())
        })
        .unwrap();

    let mut reader = IndexReader::open(dir.path()).unwrap();
    reader.begin().unwrap();
    reader
}

/// Raw bigram scores use the live vocabulary size.
#[test]
fn significant_bigrams() {
    let dir = TempDir::new().unwrap();
    let reader = create_corpus(&dir);
    assert_eq!(reader.get_vocab_size(&FieldFilter::All).unwrap(), 9);

    let options = NgramOptions {
        min_count: 2,
        threshold: 1.0,
        ..NgramOptions::default()
    };
    let bigrams = reader.detect_significant_ngrams(&options).unwrap();
    assert_eq!(bigrams.len(), 1);
    let new_york = &bigrams[0];
    assert_eq!((new_york.left.as_str(), new_york.right.as_str()), ("new", "york"));
    assert_eq!(new_york.bigram_frames, 3);
    assert_eq!((new_york.left_frames, new_york.right_frames), (4, 3));
    // 3 * 9 / (4 * 3)
    assert!((new_york.score - 2.25).abs() < 1e-9);
    assert!(new_york.npmi.is_none());

    let strict = NgramOptions {
        min_count: 3,
        threshold: 1.0,
        ..NgramOptions::default()
    };
    assert!(reader.detect_significant_ngrams(&strict).unwrap().is_empty());
}

/// NPMI mode keeps pairs above either threshold.
#[test]
fn npmi_bigrams() {
    let dir = TempDir::new().unwrap();
    let reader = create_corpus(&dir);

    let options = NgramOptions {
        min_count: 2,
        threshold: 100.0,
        npmi_threshold: Some(0.5),
        ..NgramOptions::default()
    };
    let bigrams = reader.detect_significant_ngrams(&options).unwrap();
    assert_eq!(bigrams.len(), 1);
    // ln(3 * 6 / (4 * 3)) / -ln(3 / 6)
    let expected = 1.5_f64.ln() / 2.0_f64.ln();
    assert!((bigrams[0].npmi.unwrap() - expected).abs() < 1e-9);

    let stricter = NgramOptions {
        npmi_threshold: Some(0.6),
        ..options.clone()
    };
    assert!(reader.detect_significant_ngrams(&stricter).unwrap().is_empty());

    let by_score = NgramOptions {
        threshold: 2.0,
        ..stricter
    };
    assert_eq!(reader.detect_significant_ngrams(&by_score).unwrap().len(), 1);
}

/// Frames containing a phrase, in id order.
#[test]
fn ngram_frames() {
    let dir = TempDir::new().unwrap();
    let reader = create_corpus(&dir);

    let hits = reader
        .filter_ngrams(&["new york"], &FieldFilter::All, IdRange::all(), None)
        .unwrap();
    assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    let later = reader
        .filter_ngrams(&["new york", "new ideas"], &FieldFilter::All, IdRange::after(2), Some(2))
        .unwrap();
    assert_eq!(later.iter().map(|h| h.id).collect::<Vec<_>>(), vec![3, 6]);

    assert!(matches!(
        reader.filter_ngrams(&["york"], &FieldFilter::All, IdRange::all(), None),
        Err(FramewiseError::InvalidQuery { .. })
    ));
}

/// Skipgrams pair every term with those within the offset window.
#[test]
fn skipgrams_within_window() {
    let dir = TempDir::new().unwrap();
    let reader = create_corpus(&dir);

    let options = SkipgramOptions {
        frames: Some(vec![1]),
        start_offset: 1,
        end_offset: 2,
        ..SkipgramOptions::default()
    };
    let pairs = reader.get_skipgrams(&options).unwrap();
    let skipgram = |left: &str, right: &str| Skipgram {
        frame_id: 1,
        left: left.to_owned(),
        right: right.to_owned(),
    };
    assert_eq!(
        pairs,
        vec![
            skipgram("new", "york"),
            skipgram("new", "rocks"),
            skipgram("york", "rocks"),
        ]
    );

    let gap_only = SkipgramOptions {
        frames: Some(vec![1]),
        start_offset: 2,
        end_offset: 2,
        ..SkipgramOptions::default()
    };
    assert_eq!(reader.get_skipgrams(&gap_only).unwrap(), vec![skipgram("new", "rocks")]);

    let backwards = SkipgramOptions {
        start_offset: 2,
        end_offset: 1,
        ..SkipgramOptions::default()
    };
    assert!(matches!(
        reader.get_skipgrams(&backwards),
        Err(FramewiseError::InvalidQuery { .. })
    ));
}

/// Rare capitalised spellings fold into their common lower-case form.
#[test]
fn case_fold_suggestions() {
    let dir = TempDir::new().unwrap();
    let reader = create_corpus(&dir);

    let frequencies = reader.get_frequencies(&FieldFilter::All).unwrap();
    assert_eq!(frequencies["new"], 4);
    assert_eq!(frequencies["New"], 1);
    assert_eq!(
        reader.get_case_fold_terms(&FieldFilter::All, 0.7).unwrap(),
        vec![("New".to_owned(), "new".to_owned())]
    );
    assert!(reader.get_case_fold_terms(&FieldFilter::All, 0.2).unwrap().is_empty());
}

/// Per-frame term counts and positions.
#[test]
fn frequency_vectors_and_positions() {
    let dir = TempDir::new().unwrap();
    let reader = create_corpus(&dir);

    let vectors = reader
        .get_term_frequency_vectors(Some(&[1, 5][..]), &FieldFilter::All)
        .unwrap();
    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[&1]["york"], 1);
    assert_eq!(vectors[&5].keys().collect::<Vec<_>>(), vec!["New", "ideas"]);

    let positions = reader.get_positions_index(&FieldFilter::All).unwrap();
    assert_eq!(positions["sleeps"].keys().copied().collect::<Vec<_>>(), vec![2, 4]);
    assert_eq!(positions["sleeps"][&2], vec![2]);
}

/// Structured values grouped by value, per frame or per document.
#[test]
fn metadata_index() {
    let dir = TempDir::new().unwrap();
    let reader = create_corpus(&dir);

    let by_frame = reader.get_metadata(&MetadataOptions::default()).unwrap();
    assert_eq!(
        by_frame["year"],
        vec![
            (Scalar::Integer(2001), vec![1, 2, 3]),
            (Scalar::Integer(2002), vec![4, 5, 6]),
        ]
    );

    let by_document = reader
        .get_metadata(&MetadataOptions {
            return_documents: true,
            range: IdRange::after(1),
            ..MetadataOptions::default()
        })
        .unwrap();
    assert_eq!(by_document["year"], vec![(Scalar::Integer(2002), vec![2])]);

    let frame_metadata = reader.get_frame_metadata(&[4], None).unwrap();
    assert_eq!(frame_metadata[&4]["year"], Scalar::Integer(2002));

    assert!(matches!(
        reader.get_metadata(&MetadataOptions {
            structured_fields: Some(vec!["text".into()]),
            ..MetadataOptions::default()
        }),
        Err(FramewiseError::NonIndexedField { .. })
    ));
}
