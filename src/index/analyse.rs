//! Turns raw document fields into the staged form the storage writer accepts.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::analysis::{split_paragraphs, split_sentences};
use crate::error::{FramewiseError, Result};
use crate::schema::{Field, Schema};
use crate::storage::AnalyzedDocument;
use crate::types::{DocumentFields, FramePayload, Scalar};

/// Group a text into frames of `frame_size` sentences per paragraph. A
/// `frame_size` of zero keeps each paragraph whole.
pub fn frame_text(text: &str, frame_size: usize) -> Vec<String> {
    let mut frames = Vec::new();
    for paragraph in split_paragraphs(text) {
        if frame_size == 0 {
            frames.push(paragraph.to_owned());
            continue;
        }
        let sentences = split_sentences(paragraph);
        frames.extend(sentences.chunks(frame_size).map(|chunk| chunk.join(" ")));
    }
    frames
}

pub(crate) fn analyse_document(
    schema: &Schema,
    fields: &DocumentFields,
    frame_size: usize,
) -> Result<AnalyzedDocument> {
    let mut stored = Map::new();
    let mut shell = Map::new();
    let mut structured = BTreeMap::new();
    let mut text_fields = Vec::new();

    for (name, raw) in fields {
        let Some(field) = schema.get(name) else {
            tracing::debug!(field = %name, "ignoring field missing from schema");
            continue;
        };
        if raw.is_null() {
            continue;
        }
        if field.stored() {
            stored.insert(name.clone(), raw.clone());
        }
        if field.stored() && (!field.indexed() || field.categorical()) {
            shell.insert(name.clone(), raw.clone());
        }
        if !field.indexed() {
            continue;
        }
        if field.categorical() {
            let value = field.value_of(raw)?;
            if value != Scalar::Null {
                structured.insert(name.clone(), value);
            }
        } else {
            let Value::String(text) = raw else {
                return Err(FramewiseError::invalid_document(format!(
                    "text field '{name}' expects a string, got {raw}"
                )));
            };
            text_fields.push((name, field, text));
        }
    }

    let mut frames = BTreeMap::new();
    let mut frame_terms = BTreeMap::new();
    for (name, field, text) in text_fields {
        let mut payloads = Vec::new();
        let mut terms = Vec::new();
        for (sequence, frame) in frame_text(text, frame_size).into_iter().enumerate() {
            terms.push(
                field
                    .analyse(&frame)
                    .filter(|token| !token.stopped)
                    .map(|token| token.value)
                    .collect::<Vec<_>>(),
            );
            let payload = FramePayload {
                field: name.clone(),
                sequence_number: sequence as i64,
                text: field.stored().then_some(frame),
                shell: shell.clone(),
            };
            payloads.push(serde_json::to_string(&payload)?);
        }
        frames.insert(name.clone(), payloads);
        frame_terms.insert(name.clone(), terms);
    }

    Ok(AnalyzedDocument::V1 {
        document: serde_json::to_string(&stored)?,
        structured,
        frames,
        frame_terms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use serde_json::json;

    fn fields(value: Value) -> DocumentFields {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn frames_group_sentences_within_paragraphs() {
        let text = "One fish. Two fish. Red fish.\n\nBlue fish.";
        assert_eq!(
            frame_text(text, 2),
            vec!["One fish. Two fish.", "Red fish.", "Blue fish."]
        );
        assert_eq!(frame_text(text, 0).len(), 2);
        assert!(frame_text("   ", 1).is_empty());
    }

    #[test]
    fn document_splits_into_shell_metadata_and_frames() {
        let schema = Schema::builder()
            .add_text_field("text")
            .add_categorical_field("author")
            .add_field("notes", FieldType::text().with_indexed(false))
            .build();
        let analysed = analyse_document(
            &schema,
            &fields(json!({
                "text": "The cat sat. The cat ran.",
                "author": "Ann",
                "notes": "unindexed",
                "extra": 1
            })),
            1,
        )
        .unwrap();

        let AnalyzedDocument::V1 {
            document,
            structured,
            frames,
            frame_terms,
        } = analysed;
        let document: Map<String, Value> = serde_json::from_str(&document).unwrap();
        assert_eq!(document.len(), 3);
        assert_eq!(structured["author"], Scalar::from("Ann"));
        assert_eq!(frames["text"].len(), 2);
        assert_eq!(frame_terms["text"], vec![vec!["cat", "sat"], vec!["cat", "ran"]]);

        let payload: FramePayload = serde_json::from_str(&frames["text"][1]).unwrap();
        assert_eq!(payload.sequence_number, 1);
        assert_eq!(payload.text.as_deref(), Some("The cat ran."));
        assert_eq!(payload.shell.len(), 2);
        assert!(payload.shell.contains_key("notes"));
    }

    #[test]
    fn bad_values_are_rejected() {
        let schema = Schema::builder()
            .add_text_field("text")
            .add_field("year", FieldType::numeric(crate::schema::NumericKind::Integer))
            .build();
        assert!(matches!(
            analyse_document(&schema, &fields(json!({"text": 3})), 1),
            Err(FramewiseError::InvalidDocument { .. })
        ));
        assert!(matches!(
            analyse_document(&schema, &fields(json!({"year": "soon"})), 1),
            Err(FramewiseError::InvalidDocument { .. })
        ));
    }
}
