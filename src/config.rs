//! Index config: the schema plus the storage selector, persisted as JSON.
//!
//! Every file carries an explicit `format` tag. Format 2 is written today; format
//! 1 (or a file without a tag) is the older flat field-attribute dictionary and
//! has its own decoder. Loading a format 1 file yields a current config that the
//! writer re-saves.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use atomic_write_file::AtomicWriteFile;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{CONFIG_FILE, CONFIG_FORMAT, STORAGE_FILE};
use crate::error::{FramewiseError, Result};
use crate::schema::{FieldType, NumericKind, Schema};
use crate::storage::{SqliteReader, SqliteWriter};

/// Storage implementation bound to an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Sqlite,
}

impl StorageKind {
    #[must_use]
    pub fn store_path(self, index_dir: &Path) -> PathBuf {
        match self {
            StorageKind::Sqlite => index_dir.join(STORAGE_FILE),
        }
    }

    pub fn create_writer(self, index_dir: &Path) -> Result<SqliteWriter> {
        match self {
            StorageKind::Sqlite => SqliteWriter::create(&self.store_path(index_dir)),
        }
    }

    pub fn open_writer(self, index_dir: &Path) -> Result<SqliteWriter> {
        match self {
            StorageKind::Sqlite => SqliteWriter::open(&self.store_path(index_dir)),
        }
    }

    pub fn open_reader(self, index_dir: &Path) -> Result<SqliteReader> {
        match self {
            StorageKind::Sqlite => SqliteReader::open(&self.store_path(index_dir)),
        }
    }
}

/// Encoding a config was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Legacy,
    Current,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    pub storage: StorageKind,
    pub schema: Schema,
    /// Crate version that last wrote the config.
    pub version: String,
}

#[derive(Serialize, Deserialize)]
struct CurrentEnvelope {
    format: u32,
    storage: StorageKind,
    schema: Schema,
    version: String,
}

#[derive(Deserialize)]
struct LegacyEnvelope {
    #[serde(default)]
    storage: Option<String>,
    fields: BTreeMap<String, LegacyField>,
}

#[derive(Deserialize)]
struct LegacyField {
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    stored: bool,
    #[serde(default)]
    indexed: bool,
}

impl IndexConfig {
    #[must_use]
    pub fn new(schema: Schema) -> Self {
        Self {
            storage: StorageKind::default(),
            schema,
            version: crate::FRAMEWISE_CORE_VERSION.to_owned(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        let envelope = CurrentEnvelope {
            format: CONFIG_FORMAT,
            storage: self.storage,
            schema: self.schema.clone(),
            version: self.version.clone(),
        };
        Ok(serde_json::to_string_pretty(&envelope)?)
    }

    pub fn decode(text: &str) -> Result<(Self, ConfigFormat)> {
        let raw: Value = serde_json::from_str(text)?;
        let format = match raw.get("format") {
            None => 1,
            Some(tag) => tag.as_u64().ok_or_else(|| FramewiseError::InvalidConfig {
                reason: format!("format tag {tag} is not a number").into(),
            })?,
        };
        match format {
            1 => Ok((decode_legacy(raw)?, ConfigFormat::Legacy)),
            2 => Ok((decode_current(raw)?, ConfigFormat::Current)),
            other => Err(FramewiseError::InvalidConfig {
                reason: format!("unsupported config format {other}").into(),
            }),
        }
    }

    pub fn load(index_dir: &Path) -> Result<(Self, ConfigFormat)> {
        let path = index_dir.join(CONFIG_FILE);
        let text = match fs_err::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(FramewiseError::IndexNotFound {
                    path: index_dir.to_path_buf(),
                    reason: "no config file".into(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        Self::decode(&text)
    }

    /// Atomically replace the config file in `index_dir`.
    pub fn save(&self, index_dir: &Path) -> Result<()> {
        let encoded = self.encode()?;
        let mut file = AtomicWriteFile::open(index_dir.join(CONFIG_FILE))?;
        file.write_all(encoded.as_bytes())?;
        file.commit()?;
        Ok(())
    }

    #[must_use]
    pub fn exists(index_dir: &Path) -> bool {
        index_dir.join(CONFIG_FILE).is_file()
    }
}

fn decode_current(raw: Value) -> Result<IndexConfig> {
    let envelope: CurrentEnvelope = serde_json::from_value(raw)?;
    Ok(IndexConfig {
        storage: envelope.storage,
        schema: envelope.schema,
        version: envelope.version,
    })
}

fn decode_legacy(raw: Value) -> Result<IndexConfig> {
    let envelope: LegacyEnvelope = serde_json::from_value(raw)?;
    let storage = match envelope.storage.as_deref() {
        None | Some("sqlite" | "SqliteStorage") => StorageKind::Sqlite,
        Some(other) => {
            return Err(FramewiseError::InvalidConfig {
                reason: format!("unknown storage '{other}'").into(),
            });
        }
    };

    let mut schema = Schema::new();
    for (name, legacy) in envelope.fields {
        let field = match legacy.field_type.to_ascii_uppercase().as_str() {
            "TEXT" => FieldType::text(),
            "CATEGORICAL_TEXT" | "ID" | "KEYWORD" => FieldType::categorical(),
            "NUMERIC" => FieldType::numeric(NumericKind::Float),
            "DATETIME" | "DATE" => FieldType::date(),
            "BOOLEAN" => FieldType::boolean(),
            other => {
                return Err(FramewiseError::InvalidConfig {
                    reason: format!("unknown legacy field type '{other}' for '{name}'").into(),
                });
            }
        };
        schema.add(
            name,
            field.with_stored(legacy.stored).with_indexed(legacy.indexed),
        )?;
    }

    Ok(IndexConfig {
        storage,
        schema,
        version: crate::FRAMEWISE_CORE_VERSION.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;
    use tempfile::TempDir;

    #[test]
    fn current_format_is_tagged() {
        let config = IndexConfig::new(Schema::builder().add_text_field("text").build());
        let encoded = config.encode().unwrap();
        let raw: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(raw["format"], 2);

        let (decoded, format) = IndexConfig::decode(&encoded).unwrap();
        assert_eq!(format, ConfigFormat::Current);
        assert_eq!(decoded, config);
    }

    #[test]
    fn legacy_dictionary_is_reconstructed() {
        let legacy = r#"{
            "fields": {
                "text": {"type": "TEXT", "stored": true, "indexed": true},
                "author": {"type": "CATEGORICAL_TEXT", "stored": true, "indexed": true},
                "raw": {"type": "TEXT", "stored": true, "indexed": false}
            }
        }"#;
        let (config, format) = IndexConfig::decode(legacy).unwrap();
        assert_eq!(format, ConfigFormat::Legacy);
        assert_eq!(config.storage, StorageKind::Sqlite);
        assert!(config.schema.get("author").unwrap().categorical());
        assert!(!config.schema.get("raw").unwrap().indexed());
        assert_eq!(config.schema.unstructured_fields(), vec!["text"]);
    }

    #[test]
    fn unknown_format_is_rejected() {
        let err = IndexConfig::decode(r#"{"format": 9}"#).unwrap_err();
        assert!(matches!(err, FramewiseError::InvalidConfig { .. }));
    }

    #[test]
    fn save_and_load_roundtrip_through_disk() {
        let dir = TempDir::new().unwrap();
        let config = IndexConfig::new(Schema::builder().add_categorical_field("tag").build());
        config.save(dir.path()).unwrap();
        assert!(IndexConfig::exists(dir.path()));
        let (loaded, _) = IndexConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_config_is_index_not_found() {
        let dir = TempDir::new().unwrap();
        let err = IndexConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, FramewiseError::IndexNotFound { .. }));
    }
}
