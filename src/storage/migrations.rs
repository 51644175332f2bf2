//! Numbered, forward-only schema upgrades for the on-disk store.
//!
//! Each step runs in its own transaction together with the row recording it in
//! `migrations`, so a failing step leaves the store at the previous version.

use rusqlite::{Connection, Transaction, params};

use crate::error::{FramewiseError, Result};

/// Schema version this build reads and writes.
pub const CURRENT_SCHEMA: u32 = 4;

pub type MigrationStep = fn(&Transaction<'_>) -> Result<()>;

#[derive(Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    apply: MigrationStep,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

impl Migration {
    #[must_use]
    pub fn new(version: u32, description: &'static str, apply: MigrationStep) -> Self {
        Self {
            version,
            description,
            apply,
        }
    }
}

/// Ordered migration steps.
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    steps: Vec<Migration>,
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl MigrationRegistry {
    #[must_use]
    pub fn new(mut steps: Vec<Migration>) -> Self {
        steps.sort_by_key(|step| step.version);
        Self { steps }
    }

    /// The steps shipped with this build, ending at [`CURRENT_SCHEMA`].
    #[must_use]
    pub fn standard() -> Self {
        Self::new(vec![
            Migration::new(1, "documents, frames, vocabulary and term postings", core_tables),
            Migration::new(2, "frame-ordered postings and frame lengths", frame_postings),
            Migration::new(3, "term and field statistics", statistics),
            Migration::new(4, "frame attributes", attributes),
        ])
    }

    /// Keep only the steps up to and including `version`.
    #[must_use]
    pub fn up_to(mut self, version: u32) -> Self {
        self.steps.retain(|step| step.version <= version);
        self
    }

    #[must_use]
    pub fn with_step(mut self, step: Migration) -> Self {
        self.steps.retain(|existing| existing.version != step.version);
        self.steps.push(step);
        self.steps.sort_by_key(|step| step.version);
        self
    }

    #[must_use]
    pub fn latest(&self) -> u32 {
        self.steps.last().map_or(0, |step| step.version)
    }

    #[must_use]
    pub fn steps(&self) -> &[Migration] {
        &self.steps
    }
}

/// Version recorded in `database` (`main` or an attached name), `-1` when the
/// store has never been migrated.
pub(crate) fn schema_version(conn: &Connection, database: &str) -> Result<i64> {
    let has_table: i64 = conn.query_row(
        &format!(
            "select count(*) from {database}.sqlite_master where type = 'table' and name = 'migrations'"
        ),
        [],
        |row| row.get(0),
    )?;
    if has_table == 0 {
        return Ok(-1);
    }
    let version: Option<i64> = conn.query_row(
        &format!("select max(id) from {database}.migrations"),
        [],
        |row| row.get(0),
    )?;
    Ok(version.unwrap_or(-1))
}

/// Bring the store up to `registry.latest()`, returning the resulting version.
pub(crate) fn run(conn: &mut Connection, registry: &MigrationRegistry) -> Result<i64> {
    let on_disk = schema_version(conn, "main")?;
    let target = registry.latest();
    if on_disk == i64::from(target) {
        return Ok(on_disk);
    }
    if on_disk > i64::from(target) {
        return Err(FramewiseError::SchemaMismatch {
            on_disk,
            expected: target,
        });
    }

    tracing::info!(from = on_disk, to = target, "migrating store");
    let mut last_successful = on_disk;
    for step in registry
        .steps()
        .iter()
        .filter(|step| i64::from(step.version) > on_disk)
    {
        let applied = conn.transaction().map_err(FramewiseError::from).and_then(|tx| {
            (step.apply)(&tx)?;
            tx.execute(
                "insert into migrations (id, description) values (?1, ?2)",
                params![step.version, step.description],
            )?;
            tx.commit()?;
            Ok(())
        });
        if let Err(err) = applied {
            tracing::warn!(version = step.version, %err, "migration step failed");
            return Err(FramewiseError::MigrationFailed {
                from: on_disk,
                to: target,
                failed_at: step.version,
                last_successful,
                reason: err.to_string(),
            });
        }
        tracing::debug!(version = step.version, description = step.description, "migration applied");
        last_successful = i64::from(step.version);
    }
    Ok(last_successful)
}

fn core_tables(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "
        create table migrations (
            id integer primary key,
            description text not null,
            applied_at text not null default (datetime('now'))
        );
        create table setting (name text primary key, value text not null);
        create table structured_field (id integer primary key, name text not null unique);
        create table unstructured_field (id integer primary key, name text not null unique);

        create table document (id integer primary key, stored text not null);
        create table deleted_document (id integer primary key);
        create table document_data (
            document_id integer not null,
            field_id integer not null,
            value
        );
        create index document_data_field_value on document_data (field_id, value);
        create index document_data_document on document_data (document_id);

        create table frame (
            id integer primary key,
            document_id integer not null,
            field_id integer not null,
            sequence integer not null,
            stored text
        );
        create index frame_document on frame (document_id);
        create index frame_field on frame (field_id);

        create table vocabulary (id integer primary key, term text not null unique);
        create table term_posting (
            term_id integer not null,
            frame_id integer not null,
            position integer not null,
            primary key (term_id, frame_id, position)
        ) without rowid;

        create table plugin_registry (
            plugin_id integer primary key,
            plugin_type text not null,
            settings text not null,
            unique (plugin_type, settings)
        );
        create table plugin_data (
            plugin_id integer not null,
            key text not null,
            value text not null,
            primary key (plugin_id, key)
        ) without rowid;

        create table index_revision (
            revision_number integer primary key,
            added_document_count integer not null,
            deleted_document_count integer not null
        );
        insert into index_revision values (0, 0, 0);
        ",
    )?;
    Ok(())
}

fn frame_postings(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "
        create table frame_posting (
            frame_id integer not null,
            position integer not null,
            term_id integer not null,
            primary key (frame_id, position)
        ) without rowid;
        insert or ignore into frame_posting (frame_id, position, term_id)
            select frame_id, position, term_id from term_posting
            where frame_id in (select id from frame);

        create table frame_length (frame_id integer primary key, n_positions integer not null);
        insert into frame_length (frame_id, n_positions)
            select frame.id, count(frame_posting.frame_id)
            from frame left join frame_posting on frame_posting.frame_id = frame.id
            group by frame.id;

        alter table index_revision add column added_frame_count integer not null default 0;
        update index_revision set added_frame_count = (select coalesce(max(id), 0) from frame);
        ",
    )?;
    Ok(())
}

fn statistics(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "
        create table term_statistics (
            term_id integer not null,
            field_id integer not null,
            frames_occurring integer not null,
            frequency integer not null,
            primary key (term_id, field_id)
        ) without rowid;
        insert into term_statistics (term_id, field_id, frames_occurring, frequency)
            select fp.term_id, frame.field_id, count(distinct fp.frame_id), count(*)
            from frame_posting fp inner join frame on frame.id = fp.frame_id
            group by fp.term_id, frame.field_id;

        create table field_statistics (field_id integer primary key, frame_count integer not null);
        insert into field_statistics (field_id, frame_count)
            select field_id, count(*) from frame group by field_id;
        ",
    )?;
    Ok(())
}

fn attributes(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "
        create table attribute (
            id integer primary key,
            type text not null,
            value not null,
            unique (type, value)
        );
        create table attribute_posting (
            frame_id integer not null,
            attribute_id integer not null,
            primary key (frame_id, attribute_id)
        ) without rowid;
        create index attribute_posting_attribute on attribute_posting (attribute_id, frame_id);
        ",
    )?;
    Ok(())
}
