//! SQL for the writer's in-memory staging store and for the commit flush.
//!
//! During a flush the on-disk store is attached as `disk_index`; unqualified
//! table names refer to the staging store.

/// Staging tables. IDs here are transaction-local and zero-based.
pub(crate) const STAGING_SCHEMA: &str = "
    create table document (id integer primary key, stored text not null);
    create table document_data (
        document_id integer not null,
        field_name text not null,
        value
    );
    create table frame (
        id integer primary key,
        document_id integer not null,
        field_name text not null,
        sequence integer not null,
        stored text
    );
    create table frame_term (
        frame_id integer not null,
        term text not null,
        position integer not null
    );
    create table structured_field (name text primary key);
    create table unstructured_field (name text primary key);
    create table attribute_update (
        id integer primary key,
        frame_id integer not null,
        type text not null,
        value not null
    );
    create table deleted_document (id integer primary key);
    create table plugin_update (
        plugin_type text not null,
        settings text not null,
        primary key (plugin_type, settings)
    );
    create table plugin_state (
        plugin_type text not null,
        settings text not null,
        key text not null,
        value text not null
    );
    create table plugin_delete (plugin_type text not null, settings text);
    create table setting (id integer primary key, name text not null, value text not null);

    create table flush_posting (
        frame_id integer not null,
        term_id integer not null,
        position integer not null
    );
    create table flush_deleted_frame (frame_id integer primary key, field_id integer not null);
    create table flush_statistics_delta (
        term_id integer not null,
        field_id integer not null,
        frames integer not null,
        frequency integer not null,
        primary key (term_id, field_id)
    );
";

pub(crate) const CLEAR_STAGING: &str = "
    delete from document;
    delete from document_data;
    delete from frame;
    delete from frame_term;
    delete from structured_field;
    delete from unstructured_field;
    delete from attribute_update;
    delete from deleted_document;
    delete from plugin_update;
    delete from plugin_state;
    delete from plugin_delete;
    delete from setting;
    delete from flush_posting;
    delete from flush_deleted_frame;
    delete from flush_statistics_delta;
";

pub(crate) const LATEST_REVISION: &str = "
    select revision_number, added_document_count, deleted_document_count, added_frame_count
    from disk_index.index_revision
    order by revision_number desc
    limit 1
";

pub(crate) const PENDING_DELETES: &str = "
    select id from deleted_document
    where id in (select id from disk_index.document)
    order by id
";

/// Remove deleted documents and everything keyed by their frames. Term
/// postings stay; every reader query reaches them through `frame`.
pub(crate) const FLUSH_DELETES: &str = "
    insert into flush_deleted_frame (frame_id, field_id)
        select id, field_id from disk_index.frame
        where document_id in (select id from deleted_document);

    insert into flush_statistics_delta (term_id, field_id, frames, frequency)
        select fp.term_id, df.field_id, count(distinct fp.frame_id), count(*)
        from disk_index.frame_posting fp
        inner join flush_deleted_frame df on df.frame_id = fp.frame_id
        group by fp.term_id, df.field_id;

    update disk_index.term_statistics as ts
        set frames_occurring = ts.frames_occurring - d.frames,
            frequency = ts.frequency - d.frequency
        from flush_statistics_delta d
        where d.term_id = ts.term_id and d.field_id = ts.field_id;

    update disk_index.field_statistics as fs
        set frame_count = fs.frame_count - d.frames
        from (select field_id, count(*) as frames from flush_deleted_frame group by field_id) d
        where d.field_id = fs.field_id;

    delete from disk_index.frame_posting
        where frame_id in (select frame_id from flush_deleted_frame);
    delete from disk_index.frame_length
        where frame_id in (select frame_id from flush_deleted_frame);
    delete from disk_index.attribute_posting
        where frame_id in (select frame_id from flush_deleted_frame);
    delete from disk_index.frame
        where id in (select frame_id from flush_deleted_frame);
    delete from disk_index.document_data
        where document_id in (select id from deleted_document);
    insert or ignore into disk_index.deleted_document (id)
        select id from deleted_document where id in (select id from disk_index.document);
    delete from disk_index.document
        where id in (select id from deleted_document);
";

pub(crate) const FLUSH_FIELDS: &str = "
    insert or ignore into disk_index.structured_field (name) select name from structured_field;
    insert or ignore into disk_index.structured_field (name)
        select distinct field_name from document_data;
    insert or ignore into disk_index.unstructured_field (name) select name from unstructured_field;
    insert or ignore into disk_index.unstructured_field (name)
        select distinct field_name from frame;
";

/// `?1` = document id offset.
pub(crate) const FLUSH_DOCUMENTS: &str = "
    insert into disk_index.document (id, stored)
        select id + ?1, stored from document order by id
";

/// `?1` = document id offset.
pub(crate) const FLUSH_DOCUMENT_DATA: &str = "
    insert into disk_index.document_data (document_id, field_id, value)
        select dd.document_id + ?1, sf.id, dd.value
        from document_data dd
        inner join disk_index.structured_field sf on sf.name = dd.field_name
";

/// `?1` = frame id offset, `?2` = document id offset.
pub(crate) const FLUSH_FRAMES: &str = "
    insert into disk_index.frame (id, document_id, field_id, sequence, stored)
        select f.id + ?1, f.document_id + ?2, uf.id, f.sequence, f.stored
        from frame f
        inner join disk_index.unstructured_field uf on uf.name = f.field_name
        order by f.id
";

pub(crate) const FLUSH_VOCABULARY: &str = "
    insert or ignore into disk_index.vocabulary (term) select distinct term from frame_term
";

/// `?1` = frame id offset.
pub(crate) const FLUSH_RESOLVE_POSTINGS: &str = "
    insert into flush_posting (frame_id, term_id, position)
        select ft.frame_id + ?1, v.id, ft.position
        from frame_term ft
        inner join disk_index.vocabulary v on v.term = ft.term
";

pub(crate) const FLUSH_POSTINGS: &str = "
    insert into disk_index.term_posting (term_id, frame_id, position)
        select term_id, frame_id, position from flush_posting
        order by term_id, frame_id, position;
    insert into disk_index.frame_posting (frame_id, position, term_id)
        select frame_id, position, term_id from flush_posting
        order by frame_id, position;
    insert into disk_index.term_statistics (term_id, field_id, frames_occurring, frequency)
        select p.term_id, fr.field_id, count(distinct p.frame_id), count(*)
        from flush_posting p
        inner join disk_index.frame fr on fr.id = p.frame_id
        where true
        group by p.term_id, fr.field_id
        on conflict (term_id, field_id) do update set
            frames_occurring = frames_occurring + excluded.frames_occurring,
            frequency = frequency + excluded.frequency;
    insert into disk_index.field_statistics (field_id, frame_count)
        select uf.id, count(*)
        from frame f
        inner join disk_index.unstructured_field uf on uf.name = f.field_name
        where true
        group by uf.id
        on conflict (field_id) do update set
            frame_count = frame_count + excluded.frame_count;
";

/// `?1` = frame id offset.
pub(crate) const FLUSH_FRAME_LENGTHS: &str = "
    insert into disk_index.frame_length (frame_id, n_positions)
        select f.id + ?1, count(ft.frame_id)
        from frame f
        left join frame_term ft on ft.frame_id = f.id
        group by f.id
";

/// The newest staged value per (frame, type) replaces any committed one.
pub(crate) const FLUSH_ATTRIBUTES: &str = "
    delete from attribute_update where frame_id not in (select id from disk_index.frame);
    delete from attribute_update
        where id not in (select max(id) from attribute_update group by frame_id, type);

    insert or ignore into disk_index.attribute (type, value)
        select distinct type, value from attribute_update;

    delete from disk_index.attribute_posting
        where (frame_id, attribute_id) in (
            select ap.frame_id, ap.attribute_id
            from disk_index.attribute_posting ap
            inner join disk_index.attribute a on a.id = ap.attribute_id
            inner join attribute_update u on u.frame_id = ap.frame_id and u.type = a.type
        );

    insert or ignore into disk_index.attribute_posting (frame_id, attribute_id)
        select u.frame_id, a.id
        from attribute_update u
        inner join disk_index.attribute a on a.type = u.type and a.value = u.value;
";

pub(crate) const FLUSH_PLUGINS: &str = "
    delete from disk_index.plugin_data where plugin_id in (
        select r.plugin_id from disk_index.plugin_registry r
        inner join plugin_delete d
            on d.plugin_type = r.plugin_type and (d.settings is null or d.settings = r.settings)
    );
    delete from disk_index.plugin_registry where plugin_id in (
        select r.plugin_id from disk_index.plugin_registry r
        inner join plugin_delete d
            on d.plugin_type = r.plugin_type and (d.settings is null or d.settings = r.settings)
    );

    insert or ignore into disk_index.plugin_registry (plugin_type, settings)
        select plugin_type, settings from plugin_update;
    delete from disk_index.plugin_data where plugin_id in (
        select r.plugin_id from disk_index.plugin_registry r
        inner join plugin_update u on u.plugin_type = r.plugin_type and u.settings = r.settings
    );
    insert into disk_index.plugin_data (plugin_id, key, value)
        select r.plugin_id, s.key, s.value
        from plugin_state s
        inner join disk_index.plugin_registry r
            on r.plugin_type = s.plugin_type and r.settings = s.settings;
";

pub(crate) const UPDATED_PLUGINS: &str = "
    select r.plugin_id from disk_index.plugin_registry r
    inner join plugin_update u on u.plugin_type = r.plugin_type and u.settings = r.settings
    order by r.plugin_id
";

pub(crate) const FLUSH_SETTINGS: &str = "
    insert or replace into disk_index.setting (name, value)
        select name, value from setting order by id
";

/// `?1` revision, `?2` added documents, `?3` deleted documents, `?4` added frames.
pub(crate) const RECORD_REVISION: &str = "
    insert into disk_index.index_revision
        (revision_number, added_document_count, deleted_document_count, added_frame_count)
    values (?1, ?2, ?3, ?4)
";
