//! Content database schema, expressed as migrations.

use super::migrate::{Migration, SqlMigration};

const CONTENT: SqlMigration = SqlMigration {
    name: "0001_content",
    sql: "
        CREATE TABLE content_version (
            id INTEGER PRIMARY KEY,
            fork_id TEXT NOT NULL,
            fork_version TEXT NOT NULL,
            hash BLOB NOT NULL,
            last_used TEXT NOT NULL
        );

        CREATE TABLE content (
            id INTEGER PRIMARY KEY,
            hash BLOB NOT NULL,
            size INTEGER NOT NULL,
            compression INTEGER NOT NULL,
            data BLOB NOT NULL
        );

        CREATE TABLE content_manifest (
            version_id INTEGER NOT NULL REFERENCES content_version (id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            content_id INTEGER NOT NULL REFERENCES content (id),
            PRIMARY KEY (version_id, path)
        ) WITHOUT ROWID;

        CREATE INDEX content_hash ON content (hash, size);
        CREATE INDEX content_manifest_content ON content_manifest (content_id);
    ",
};

const VERSION_LOOKUP: SqlMigration = SqlMigration {
    name: "0002_content_version_lookup",
    sql: "
        CREATE INDEX content_version_fork ON content_version (fork_id, fork_version);
        CREATE INDEX content_version_last_used ON content_version (last_used);
    ",
};

/// Every content database migration.
pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(CONTENT), Box::new(VERSION_LOOKUP)]
}
