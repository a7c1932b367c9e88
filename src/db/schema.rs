//! Database schema and migrations for Hoard.
//!
//! Migrations are applied sequentially when the database is first opened or
//! upgraded. Timestamps are always written by the engine as RFC 3339 UTC text.

/// Database migrations.
///
/// Each migration is a SQL script that will be executed in order.
/// The schema_version table tracks which migrations have been applied.
pub const MIGRATIONS: &[&str] = &[
    // v1: Owners with quota fields
    r#"
CREATE TABLE owners (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    username    TEXT NOT NULL UNIQUE,
    total_size  INTEGER NOT NULL,
    used_size   INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    CHECK (used_size >= 0)
);
"#,
    // v2: Storage policies
    r#"
CREATE TABLE storage_policies (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    policy_type TEXT NOT NULL,          -- 'local', 's3', 'oss', 'cos', 'sftp', 'onedrive'
    config      TEXT NOT NULL DEFAULT '{}',
    is_default  INTEGER NOT NULL DEFAULT 0,
    status      INTEGER NOT NULL DEFAULT 1,  -- 1 enabled, 0 disabled
    base_url    TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX idx_storage_policies_default ON storage_policies(is_default, status);
"#,
    // v3: File tree nodes
    r#"
CREATE TABLE files (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    size        INTEGER NOT NULL DEFAULT 0,
    hash        TEXT,
    path        TEXT,
    ext         TEXT NOT NULL DEFAULT '',
    is_folder   INTEGER NOT NULL DEFAULT 0,
    parent_id   INTEGER NOT NULL DEFAULT 0,  -- 0 = namespace root
    owner_id    INTEGER NOT NULL REFERENCES owners(id),
    policy_id   INTEGER NOT NULL DEFAULT 0,
    is_favorite INTEGER NOT NULL DEFAULT 0,
    deleted_at  TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX idx_files_owner_parent ON files(owner_id, parent_id);
CREATE INDEX idx_files_hash ON files(hash);
CREATE INDEX idx_files_policy_path ON files(policy_id, path);
CREATE INDEX idx_files_deleted_at ON files(deleted_at);
"#,
    // v4: Content versions
    r#"
CREATE TABLE file_versions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id     INTEGER NOT NULL,
    size        INTEGER NOT NULL,
    path        TEXT NOT NULL,
    hash        TEXT NOT NULL,
    policy_id   INTEGER NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX idx_file_versions_file_id ON file_versions(file_id);
"#,
];
