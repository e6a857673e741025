//! Table and index definitions, applied idempotently at open.

pub(crate) const SCHEMA: &str = r#"
CREATE SEQUENCE IF NOT EXISTS ida_frozen_file_id_seq START 1;
CREATE SEQUENCE IF NOT EXISTS ida_data_change_id_seq START 1;

CREATE TABLE IF NOT EXISTS ida_action (
    pid TEXT NOT NULL,
    action TEXT NOT NULL,
    project TEXT NOT NULL,
    "user" TEXT NOT NULL,
    pathname TEXT NOT NULL,
    node BIGINT NOT NULL,
    nodetype TEXT,
    filecount BIGINT,
    initiated TEXT NOT NULL,
    storage TEXT,
    pids TEXT NOT NULL,
    checksums TEXT NOT NULL,
    metadata TEXT NOT NULL,
    replication TEXT NOT NULL,
    progress TEXT NOT NULL,
    completed TEXT,
    failed TEXT,
    cleared TEXT,
    error TEXT,
    retry TEXT,
    retrying TEXT,
    cancel_requested TEXT,
    lease TEXT,
    heartbeat TEXT,
    version BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS ida_action_pid_idx ON ida_action (pid);
CREATE INDEX IF NOT EXISTS ida_action_project_idx ON ida_action (project);
CREATE INDEX IF NOT EXISTS ida_action_storage_idx ON ida_action (storage);
CREATE INDEX IF NOT EXISTS ida_action_completed_idx ON ida_action (completed);
CREATE INDEX IF NOT EXISTS ida_action_failed_idx ON ida_action (failed);
CREATE INDEX IF NOT EXISTS ida_action_cleared_idx ON ida_action (cleared);

CREATE TABLE IF NOT EXISTS ida_frozen_file (
    id BIGINT NOT NULL,
    node BIGINT NOT NULL,
    action TEXT NOT NULL,
    project TEXT NOT NULL,
    pathname TEXT NOT NULL,
    pid TEXT NOT NULL,
    size BIGINT NOT NULL,
    checksum TEXT,
    modified TEXT,
    frozen TEXT,
    replicated TEXT,
    removed TEXT,
    cleared TEXT
);

CREATE INDEX IF NOT EXISTS ida_frozen_file_id_idx ON ida_frozen_file (id);
CREATE INDEX IF NOT EXISTS ida_frozen_file_node_idx ON ida_frozen_file (node);
CREATE INDEX IF NOT EXISTS ida_frozen_file_pid_idx ON ida_frozen_file (pid);
CREATE INDEX IF NOT EXISTS ida_frozen_file_action_idx ON ida_frozen_file (action);
CREATE INDEX IF NOT EXISTS ida_frozen_file_project_idx ON ida_frozen_file (project);
CREATE INDEX IF NOT EXISTS ida_frozen_file_removed_idx ON ida_frozen_file (removed);

CREATE TABLE IF NOT EXISTS ida_data_change (
    id BIGINT NOT NULL,
    "timestamp" TEXT NOT NULL,
    project TEXT NOT NULL,
    "user" TEXT NOT NULL,
    change TEXT NOT NULL,
    pathname TEXT NOT NULL,
    target TEXT,
    mode TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS ida_data_change_init_idx ON ida_data_change (project, change, "timestamp");
CREATE INDEX IF NOT EXISTS ida_data_change_last_idx ON ida_data_change (project, "timestamp");
"#;
