/// Schema shared by the queue log and the response cache.
pub const SCHEMA: &str = r#"
-- Append-only log of queue operations, one stream per namespace
CREATE TABLE IF NOT EXISTS queue_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT NOT NULL,
    payload BLOB NOT NULL,
    recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_queue_log_namespace ON queue_log(namespace, seq);

-- Named cache generations
CREATE TABLE IF NOT EXISTS cache_names (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored response snapshots keyed by request URL
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (cache_name, url_hash),
    FOREIGN KEY (cache_name) REFERENCES cache_names(name) ON DELETE CASCADE
);
"#;
