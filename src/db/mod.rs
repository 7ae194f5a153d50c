pub mod schema;

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// How long a writer waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the SQLite database at `path` and run migrations.
///
/// The parent directory must already exist.
pub fn open(path: &Path) -> rusqlite::Result<Connection> {
  let conn = Connection::open(path)?;
  conn.busy_timeout(BUSY_TIMEOUT)?;
  migrate(&conn)?;
  Ok(conn)
}

/// Open a private in-memory database with the same schema.
pub fn open_in_memory() -> rusqlite::Result<Connection> {
  let conn = Connection::open_in_memory()?;
  migrate(&conn)?;
  Ok(conn)
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
  conn.execute_batch(schema::SCHEMA)
}
