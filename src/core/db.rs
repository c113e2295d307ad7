use tokio_rusqlite::Connection;

pub async fn async_db(db_path: &str) -> Result<Connection, tokio_rusqlite::Error> {
    Connection::open(db_path).await
}

/// Creates the conversation history table if it doesn't already
/// exist. Safe to run any number of times.
pub fn initialize_db(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            model TEXT NOT NULL,
            max_tokens INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL
        );
        ",
    )
}
