pub mod connection;
pub mod migrate;

pub use connection::{create_pool, DbPool};

use crate::error::Result;
use rusqlite::Connection;

/// Run blocking store work on the blocking pool with a pooled connection.
pub async fn with_conn<T, F>(db: &DbPool, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = db.get()?;
        f(&mut conn)
    })
    .await?
}
