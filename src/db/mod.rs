//! PostgreSQL access: connection pool, transactions, advisory locks and
//! the URL cache. All catalogue rows live in the `symboldb` schema.

use anyhow::Result;
use log::{debug, warn};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Connection, Postgres, Row, Transaction};

pub mod ops;

const SCHEMA_BASE: &str = include_str!("../../sql/schema-base.sql");
const SCHEMA_INDEX: &str = include_str!("../../sql/schema-index.sql");

/// Lock tag for package-set updates; digest locks use the leading bytes
/// of the digest itself.
pub const PACKAGE_SET_LOCK_TAG: i32 = 0x70736574;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub i32);

        impl $name {
            pub fn value(self) -> i32 {
                self.0
            }
        }
    };
}

id_type!(PackageId);
id_type!(FileId);
id_type!(ContentsId);
id_type!(AttributeId);
id_type!(PackageSetId);
id_type!(ClassId);

/// Derive the advisory lock key pair from a digest prefix.
pub fn digest_lock_keys(digest: &[u8]) -> (i32, i32) {
    let mut padded = [0u8; 8];
    let n = digest.len().min(8);
    padded[..n].copy_from_slice(&digest[..n]);
    (
        i32::from_be_bytes([padded[0], padded[1], padded[2], padded[3]]),
        i32::from_be_bytes([padded[4], padded[5], padded[6], padded[7]]),
    )
}

pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(conninfo: &str) -> Result<Database> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(conninfo)
            .await?;
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Open a transaction with synchronous commit disabled, for bulk
    /// package loads where losing the tail on a crash is acceptable.
    pub async fn begin_no_sync(&self) -> Result<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET LOCAL synchronous_commit TO OFF")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Acquire a session-scoped advisory lock on a dedicated
    /// connection. Inside a transaction use [`xact_lock`] instead; a
    /// session lock cannot be released from an aborted transaction.
    pub async fn session_lock(&self, a: i32, b: i32) -> Result<SessionLock> {
        let mut conn = self.pool.acquire().await?.detach();
        sqlx::query("SELECT pg_advisory_lock($1, $2)")
            .bind(a)
            .bind(b)
            .execute(&mut conn)
            .await?;
        Ok(SessionLock {
            conn: Some(conn),
            a,
            b,
        })
    }

    pub async fn session_lock_digest(&self, digest: &[u8]) -> Result<SessionLock> {
        let (a, b) = digest_lock_keys(digest);
        self.session_lock(a, b).await
    }

    pub async fn create_schema(&self, base: bool, index: bool) -> Result<()> {
        let mut tx = self.begin().await?;
        if base {
            exec_script(&mut tx, SCHEMA_BASE).await?;
        }
        if index {
            exec_script(&mut tx, SCHEMA_INDEX).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Transaction-scoped advisory lock, released at commit or rollback.
pub async fn xact_lock(conn: &mut PgConnection, a: i32, b: i32) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
        .bind(a)
        .bind(b)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn xact_lock_digest(conn: &mut PgConnection, digest: &[u8]) -> Result<()> {
    let (a, b) = digest_lock_keys(digest);
    xact_lock(conn, a, b).await
}

/// Guard owning the connection that holds a session advisory lock.
/// Dropping the guard closes the connection, which releases the lock on
/// the server side; `release` unlocks explicitly.
pub struct SessionLock {
    conn: Option<PgConnection>,
    a: i32,
    b: i32,
}

impl SessionLock {
    pub async fn release(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            let unlocked: bool = sqlx::query("SELECT pg_advisory_unlock($1, $2)")
                .bind(self.a)
                .bind(self.b)
                .fetch_one(&mut conn)
                .await?
                .get(0);
            if !unlocked {
                warn!("advisory lock ({}, {}) was not held", self.a, self.b);
            }
            conn.close().await.ok();
        }
        Ok(())
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(
                "releasing advisory lock ({}, {}) by closing its connection",
                self.a, self.b
            );
            drop(conn);
        }
    }
}

/// Split an SQL script on top-level semicolons so progress is visible
/// per statement, then run each statement.
pub async fn exec_script(tx: &mut Transaction<'_, Postgres>, script: &str) -> Result<()> {
    for stmt in split_statements(script) {
        sqlx::query(&stmt).execute(&mut **tx).await?;
    }
    Ok(())
}

fn split_statements(script: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut in_comment = false;
    let mut chars = script.chars().peekable();
    while let Some(c) = chars.next() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
                current.push(c);
            }
            continue;
        }
        match c {
            '\'' => {
                in_string = !in_string;
                current.push(c);
            }
            '-' if !in_string && chars.peek() == Some(&'-') => {
                chars.next();
                in_comment = true;
            }
            ';' if !in_string => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    out.push(stmt.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let stmt = current.trim();
    if !stmt.is_empty() {
        out.push(stmt.to_string());
    }
    out
}

// URL cache operations. Rows expire three days after their last access.

pub async fn url_cache_fetch_checked(
    pool: &PgPool,
    url: &str,
    expected_length: usize,
    expected_time: i64,
) -> Result<Option<Vec<u8>>> {
    if expected_length > 1 << 30 {
        return Ok(None);
    }
    let row = sqlx::query(
        "SELECT data FROM symboldb.url_cache \
         WHERE url = $1 AND LENGTH(data) = $2 AND http_time = $3",
    )
    .bind(url)
    .bind(expected_length as i32)
    .bind(expected_time)
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => {
            touch_url(pool, url).await?;
            Ok(Some(row.get(0)))
        }
        None => Ok(None),
    }
}

pub async fn url_cache_fetch(pool: &PgPool, url: &str) -> Result<Option<Vec<u8>>> {
    let row = sqlx::query("SELECT data FROM symboldb.url_cache WHERE url = $1")
        .bind(url)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => {
            touch_url(pool, url).await?;
            Ok(Some(row.get(0)))
        }
        None => Ok(None),
    }
}

async fn touch_url(pool: &PgPool, url: &str) -> Result<()> {
    sqlx::query(
        "UPDATE symboldb.url_cache \
         SET last_access = NOW() AT TIME ZONE 'UTC' WHERE url = $1",
    )
    .bind(url)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn url_cache_update(
    pool: &PgPool,
    url: &str,
    data: &[u8],
    time: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO symboldb.url_cache (url, http_time, data, last_change, last_access) \
         VALUES ($1, $2, $3, NOW() AT TIME ZONE 'UTC', NOW() AT TIME ZONE 'UTC') \
         ON CONFLICT (url) DO UPDATE \
         SET http_time = $2, data = $3, \
         last_change = NOW() AT TIME ZONE 'UTC', \
         last_access = NOW() AT TIME ZONE 'UTC'",
    )
    .bind(url)
    .bind(time)
    .bind(data)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn expire_url_cache(pool: &PgPool) -> Result<()> {
    sqlx::query("DELETE FROM symboldb.url_cache WHERE AGE(last_access) > '3 days'")
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_lock_keys() {
        let digest = [
            0x01u8, 0x02, 0x03, 0x04, 0x80, 0x00, 0x00, 0x01, 0xff, 0xff,
        ];
        let (a, b) = digest_lock_keys(&digest);
        assert_eq!(a, 0x01020304);
        assert_eq!(b, -0x7fffffff);
        // Short digests are zero padded.
        assert_eq!(digest_lock_keys(&[0xff]), (-0x01000000, 0));
    }

    #[test]
    fn test_split_statements() {
        let script = "-- a comment; with a semicolon\n\
                      CREATE TABLE t (x TEXT DEFAULT 'a;b');\n\n\
                      CREATE INDEX i ON t (x);";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("'a;b'"));
        assert!(stmts[1].starts_with("CREATE INDEX"));
    }
}
