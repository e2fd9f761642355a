//! Expiration passes: drop stale URL cache rows, then packages without
//! a set membership, then the contents and Java class rows nothing
//! references anymore. The order matters, each pass exposes orphans for
//! the next one.

use anyhow::Result;
use log::info;

use crate::db::{self, Database};

async fn expire_packages(db: &Database) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM symboldb.package p \
         WHERE NOT EXISTS (SELECT 1 FROM symboldb.package_set_member psm \
         WHERE psm.package_id = p.package_id LIMIT 1)",
    )
    .execute(db.pool())
    .await?;
    Ok(result.rows_affected())
}

async fn expire_file_contents(db: &Database) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM symboldb.file_contents fc \
         WHERE NOT EXISTS (SELECT 1 FROM symboldb.file f \
         WHERE f.contents_id = fc.contents_id LIMIT 1)",
    )
    .execute(db.pool())
    .await?;
    Ok(result.rows_affected())
}

async fn expire_java_classes(db: &Database) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM symboldb.java_class jc \
         WHERE NOT EXISTS (SELECT 1 FROM symboldb.java_class_contents j \
         WHERE j.class_id = jc.class_id LIMIT 1)",
    )
    .execute(db.pool())
    .await?;
    Ok(result.rows_affected())
}

/// Execute all expiration passes.
pub async fn run_expire(db: &Database) -> Result<()> {
    info!("expiring URL cache entries ...");
    db::expire_url_cache(db.pool()).await?;
    info!("expiring unreferenced packages ...");
    let packages = expire_packages(db).await?;
    info!("expiring orphaned file contents ...");
    let contents = expire_file_contents(db).await?;
    info!("expiring orphaned Java classes ...");
    let classes = expire_java_classes(db).await?;
    info!(
        "expired {} packages, {} contents rows, {} classes.",
        packages, contents, classes
    );
    Ok(())
}
