//! Catalog: the SQLite store of tracked local files and uploaded blobs.
//!
//! Every read is an explicit query returning plain value structs; foreign keys
//! travel between calls as integer ids. Each public method is one transaction,
//! so a reader never observes a blob that is inserted but not yet attached.
//! The schema is created or upgraded when the catalog is opened.

use crate::models::{BackupBlob, FileSnapshot, LocalFileEntry};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    str::FromStr,
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, info};

/// Embedded schema migrations, applied in order. The SQLite `user_version`
/// pragma records how many have run.
const MIGRATIONS: [(&str, &str); 2] = [
    ("0001_init", include_str!("../../migrations/0001_init.sql")),
    (
        "0002_metadata_cache",
        include_str!("../../migrations/0002_metadata_cache.sql"),
    ),
];

const LOCAL_COLUMNS: &str = "id, local_path, backup_blob_id, cached_mtime, cached_size";
const BLOB_COLUMNS: &str = "id, object_key, uploaded_digest, original_digest";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("local file entry {0} not found")]
    LocalNotFound(i64),
    #[error("backup blob {0} not found")]
    BlobNotFound(i64),
    #[error("migration `{name}` failed: {source}")]
    Migration {
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Blob id → entries sharing it. `None` groups entries with no blob yet.
pub type DuplicateGroups = BTreeMap<Option<i64>, Vec<LocalFileEntry>>;

/// Handle to the catalog. Cheap to clone.
#[derive(Clone)]
pub struct Catalog {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl Catalog {
    /// Open the catalog at `path`, or an ephemeral in-memory catalog when
    /// `path` is `None`. Missing parent directories are created.
    pub async fn open(path: Option<&Path>) -> CatalogResult<Self> {
        let pool = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
                        info!("Created catalog directory {}", parent.display());
                    }
                }
                debug!("Opening catalog at {}", path.display());
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .foreign_keys(true);
                SqlitePoolOptions::new()
                    .max_connections(5)
                    .connect_with(options)
                    .await?
            }
            None => {
                debug!("Opening in-memory catalog");
                // Every connection to :memory: is a separate database, so the
                // pool must hold exactly one connection for its whole life.
                let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await?
            }
        };

        let catalog = Self { db: Arc::new(pool) };
        catalog.run_migrations().await?;
        Ok(catalog)
    }

    /// Apply every migration newer than the store's `user_version`.
    async fn run_migrations(&self) -> CatalogResult<()> {
        let current: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&*self.db)
            .await?;

        for (index, &(name, sql)) in MIGRATIONS.iter().enumerate() {
            let version = index as i64 + 1;
            if version <= current {
                continue;
            }
            let statements = sql
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>();
            info!("Running migration {} ({} statements)", name, statements.len());

            let migration_err = |source| CatalogError::Migration { name, source };
            let mut tx = self.db.begin().await.map_err(migration_err)?;
            for stmt in statements {
                debug!("Executing migration SQL: {}", stmt);
                sqlx::query(stmt)
                    .execute(&mut *tx)
                    .await
                    .map_err(migration_err)?;
            }
            // PRAGMA does not accept bound parameters.
            sqlx::query(&format!("PRAGMA user_version = {version}"))
                .execute(&mut *tx)
                .await
                .map_err(migration_err)?;
            tx.commit().await.map_err(migration_err)?;
        }
        Ok(())
    }

    /// Number of migrations applied to this store.
    pub async fn schema_version(&self) -> CatalogResult<i64> {
        Ok(sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&*self.db)
            .await?)
    }

    pub async fn find_local_by_path(&self, local_path: &str) -> CatalogResult<Option<LocalFileEntry>> {
        Ok(sqlx::query_as::<_, LocalFileEntry>(&format!(
            "SELECT {LOCAL_COLUMNS} FROM local_file WHERE local_path = ?"
        ))
        .bind(local_path)
        .fetch_optional(&*self.db)
        .await?)
    }

    pub async fn get_local(&self, id: i64) -> CatalogResult<Option<LocalFileEntry>> {
        Ok(sqlx::query_as::<_, LocalFileEntry>(&format!(
            "SELECT {LOCAL_COLUMNS} FROM local_file WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?)
    }

    pub async fn get_blob(&self, id: i64) -> CatalogResult<Option<BackupBlob>> {
        Ok(sqlx::query_as::<_, BackupBlob>(&format!(
            "SELECT {BLOB_COLUMNS} FROM backup_blob WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?)
    }

    pub async fn find_blob_by_uploaded_digest(&self, digest: &str) -> CatalogResult<Option<BackupBlob>> {
        Ok(sqlx::query_as::<_, BackupBlob>(&format!(
            "SELECT {BLOB_COLUMNS} FROM backup_blob WHERE uploaded_digest = ?"
        ))
        .bind(digest)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Oldest blob whose plaintext has `digest`.
    pub async fn find_blob_by_original_digest(&self, digest: &str) -> CatalogResult<Option<BackupBlob>> {
        Ok(sqlx::query_as::<_, BackupBlob>(&format!(
            "SELECT {BLOB_COLUMNS} FROM backup_blob WHERE original_digest = ?
             ORDER BY id ASC LIMIT 1"
        ))
        .bind(digest)
        .fetch_optional(&*self.db)
        .await?)
    }

    pub async fn find_blob_by_object_key(&self, object_key: &str) -> CatalogResult<Option<BackupBlob>> {
        Ok(sqlx::query_as::<_, BackupBlob>(&format!(
            "SELECT {BLOB_COLUMNS} FROM backup_blob WHERE object_key = ?"
        ))
        .bind(object_key)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Start tracking `local_path`. No digest is needed yet.
    pub async fn insert_local(&self, local_path: &str) -> CatalogResult<LocalFileEntry> {
        let entry = sqlx::query_as::<_, LocalFileEntry>(&format!(
            "INSERT INTO local_file (local_path) VALUES (?) RETURNING {LOCAL_COLUMNS}"
        ))
        .bind(local_path)
        .fetch_one(&*self.db)
        .await?;
        debug!(id = entry.id, path = local_path, "inserted local file entry");
        Ok(entry)
    }

    pub async fn insert_blob(
        &self,
        object_key: &str,
        uploaded_digest: &str,
        original_digest: &str,
    ) -> CatalogResult<BackupBlob> {
        let blob = sqlx::query_as::<_, BackupBlob>(&format!(
            "INSERT INTO backup_blob (object_key, uploaded_digest, original_digest)
             VALUES (?, ?, ?) RETURNING {BLOB_COLUMNS}"
        ))
        .bind(object_key)
        .bind(uploaded_digest)
        .bind(original_digest)
        .fetch_one(&*self.db)
        .await?;
        debug!(id = blob.id, key = object_key, "inserted backup blob");
        Ok(blob)
    }

    /// Insert a blob and point `local_id` at it in one transaction.
    pub async fn insert_blob_for_local(
        &self,
        local_id: i64,
        object_key: &str,
        uploaded_digest: &str,
        original_digest: &str,
    ) -> CatalogResult<BackupBlob> {
        let mut tx = self.db.begin().await?;
        let blob = sqlx::query_as::<_, BackupBlob>(&format!(
            "INSERT INTO backup_blob (object_key, uploaded_digest, original_digest)
             VALUES (?, ?, ?) RETURNING {BLOB_COLUMNS}"
        ))
        .bind(object_key)
        .bind(uploaded_digest)
        .bind(original_digest)
        .fetch_one(&mut *tx)
        .await?;

        let updated = sqlx::query("UPDATE local_file SET backup_blob_id = ? WHERE id = ?")
            .bind(blob.id)
            .bind(local_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            // Dropping the transaction rolls the insert back.
            return Err(CatalogError::LocalNotFound(local_id));
        }
        tx.commit().await?;
        debug!(blob = blob.id, local = local_id, "inserted and attached backup blob");
        Ok(blob)
    }

    pub async fn set_backup_ref(&self, local_id: i64, blob_id: Option<i64>) -> CatalogResult<()> {
        let result = sqlx::query("UPDATE local_file SET backup_blob_id = ? WHERE id = ?")
            .bind(blob_id)
            .bind(local_id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::LocalNotFound(local_id));
        }
        Ok(())
    }

    pub async fn set_metadata_cache(&self, local_id: i64, snapshot: FileSnapshot) -> CatalogResult<()> {
        let result =
            sqlx::query("UPDATE local_file SET cached_mtime = ?, cached_size = ? WHERE id = ?")
                .bind(snapshot.mtime)
                .bind(snapshot.size)
                .bind(local_id)
                .execute(&*self.db)
                .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::LocalNotFound(local_id));
        }
        Ok(())
    }

    pub async fn list_locals(&self) -> CatalogResult<Vec<LocalFileEntry>> {
        Ok(sqlx::query_as::<_, LocalFileEntry>(&format!(
            "SELECT {LOCAL_COLUMNS} FROM local_file ORDER BY id ASC"
        ))
        .fetch_all(&*self.db)
        .await?)
    }

    pub async fn list_blobs(&self) -> CatalogResult<Vec<BackupBlob>> {
        Ok(sqlx::query_as::<_, BackupBlob>(&format!(
            "SELECT {BLOB_COLUMNS} FROM backup_blob ORDER BY id ASC"
        ))
        .fetch_all(&*self.db)
        .await?)
    }

    pub async fn delete_local(&self, id: i64) -> CatalogResult<()> {
        let result = sqlx::query("DELETE FROM local_file WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::LocalNotFound(id));
        }
        Ok(())
    }

    /// Delete a blob row. Fails on the foreign key if an entry still uses it.
    pub async fn delete_blob(&self, id: i64) -> CatalogResult<()> {
        let result = sqlx::query("DELETE FROM backup_blob WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::BlobNotFound(id));
        }
        Ok(())
    }

    /// Entries grouped by blob, keeping only groups of two or more.
    pub async fn duplicates(&self) -> CatalogResult<DuplicateGroups> {
        let mut groups = DuplicateGroups::new();
        for entry in self.list_locals().await? {
            groups.entry(entry.backup_blob_id).or_default().push(entry);
        }
        groups.retain(|_, entries| entries.len() >= 2);
        Ok(groups)
    }

    /// Blobs no local entry refers to.
    pub async fn orphan_blob_ids(&self) -> CatalogResult<BTreeSet<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM backup_blob
             WHERE id NOT IN (
                 SELECT backup_blob_id FROM local_file WHERE backup_blob_id IS NOT NULL
             )
             ORDER BY id ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(ids.into_iter().collect())
    }
}

/// Return true if a SQLx error is a unique constraint violation.
pub fn is_unique_violation(err: &CatalogError) -> bool {
    matches!(
        err,
        CatalogError::Sqlx(sqlx::Error::Database(db_err))
            if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn catalog() -> Catalog {
        Catalog::open(None).await.unwrap()
    }

    #[tokio::test]
    async fn insert_and_find_local() {
        let catalog = catalog().await;
        let entry = catalog.insert_local("docs/a.txt").await.unwrap();
        assert_eq!(entry.backup_blob_id, None);
        assert_eq!(entry.cached_mtime, None);

        let found = catalog.find_local_by_path("docs/a.txt").await.unwrap();
        assert_eq!(found, Some(entry.clone()));
        assert_eq!(catalog.get_local(entry.id).await.unwrap(), Some(entry));
        assert!(catalog.find_local_by_path("docs/b.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_path_is_unique() {
        let catalog = catalog().await;
        catalog.insert_local("a").await.unwrap();
        let err = catalog.insert_local("a").await.unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn uploaded_digest_is_unique() {
        let catalog = catalog().await;
        catalog.insert_blob("k1", "enc", "plain").await.unwrap();
        let err = catalog.insert_blob("k2", "enc", "plain").await.unwrap_err();
        assert!(is_unique_violation(&err));
        let err = catalog.insert_blob("k1", "enc2", "plain").await.unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn blob_lookups() {
        let catalog = catalog().await;
        let first = catalog.insert_blob("k1", "enc1", "plain").await.unwrap();
        catalog.insert_blob("k2", "enc2", "plain").await.unwrap();

        assert_eq!(
            catalog.find_blob_by_uploaded_digest("enc1").await.unwrap(),
            Some(first.clone())
        );
        assert_eq!(
            catalog.find_blob_by_original_digest("plain").await.unwrap(),
            Some(first.clone())
        );
        assert_eq!(
            catalog.find_blob_by_object_key("k1").await.unwrap(),
            Some(first)
        );
        assert!(catalog.find_blob_by_uploaded_digest("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_blob_for_local_is_atomic() {
        let catalog = catalog().await;
        let entry = catalog.insert_local("a").await.unwrap();
        let blob = catalog
            .insert_blob_for_local(entry.id, "k1", "enc", "plain")
            .await
            .unwrap();
        let entry = catalog.get_local(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.backup_blob_id, Some(blob.id));

        let err = catalog
            .insert_blob_for_local(9999, "k2", "enc2", "plain2")
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::LocalNotFound(9999)));
        assert!(catalog.find_blob_by_object_key("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn metadata_cache_and_backup_ref() {
        let catalog = catalog().await;
        let entry = catalog.insert_local("a").await.unwrap();
        let blob = catalog.insert_blob("k", "enc", "plain").await.unwrap();

        catalog.set_backup_ref(entry.id, Some(blob.id)).await.unwrap();
        catalog
            .set_metadata_cache(entry.id, FileSnapshot { mtime: 10, size: 3 })
            .await
            .unwrap();
        let entry = catalog.get_local(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.backup_blob_id, Some(blob.id));
        assert_eq!(entry.cached_mtime, Some(10));
        assert_eq!(entry.cached_size, Some(3));

        catalog.set_backup_ref(entry.id, None).await.unwrap();
        let entry = catalog.get_local(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.backup_blob_id, None);

        assert!(matches!(
            catalog.set_backup_ref(4242, None).await,
            Err(CatalogError::LocalNotFound(4242))
        ));
    }

    #[tokio::test]
    async fn duplicates_keep_groups_of_two_or_more() {
        let catalog = catalog().await;
        let shared = catalog.insert_blob("k1", "enc1", "p1").await.unwrap();
        let single = catalog.insert_blob("k2", "enc2", "p2").await.unwrap();

        for path in ["a", "b"] {
            let e = catalog.insert_local(path).await.unwrap();
            catalog.set_backup_ref(e.id, Some(shared.id)).await.unwrap();
        }
        let e = catalog.insert_local("c").await.unwrap();
        catalog.set_backup_ref(e.id, Some(single.id)).await.unwrap();
        catalog.insert_local("d").await.unwrap();

        let groups = catalog.duplicates().await.unwrap();
        assert_eq!(groups.len(), 1);
        let paths: Vec<_> = groups[&Some(shared.id)]
            .iter()
            .map(|e| e.local_path.as_str())
            .collect();
        assert_eq!(paths, ["a", "b"]);

        // A second unattached entry makes the null group count.
        catalog.insert_local("e").await.unwrap();
        let groups = catalog.duplicates().await.unwrap();
        assert_eq!(groups[&None].len(), 2);
    }

    #[tokio::test]
    async fn orphans_and_deletion() {
        let catalog = catalog().await;
        let used = catalog.insert_blob("k1", "enc1", "p1").await.unwrap();
        let orphan = catalog.insert_blob("k2", "enc2", "p2").await.unwrap();
        let entry = catalog.insert_local("a").await.unwrap();
        catalog.set_backup_ref(entry.id, Some(used.id)).await.unwrap();
        catalog.insert_local("b").await.unwrap();

        let orphans = catalog.orphan_blob_ids().await.unwrap();
        assert_eq!(orphans.into_iter().collect::<Vec<_>>(), vec![orphan.id]);

        // Still referenced.
        assert!(catalog.delete_blob(used.id).await.is_err());

        catalog.delete_local(entry.id).await.unwrap();
        let orphans = catalog.orphan_blob_ids().await.unwrap();
        assert_eq!(orphans.len(), 2);

        catalog.delete_blob(used.id).await.unwrap();
        catalog.delete_blob(orphan.id).await.unwrap();
        assert!(catalog.list_blobs().await.unwrap().is_empty());
        assert!(matches!(
            catalog.delete_blob(orphan.id).await,
            Err(CatalogError::BlobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn reopen_is_idempotent_and_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta").join("catalog.db");

        let catalog = Catalog::open(Some(&path)).await.unwrap();
        catalog.insert_local("a").await.unwrap();
        assert_eq!(catalog.schema_version().await.unwrap(), MIGRATIONS.len() as i64);
        catalog.db.close().await;

        let catalog = Catalog::open(Some(&path)).await.unwrap();
        assert_eq!(catalog.schema_version().await.unwrap(), MIGRATIONS.len() as i64);
        assert_eq!(catalog.list_locals().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upgrade_adds_metadata_columns_without_data_loss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");

        // A store created before the metadata cache existed.
        {
            let options = SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .unwrap();
            for stmt in MIGRATIONS[0].1.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                sqlx::query(stmt).execute(&pool).await.unwrap();
            }
            sqlx::query("PRAGMA user_version = 1").execute(&pool).await.unwrap();
            sqlx::query("INSERT INTO local_file (local_path) VALUES ('old')")
                .execute(&pool)
                .await
                .unwrap();
            pool.close().await;
        }

        let catalog = Catalog::open(Some(&path)).await.unwrap();
        let entries = catalog.list_locals().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].local_path, "old");
        assert_eq!(entries[0].cached_mtime, None);
    }
}
