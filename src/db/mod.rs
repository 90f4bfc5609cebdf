pub mod models;
pub use models::*;

use crate::error::{LibraryError, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
pub use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const ENTRY_COLUMNS: &str = "id, path, original_filename, content_hash, taken_at, file_size, \
     media_kind, width, height, rating, created_at, updated_at";

/// 打开（或创建）目录数据库并执行迁移
pub async fn open_catalog(path: &Path) -> Result<SqlitePool> {
    let pool = connect(path).await?;
    sqlx::migrate!("./migrations/catalog").run(&pool).await?;
    Ok(pool)
}

/// 打开（或创建）运行状态数据库：哈希缓存与检查点
pub async fn open_state(path: &Path) -> Result<SqlitePool> {
    let pool = connect(path).await?;
    sqlx::migrate!("./migrations/state").run(&pool).await?;
    Ok(pool)
}

async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| LibraryError::io(parent, e))?;
    }

    // 使用 DELETE 日志模式：数据库始终是单个文件，便于备份和整体替换
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5) // SQLite 单文件，不需要太多连接
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect_with(options)
        .await?;

    debug!("数据库已打开: {:?}", path);
    Ok(pool)
}

/// 当前生效的目录数据库，重建成功后整体替换
pub struct Catalog {
    path: PathBuf,
    pool: RwLock<Arc<SqlitePool>>,
}

impl Catalog {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_catalog(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            pool: RwLock::new(Arc::new(pool)),
        })
    }

    /// 获取当前连接池
    pub async fn pool(&self) -> Arc<SqlitePool> {
        self.pool.read().await.clone()
    }

    /// 先把当前目录备份到 `backup_path`，再用 `replacement` 原子替换当前目录
    ///
    /// 任何一步失败都会重新打开原目录，原目录文件保持不变。
    pub async fn swap_in(&self, replacement: &Path, backup_path: &Path) -> Result<()> {
        let mut guard = self.pool.write().await;
        guard.close().await;

        if let Err(e) = self.replace_file(replacement, backup_path).await {
            warn!("替换目录失败，恢复原目录: {}", e);
            let pool = open_catalog(&self.path).await?;
            *guard = Arc::new(pool);
            return Err(e);
        }

        let pool = open_catalog(&self.path).await?;
        *guard = Arc::new(pool);
        info!("目录已替换，备份: {:?}", backup_path);
        Ok(())
    }

    async fn replace_file(&self, replacement: &Path, backup_path: &Path) -> Result<()> {
        if let Some(parent) = backup_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LibraryError::io(parent, e))?;
        }

        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::copy(&self.path, backup_path).await {
                if let Err(cleanup) = tokio::fs::remove_file(backup_path).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!("删除不完整的备份失败 {:?}: {}", backup_path, cleanup);
                    }
                }
                return Err(LibraryError::io(backup_path, e));
            }
        }

        tokio::fs::rename(replacement, &self.path)
            .await
            .map_err(|e| LibraryError::io(&self.path, e))
    }

    pub async fn close(&self) {
        self.pool.read().await.close().await;
    }
}

/// 唯一约束冲突的结构化归类：按身份回查，而不是解析错误文本
async fn classify_write_error(
    conn: &mut SqliteConnection,
    err: sqlx::Error,
    content_hash: &str,
    taken_at: CaptureTime,
    path: &str,
    exclude_id: i64,
) -> LibraryError {
    let is_unique = matches!(&err, sqlx::Error::Database(db_err) if db_err.is_unique_violation());
    if !is_unique {
        return LibraryError::Database(err);
    }

    let clash = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM entries WHERE content_hash = ? AND taken_at = ? AND id != ?",
    )
    .bind(content_hash)
    .bind(taken_at.to_exif_string())
    .bind(exclude_id)
    .fetch_optional(&mut *conn)
    .await;

    match clash {
        Ok(Some(_)) => LibraryError::IntegrityViolation {
            content_hash: content_hash.to_string(),
            taken_at,
        },
        Ok(None) => LibraryError::CanonicalPathOccupied(path.to_string()),
        Err(e) => LibraryError::Database(e),
    }
}

impl LibraryEntry {
    /// 加载单个条目
    pub async fn load(pool: &SqlitePool, id: i64) -> Result<Option<LibraryEntry>> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM entries WHERE id = ?",
            ENTRY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        row.map(LibraryEntry::try_from).transpose()
    }

    /// 加载所有条目，按拍摄时间排序
    pub async fn load_all(pool: &SqlitePool) -> Result<Vec<LibraryEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM entries ORDER BY taken_at, id",
            ENTRY_COLUMNS
        ))
        .fetch_all(pool)
        .await?;

        rows.into_iter().map(LibraryEntry::try_from).collect()
    }

    pub async fn find_by_path(pool: &SqlitePool, path: &str) -> Result<Option<LibraryEntry>> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM entries WHERE path = ?",
            ENTRY_COLUMNS
        ))
        .bind(path)
        .fetch_optional(pool)
        .await?;

        row.map(LibraryEntry::try_from).transpose()
    }

    /// 按身份 (hash, 拍摄时间) 查找
    pub async fn find_by_identity(
        pool: &SqlitePool,
        content_hash: &str,
        taken_at: CaptureTime,
    ) -> Result<Option<LibraryEntry>> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM entries WHERE content_hash = ? AND taken_at = ?",
            ENTRY_COLUMNS
        ))
        .bind(content_hash)
        .bind(taken_at.to_exif_string())
        .fetch_optional(pool)
        .await?;

        row.map(LibraryEntry::try_from).transpose()
    }

    /// 某个时间之后以该文件名入库的条目，最新的在前
    pub async fn find_created_since(
        pool: &SqlitePool,
        original_filename: &str,
        since: i64,
    ) -> Result<Vec<LibraryEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM entries WHERE original_filename = ? AND created_at >= ? ORDER BY created_at DESC, id DESC",
            ENTRY_COLUMNS
        ))
        .bind(original_filename)
        .bind(since)
        .fetch_all(pool)
        .await?;

        rows.into_iter().map(LibraryEntry::try_from).collect()
    }

    /// 路径 -> 条目 id（返回 HashMap 以便快速查找）
    pub async fn path_index(pool: &SqlitePool) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query_as::<_, (i64, String)>("SELECT id, path FROM entries")
            .fetch_all(pool)
            .await?;

        Ok(rows.into_iter().map(|(id, path)| (path, id)).collect())
    }

    pub async fn count(pool: &SqlitePool) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(pool)
            .await?;
        Ok(count as u64)
    }

    /// 插入新条目，唯一约束冲突返回 `IntegrityViolation` 或 `CanonicalPathOccupied`
    pub async fn insert(conn: &mut SqliteConnection, new: &NewEntry) -> Result<LibraryEntry> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"INSERT INTO entries
               (path, original_filename, content_hash, taken_at, file_size, media_kind, width, height, rating, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&new.path)
        .bind(&new.original_filename)
        .bind(&new.content_hash)
        .bind(new.taken_at.to_exif_string())
        .bind(new.file_size as i64)
        .bind(new.kind.to_string())
        .bind(new.width.map(i64::from))
        .bind(new.height.map(i64::from))
        .bind(i64::from(new.rating))
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(done) => Ok(LibraryEntry {
                id: done.last_insert_rowid(),
                path: new.path.clone(),
                original_filename: new.original_filename.clone(),
                content_hash: new.content_hash.clone(),
                taken_at: new.taken_at,
                file_size: new.file_size,
                kind: new.kind,
                width: new.width,
                height: new.height,
                rating: new.rating,
                created_at: now,
                updated_at: now,
            }),
            Err(e) => Err(classify_write_error(
                conn,
                e,
                &new.content_hash,
                new.taken_at,
                &new.path,
                0,
            )
            .await),
        }
    }

    /// 写回路径、hash、拍摄时间等可变字段
    pub async fn update(&self, conn: &mut SqliteConnection) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"UPDATE entries SET
                   path = ?, content_hash = ?, taken_at = ?, file_size = ?,
                   width = ?, height = ?, rating = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&self.path)
        .bind(&self.content_hash)
        .bind(self.taken_at.to_exif_string())
        .bind(self.file_size as i64)
        .bind(self.width.map(i64::from))
        .bind(self.height.map(i64::from))
        .bind(i64::from(self.rating))
        .bind(now)
        .bind(self.id)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                Err(LibraryError::NotFound(format!("条目 #{}", self.id)))
            }
            Ok(_) => Ok(()),
            Err(e) => Err(classify_write_error(
                conn,
                e,
                &self.content_hash,
                self.taken_at,
                &self.path,
                self.id,
            )
            .await),
        }
    }

    /// 只更新路径（重命名到规范位置）
    pub async fn update_path(conn: &mut SqliteConnection, id: i64, path: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query("UPDATE entries SET path = ?, updated_at = ? WHERE id = ?")
            .bind(path)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(LibraryError::CanonicalPathOccupied(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 从目录删除（不涉及磁盘文件）
    pub async fn delete(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM entries WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl DeletedEntry {
    /// 记录墓碑，返回墓碑 id
    pub async fn record(
        conn: &mut SqliteConnection,
        entry: &LibraryEntry,
        trash_path: &str,
        reason: &str,
    ) -> Result<i64> {
        let entry_data = serde_json::to_string(entry)?;
        let result = sqlx::query(
            r#"INSERT INTO deleted_entries (entry_id, original_path, trash_path, reason, entry_data, deleted_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id)
        .bind(&entry.path)
        .bind(trash_path)
        .bind(reason)
        .bind(&entry_data)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn load(pool: &SqlitePool, id: i64) -> Result<Option<DeletedEntry>> {
        let row = sqlx::query_as::<_, DeletedEntryRow>("SELECT * FROM deleted_entries WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        row.map(DeletedEntry::try_from).transpose()
    }

    /// 所有未恢复的墓碑，最新的在前
    pub async fn load_active(pool: &SqlitePool) -> Result<Vec<DeletedEntry>> {
        let rows = sqlx::query_as::<_, DeletedEntryRow>(
            "SELECT * FROM deleted_entries WHERE restored_at IS NULL ORDER BY deleted_at DESC, id DESC",
        )
        .fetch_all(pool)
        .await?;

        rows.into_iter().map(DeletedEntry::try_from).collect()
    }

    pub async fn mark_restored(conn: &mut SqliteConnection, id: i64) -> Result<()> {
        sqlx::query("UPDATE deleted_entries SET restored_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(path: &str, hash: &str, taken: &str) -> NewEntry {
        NewEntry {
            path: path.to_string(),
            original_filename: "a.jpg".to_string(),
            content_hash: hash.to_string(),
            taken_at: CaptureTime::parse(taken).unwrap(),
            file_size: 10,
            kind: MediaKind::Photo,
            width: Some(4),
            height: None,
            rating: 0,
        }
    }

    #[tokio::test]
    async fn identity_clash_is_reported_structurally() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_catalog(&dir.path().join("catalog.db")).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let first = LibraryEntry::insert(&mut conn, &sample("a.jpg", "h1", "2023:06:01 00:00:00"))
            .await
            .unwrap();
        assert_eq!(first.width, Some(4));

        let err = LibraryEntry::insert(&mut conn, &sample("b.jpg", "h1", "2023:06:01 00:00:00"))
            .await
            .unwrap_err();
        assert!(matches!(err, LibraryError::IntegrityViolation { .. }));

        let err = LibraryEntry::insert(&mut conn, &sample("a.jpg", "h2", "2023:06:01 00:00:00"))
            .await
            .unwrap_err();
        assert!(matches!(err, LibraryError::CanonicalPathOccupied(_)));

        // 相同内容、不同拍摄时间是合法的
        LibraryEntry::insert(&mut conn, &sample("c.jpg", "h1", "2024:06:01 00:00:00"))
            .await
            .unwrap();
        drop(conn);
        assert_eq!(LibraryEntry::count(&pool).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn update_into_existing_identity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_catalog(&dir.path().join("catalog.db")).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        LibraryEntry::insert(&mut conn, &sample("a.jpg", "h1", "2023:06:01 00:00:00"))
            .await
            .unwrap();
        let mut second = LibraryEntry::insert(&mut conn, &sample("b.jpg", "h2", "2023:06:01 00:00:00"))
            .await
            .unwrap();

        second.content_hash = "h1".to_string();
        let err = second.update(&mut conn).await.unwrap_err();
        assert!(matches!(err, LibraryError::IntegrityViolation { .. }));

        drop(conn);
        let stored = LibraryEntry::load(&pool, second.id).await.unwrap().unwrap();
        assert_eq!(stored.content_hash, "h2");
    }

    #[tokio::test]
    async fn tombstone_keeps_serialized_entry() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_catalog(&dir.path().join("catalog.db")).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let entry = LibraryEntry::insert(&mut conn, &sample("a.jpg", "h1", "2023:06:01 00:00:00"))
            .await
            .unwrap();
        let id = DeletedEntry::record(&mut conn, &entry, ".trash/a.jpg", "user")
            .await
            .unwrap();
        drop(conn);

        let tomb = DeletedEntry::load(&pool, id).await.unwrap().unwrap();
        assert_eq!(tomb.entry, entry);
        assert_eq!(DeletedEntry::load_active(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_backup_keeps_active_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("catalog.db");
        let catalog = Catalog::open(&active).await.unwrap();
        {
            let pool = catalog.pool().await;
            let mut conn = pool.acquire().await.unwrap();
            LibraryEntry::insert(&mut conn, &sample("a.jpg", "h1", "2023:06:01 00:00:00"))
                .await
                .unwrap();
        }

        let replacement = dir.path().join("rebuilt.db");
        open_catalog(&replacement).await.unwrap().close().await;
        // 备份目标是一个目录，复制会失败，清理也会失败
        let backup = dir.path().join("backup.db");
        std::fs::create_dir(&backup).unwrap();

        let err = catalog.swap_in(&replacement, &backup).await.unwrap_err();
        assert!(matches!(err, LibraryError::IoUnavailable { .. }), "{err:?}");
        assert!(backup.is_dir());
        assert!(replacement.exists());
        assert_eq!(LibraryEntry::count(&*catalog.pool().await).await.unwrap(), 1);
    }
}
