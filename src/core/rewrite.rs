//! 元数据改写协调器
//!
//! 改写嵌入元数据会改变文件字节，因而改变内容 hash。这里负责把
//! 写入 → 失效缓存 → 重新计算 hash → 重复判定 → 移动到规范路径 → 更新目录
//! 作为一个单元完成，保证目录中的 hash 与磁盘一致。

use crate::core::duplicate::{DuplicateCheck, DuplicateRecord, DuplicateResolver, DuplicateStage};
use crate::core::hash_cache::HashCache;
use crate::core::layout::{
    canonical_path_for, move_file, prune_empty_ancestors, quarantine_file, LibraryLayout,
    QuarantineCategory,
};
use crate::core::lock::OperationToken;
use crate::core::metadata::MetadataWriter;
use crate::db::{CaptureTime, DeletedEntry, LibraryEntry, MediaKind, NewEntry, SqlitePool};
use crate::error::{LibraryError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 墓碑原因：改写后与已有条目重复
pub const DUPLICATE_REASON: &str = "duplicate";

/// 要写入的元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "field", content = "value")]
pub enum MetadataChange {
    CaptureTime(CaptureTime),
    Rating(u8),
}

/// 尚未入库的文件（导入时使用）
#[derive(Debug, Clone)]
pub struct UnmanagedFile {
    pub path: PathBuf,
    pub kind: MediaKind,
    /// 改写前读到的拍摄时间
    pub taken_at: CaptureTime,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// 改写对象
#[derive(Debug, Clone)]
pub enum RewriteSubject {
    Entry(LibraryEntry),
    Unmanaged(UnmanagedFile),
}

/// 改写结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "result")]
pub enum RewriteOutcome {
    /// 已提交，返回最新条目
    Committed(LibraryEntry),
    /// 改写后与已有条目重复，文件已移入隔离区，已有条目保持不变
    DuplicateQuarantined {
        quarantine_path: String,
        existing_id: i64,
    },
}

/// 元数据改写协调器
pub struct MetadataRewriteCoordinator {
    layout: LibraryLayout,
    catalog: Arc<SqlitePool>,
    cache: Arc<HashCache>,
    resolver: DuplicateResolver,
    writer: Arc<dyn MetadataWriter>,
}

impl MetadataRewriteCoordinator {
    pub fn new(
        layout: LibraryLayout,
        catalog: Arc<SqlitePool>,
        cache: Arc<HashCache>,
        writer: Arc<dyn MetadataWriter>,
    ) -> Self {
        Self {
            resolver: DuplicateResolver::new(catalog.clone()),
            layout,
            catalog,
            cache,
            writer,
        }
    }

    /// 改写元数据并提交目录
    ///
    /// 写入失败时返回 `MetadataRewriteFailed`，文件与目录都不变。
    pub async fn apply(
        &self,
        _token: &OperationToken,
        subject: RewriteSubject,
        change: MetadataChange,
        operation_id: Option<&str>,
    ) -> Result<RewriteOutcome> {
        if let MetadataChange::Rating(rating) = change {
            if rating > 5 {
                return Err(LibraryError::Invalid(format!("评分超出范围: {}", rating)));
            }
        }

        let (path, kind) = match &subject {
            RewriteSubject::Entry(entry) => (self.layout.absolute(&entry.path), entry.kind),
            RewriteSubject::Unmanaged(file) => (file.path.clone(), file.kind),
        };
        tokio::fs::metadata(&path)
            .await
            .map_err(|e| LibraryError::io(&path, e))?;

        // 1. 写入字节
        let written = match change {
            MetadataChange::CaptureTime(taken_at) => {
                self.writer.write_capture_time(&path, kind, taken_at).await
            }
            MetadataChange::Rating(rating) => self.writer.write_rating(&path, kind, rating).await,
        };
        if let Err(e) = written {
            warn!("写入元数据失败 {:?}: {}", path, e);
            return Err(e.into_write_error(&path));
        }

        // 2. 失效缓存后重新计算 hash
        self.cache.invalidate(&path).await?;
        let content_hash = self.cache.get_or_compute(&path).await?;
        let file_size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| LibraryError::io(&path, e))?
            .len();

        let mut entry = Self::rewritten_entry(&subject, change, &content_hash, file_size);
        let exclude_id = match &subject {
            RewriteSubject::Entry(e) => Some(e.id),
            RewriteSubject::Unmanaged(_) => {
                entry.path = self.layout.relative(&path).ok_or_else(|| {
                    LibraryError::Invalid(format!("文件不在媒体库内: {:?}", path))
                })?;
                None
            }
        };

        // 3. 改写后的重复判定
        if let DuplicateCheck::Duplicate(existing) = self
            .resolver
            .check(&content_hash, entry.taken_at, exclude_id)
            .await?
        {
            return self
                .route_duplicate(&subject, &path, &entry, existing.id, operation_id)
                .await;
        }

        // 4. 移动到规范路径
        let target_rel = canonical_path_for(entry.taken_at, &content_hash, &path);
        let target = self.layout.absolute(&target_rel);
        let moved = if target != path {
            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                return self.keep_in_place(subject, entry, target_rel).await;
            }
            move_file(&path, &target)
                .await
                .map_err(|e| LibraryError::io(&path, e))?;
            self.cache.relocate(&path, &target).await?;
            entry.path = target_rel;
            true
        } else {
            false
        };

        // 5. 提交目录
        let committed = match self.commit(&subject, &entry).await {
            Ok(committed) => committed,
            Err(e) => {
                if moved {
                    self.revert_move(&target, &path).await;
                }
                if let LibraryError::IntegrityViolation { .. } = e {
                    let existing_id = match self.resolver.reclassify(e).await {
                        LibraryError::DuplicateDetected { existing_id, .. } => existing_id,
                        other => return Err(other),
                    };
                    entry.path = self.layout.relative(&path).unwrap_or_default();
                    return self
                        .route_duplicate(&subject, &path, &entry, existing_id, operation_id)
                        .await;
                }
                return Err(e);
            }
        };

        // 6. 清理原位置留下的空目录
        if moved {
            if let Some(parent) = path.parent() {
                let removed = prune_empty_ancestors(&self.layout, parent);
                if !removed.is_empty() {
                    debug!("清理空目录: {:?}", removed);
                }
            }
        }

        info!("元数据已更新: #{} -> {}", committed.id, committed.path);
        Ok(RewriteOutcome::Committed(committed))
    }

    /// 根据改写结果构造新的条目内容
    fn rewritten_entry(
        subject: &RewriteSubject,
        change: MetadataChange,
        content_hash: &str,
        file_size: u64,
    ) -> LibraryEntry {
        let mut entry = match subject {
            RewriteSubject::Entry(entry) => entry.clone(),
            RewriteSubject::Unmanaged(file) => LibraryEntry {
                id: 0,
                path: String::new(),
                original_filename: file
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                content_hash: String::new(),
                taken_at: file.taken_at,
                file_size,
                kind: file.kind,
                width: file.width,
                height: file.height,
                rating: 0,
                created_at: 0,
                updated_at: 0,
            },
        };

        match change {
            MetadataChange::CaptureTime(taken_at) => entry.taken_at = taken_at,
            MetadataChange::Rating(rating) => entry.rating = rating,
        }
        entry.content_hash = content_hash.to_string();
        entry.file_size = file_size;
        entry
    }

    async fn commit(&self, subject: &RewriteSubject, entry: &LibraryEntry) -> Result<LibraryEntry> {
        let mut tx = self.catalog.begin().await?;
        let committed = match subject {
            RewriteSubject::Entry(_) => {
                entry.update(&mut *tx).await?;
                entry.clone()
            }
            RewriteSubject::Unmanaged(_) => {
                LibraryEntry::insert(&mut *tx, &NewEntry::from_entry(entry)).await?
            }
        };
        tx.commit().await?;

        match subject {
            RewriteSubject::Entry(_) => Ok(LibraryEntry::load(&self.catalog, entry.id)
                .await?
                .unwrap_or(committed)),
            RewriteSubject::Unmanaged(_) => Ok(committed),
        }
    }

    /// 规范路径已被未入库的文件占用：文件留在原位，条目按实际位置更新
    async fn keep_in_place(
        &self,
        subject: RewriteSubject,
        entry: LibraryEntry,
        target_rel: String,
    ) -> Result<RewriteOutcome> {
        warn!("规范路径已被占用，文件保持原位: {}", target_rel);
        if let RewriteSubject::Entry(_) = subject {
            if let Err(e) = self.commit(&subject, &entry).await {
                return Err(self.resolver.reclassify(e).await);
            }
        }
        Err(LibraryError::CanonicalPathOccupied(target_rel))
    }

    /// 改写后重复：文件进入隔离区，已有条目不动，记录事件
    async fn route_duplicate(
        &self,
        subject: &RewriteSubject,
        path: &Path,
        rewritten: &LibraryEntry,
        existing_id: i64,
        operation_id: Option<&str>,
    ) -> Result<RewriteOutcome> {
        let source_rel = self
            .layout
            .relative(path)
            .unwrap_or_else(|| path.display().to_string());

        let quarantined = quarantine_file(&self.layout, QuarantineCategory::Duplicate, path)
            .await
            .map_err(|e| LibraryError::io(path, e))?;
        let quarantine_rel = self
            .layout
            .relative(&quarantined)
            .unwrap_or_else(|| quarantined.display().to_string());
        self.cache.invalidate(path).await?;

        if let RewriteSubject::Entry(original) = subject {
            // 墓碑保留改写后的内容，文件已在隔离区
            let mut tx = self.catalog.begin().await?;
            let mut tomb = original.clone();
            tomb.content_hash = rewritten.content_hash.clone();
            tomb.taken_at = rewritten.taken_at;
            tomb.rating = rewritten.rating;
            tomb.file_size = rewritten.file_size;
            DeletedEntry::record(&mut *tx, &tomb, &quarantine_rel, DUPLICATE_REASON).await?;
            LibraryEntry::delete(&mut *tx, original.id).await?;
            tx.commit().await?;

            if let Some(parent) = path.parent() {
                prune_empty_ancestors(&self.layout, parent);
            }
        }

        self.resolver
            .record(DuplicateRecord {
                operation_id,
                stage: DuplicateStage::PostRewrite,
                source_path: &source_rel,
                quarantine_path: Some(&quarantine_rel),
                content_hash: &rewritten.content_hash,
                taken_at: rewritten.taken_at,
                existing_entry_id: Some(existing_id),
            })
            .await?;

        info!(
            "改写后与条目 #{} 重复，已隔离: {} -> {}",
            existing_id, source_rel, quarantine_rel
        );
        Ok(RewriteOutcome::DuplicateQuarantined {
            quarantine_path: quarantine_rel,
            existing_id,
        })
    }

    async fn revert_move(&self, moved_to: &Path, original: &Path) {
        match move_file(moved_to, original).await {
            Ok(()) => {
                if let Err(e) = self.cache.relocate(moved_to, original).await {
                    warn!("回滚后更新缓存失败: {}", e);
                }
            }
            Err(e) => error!("回滚移动失败 {:?} -> {:?}: {}", moved_to, original, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hasher::Blake3Hasher;
    use crate::core::lock::OperationLock;
    use crate::core::checkpoint::OperationKind;
    use crate::core::metadata::MetadataError;
    use async_trait::async_trait;

    /// 把拍摄时间写成文件末尾的一行
    struct TrailerWriter;

    #[async_trait]
    impl MetadataWriter for TrailerWriter {
        async fn write_capture_time(
            &self,
            path: &Path,
            _kind: MediaKind,
            taken_at: CaptureTime,
        ) -> std::result::Result<(), MetadataError> {
            let text = tokio::fs::read_to_string(path).await?;
            if text.contains("NOWRITE") {
                return Err(MetadataError::Failed("只读".into()));
            }
            let body: Vec<&str> = text.lines().filter(|l| !l.starts_with("#taken=")).collect();
            let mut out = body.join("\n");
            out.push_str(&format!("\n#taken={}\n", taken_at));
            tokio::fs::write(path, out).await?;
            Ok(())
        }

        async fn write_rating(
            &self,
            _path: &Path,
            _kind: MediaKind,
            _rating: u8,
        ) -> std::result::Result<(), MetadataError> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: LibraryLayout,
        pool: Arc<SqlitePool>,
        coordinator: MetadataRewriteCoordinator,
        lock: OperationLock,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = LibraryLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        let pool = Arc::new(crate::db::open_catalog(&layout.catalog_path()).await.unwrap());
        let state = Arc::new(crate::db::open_state(&layout.state_path()).await.unwrap());
        let cache = Arc::new(HashCache::new(state, Arc::new(Blake3Hasher::default()), 16));
        let coordinator = MetadataRewriteCoordinator::new(
            layout.clone(),
            pool.clone(),
            cache,
            Arc::new(TrailerWriter),
        );
        Fixture {
            _dir: dir,
            layout,
            pool,
            coordinator,
            lock: OperationLock::new(),
        }
    }

    fn unmanaged(path: PathBuf, taken: &str) -> RewriteSubject {
        RewriteSubject::Unmanaged(UnmanagedFile {
            path,
            kind: MediaKind::Photo,
            taken_at: CaptureTime::parse(taken).unwrap(),
            width: Some(4),
            height: Some(3),
        })
    }

    #[tokio::test]
    async fn unmanaged_file_lands_at_canonical_path() {
        let f = fixture().await;
        let source = f.layout.root().join("in/a.jpg");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, "body-a").unwrap();
        let taken = CaptureTime::parse("2023:06:01 10:00:00").unwrap();

        let token = f.lock.acquire(OperationKind::Adopt).await;
        let outcome = f
            .coordinator
            .apply(
                &token,
                unmanaged(source.clone(), "2023:06:01 10:00:00"),
                MetadataChange::CaptureTime(taken),
                None,
            )
            .await
            .unwrap();

        let RewriteOutcome::Committed(entry) = outcome else {
            panic!("expected commit");
        };
        assert!(entry.path.starts_with("2023/2023-06-01/img_20230601_100000_"));
        assert_eq!(entry.original_filename, "a.jpg");
        assert!(!source.exists());
        assert!(!f.layout.root().join("in").exists());

        let on_disk = blake3::hash(&std::fs::read(f.layout.absolute(&entry.path)).unwrap());
        assert_eq!(entry.content_hash, on_disk.to_hex().to_string());
    }

    #[tokio::test]
    async fn failed_write_leaves_everything_untouched() {
        let f = fixture().await;
        let source = f.layout.root().join("b.jpg");
        std::fs::write(&source, "NOWRITE").unwrap();

        let token = f.lock.acquire(OperationKind::Adopt).await;
        let err = f
            .coordinator
            .apply(
                &token,
                unmanaged(source.clone(), "2023:06:01 10:00:00"),
                MetadataChange::CaptureTime(CaptureTime::parse("2023:06:01 10:00:00").unwrap()),
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LibraryError::MetadataRewriteFailed { .. }));
        assert_eq!(std::fs::read_to_string(&source).unwrap(), "NOWRITE");
        assert_eq!(LibraryEntry::count(&f.pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn raced_identity_clash_while_keeping_in_place_is_a_duplicate() {
        let f = fixture().await;
        let taken = CaptureTime::parse("2023:06:01 10:00:00").unwrap();
        let new_entry = |path: &str, hash: &str| NewEntry {
            path: path.to_string(),
            original_filename: path.to_string(),
            content_hash: hash.to_string(),
            taken_at: taken,
            file_size: 1,
            kind: MediaKind::Photo,
            width: None,
            height: None,
            rating: 0,
        };
        let mut conn = f.pool.acquire().await.unwrap();
        let existing = LibraryEntry::insert(&mut conn, &new_entry("x.jpg", "h1"))
            .await
            .unwrap();
        let mut other = LibraryEntry::insert(&mut conn, &new_entry("y.jpg", "h2"))
            .await
            .unwrap();
        drop(conn);

        // 另一条路径在检查之后写入了同一身份
        other.content_hash = "h1".to_string();
        let err = f
            .coordinator
            .keep_in_place(
                RewriteSubject::Entry(other.clone()),
                other.clone(),
                "2023/2023-06-01/taken.jpg".to_string(),
            )
            .await
            .unwrap_err();

        let LibraryError::DuplicateDetected { existing_id, .. } = err else {
            panic!("expected duplicate, got {err:?}");
        };
        assert_eq!(existing_id, existing.id);
        let stored = LibraryEntry::load(&f.pool, other.id).await.unwrap().unwrap();
        assert_eq!(stored.content_hash, "h2");
    }

    #[tokio::test]
    async fn rating_out_of_range_is_rejected_before_writing() {
        let f = fixture().await;
        let source = f.layout.root().join("c.jpg");
        std::fs::write(&source, "body").unwrap();

        let token = f.lock.acquire(OperationKind::BulkEdit).await;
        let err = f
            .coordinator
            .apply(
                &token,
                unmanaged(source, "2023:06:01 10:00:00"),
                MetadataChange::Rating(6),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LibraryError::Invalid(_)));
    }
}
