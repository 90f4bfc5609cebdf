//! 软删除与恢复
//!
//! 删除把文件移到 `.trash/` 并留下墓碑；恢复把文件移回原路径并重新入库，
//! 仍受 (hash, 拍摄时间) 唯一约束保护。

use crate::core::duplicate::{DuplicateCheck, DuplicateRecord, DuplicateResolver, DuplicateStage};
use crate::core::hash_cache::HashCache;
use crate::core::layout::{move_file, prune_empty_ancestors, unique_destination, LibraryLayout};
use crate::core::lock::OperationToken;
use crate::db::{DeletedEntry, LibraryEntry, NewEntry, SqlitePool};
use crate::error::{LibraryError, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 墓碑原因：用户删除
pub const USER_REASON: &str = "user";

/// 批量删除结果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    /// 新建的墓碑 id
    pub tombstones: Vec<i64>,
    pub errors: Vec<String>,
}

/// 批量恢复结果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub restored: Vec<LibraryEntry>,
    pub errors: Vec<String>,
}

pub struct TrashBin {
    layout: LibraryLayout,
    catalog: Arc<SqlitePool>,
    cache: Arc<HashCache>,
    resolver: DuplicateResolver,
}

impl TrashBin {
    pub fn new(layout: LibraryLayout, catalog: Arc<SqlitePool>, cache: Arc<HashCache>) -> Self {
        Self {
            resolver: DuplicateResolver::new(catalog.clone()),
            layout,
            catalog,
            cache,
        }
    }

    /// 未恢复的墓碑
    pub async fn list(&self) -> Result<Vec<DeletedEntry>> {
        DeletedEntry::load_active(&self.catalog).await
    }

    pub async fn delete(&self, _token: &OperationToken, ids: &[i64]) -> Result<DeleteReport> {
        let mut report = DeleteReport::default();
        for &id in ids {
            match self.delete_one(id).await {
                Ok(tombstone) => report.tombstones.push(tombstone),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("删除条目 #{} 失败: {}", id, e);
                    report.errors.push(format!("#{}: {}", id, e));
                }
            }
        }
        info!("删除完成: {} 个成功, {} 个失败", report.tombstones.len(), report.errors.len());
        Ok(report)
    }

    async fn delete_one(&self, id: i64) -> Result<i64> {
        let entry = LibraryEntry::load(&self.catalog, id)
            .await?
            .ok_or_else(|| LibraryError::NotFound(format!("条目 #{}", id)))?;
        let source = self.layout.absolute(&entry.path);
        let file_name = source
            .file_name()
            .ok_or_else(|| LibraryError::Invalid(format!("条目路径无效: {}", entry.path)))?
            .to_os_string();

        let trash_dir = self.layout.trash_dir();
        tokio::fs::create_dir_all(&trash_dir)
            .await
            .map_err(|e| LibraryError::io(&trash_dir, e))?;
        let target = unique_destination(&trash_dir, &file_name);
        move_file(&source, &target)
            .await
            .map_err(|e| LibraryError::io(&source, e))?;
        let trash_rel = self
            .layout
            .relative(&target)
            .unwrap_or_else(|| target.display().to_string());

        let tombstone = match self.commit_delete(&entry, &trash_rel).await {
            Ok(t) => t,
            Err(e) => {
                revert(&target, &source).await;
                return Err(e);
            }
        };

        self.cache.invalidate(&source).await?;
        if let Some(parent) = source.parent() {
            prune_empty_ancestors(&self.layout, parent);
        }
        info!("已移到回收站: #{} {} -> {}", entry.id, entry.path, trash_rel);
        Ok(tombstone)
    }

    pub async fn restore(&self, _token: &OperationToken, tombstone_ids: &[i64]) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();
        for &id in tombstone_ids {
            match self.restore_one(id).await {
                Ok(entry) => report.restored.push(entry),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("恢复墓碑 #{} 失败: {}", id, e);
                    report.errors.push(format!("#{}: {}", id, e));
                }
            }
        }
        Ok(report)
    }

    async fn restore_one(&self, tombstone_id: i64) -> Result<LibraryEntry> {
        let tomb = DeletedEntry::load(&self.catalog, tombstone_id)
            .await?
            .ok_or_else(|| LibraryError::NotFound(format!("墓碑 #{}", tombstone_id)))?;
        if tomb.restored_at.is_some() {
            return Err(LibraryError::Invalid(format!("墓碑 #{} 已恢复", tombstone_id)));
        }

        let from = self.layout.absolute(&tomb.trash_path);
        let to = self.layout.absolute(&tomb.original_path);
        if tokio::fs::try_exists(&to).await.unwrap_or(false) {
            return Err(LibraryError::CanonicalPathOccupied(tomb.original_path.clone()));
        }

        let entry = &tomb.entry;
        if let DuplicateCheck::Duplicate(existing) = self
            .resolver
            .check(&entry.content_hash, entry.taken_at, None)
            .await?
        {
            self.record_duplicate(&tomb, existing.id).await?;
            return Err(LibraryError::DuplicateDetected {
                content_hash: entry.content_hash.clone(),
                taken_at: entry.taken_at,
                existing_id: existing.id,
            });
        }

        move_file(&from, &to)
            .await
            .map_err(|e| LibraryError::io(&from, e))?;

        let mut new_entry = NewEntry::from_entry(entry);
        new_entry.path = tomb.original_path.clone();
        match self.commit_restore(&new_entry, tomb.id).await {
            Ok(restored) => {
                info!("已恢复: {} -> #{}", tomb.original_path, restored.id);
                Ok(restored)
            }
            Err(e) => {
                revert(&to, &from).await;
                let e = self.resolver.reclassify(e).await;
                if let LibraryError::DuplicateDetected { existing_id, .. } = &e {
                    self.record_duplicate(&tomb, *existing_id).await?;
                }
                Err(e)
            }
        }
    }

    /// 墓碑与删除行在同一事务中
    async fn commit_delete(&self, entry: &LibraryEntry, trash_rel: &str) -> Result<i64> {
        let mut tx = self.catalog.begin().await?;
        let tombstone = DeletedEntry::record(&mut *tx, entry, trash_rel, USER_REASON).await?;
        LibraryEntry::delete(&mut *tx, entry.id).await?;
        tx.commit().await?;
        Ok(tombstone)
    }

    async fn commit_restore(&self, new_entry: &NewEntry, tombstone_id: i64) -> Result<LibraryEntry> {
        let mut tx = self.catalog.begin().await?;
        let restored = LibraryEntry::insert(&mut *tx, new_entry).await?;
        DeletedEntry::mark_restored(&mut *tx, tombstone_id).await?;
        tx.commit().await?;
        Ok(restored)
    }

    async fn record_duplicate(&self, tomb: &DeletedEntry, existing_id: i64) -> Result<()> {
        info!("恢复的文件与条目 #{} 重复，保留在回收站: {}", existing_id, tomb.trash_path);
        self.resolver
            .record(DuplicateRecord {
                operation_id: None,
                stage: DuplicateStage::Restore,
                source_path: &tomb.trash_path,
                quarantine_path: Some(&tomb.trash_path),
                content_hash: &tomb.entry.content_hash,
                taken_at: tomb.entry.taken_at,
                existing_entry_id: Some(existing_id),
            })
            .await?;
        Ok(())
    }
}

async fn revert(moved_to: &Path, original: &Path) {
    if let Err(e) = move_file(moved_to, original).await {
        error!("回滚移动失败 {:?} -> {:?}: {}", moved_to, original, e);
    }
}
