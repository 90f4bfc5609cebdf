//! 原子重建：在临时位置建一个全新的目录，完全成功后才替换当前目录
//!
//! 构建阶段的任何失败都不会触碰当前目录文件，也不会产生备份。

use crate::config::BackupConfig;
use crate::core::checkpoint::{CheckpointManager, OperationCheckpoint, OperationKind};
use crate::core::hash_cache::HashCache;
use crate::core::layout::LibraryLayout;
use crate::core::lock::OperationToken;
use crate::core::metadata::MetadataReader;
use crate::core::progress::{ProgressPhase, ProgressSink};
use crate::core::synchronizer::{LibrarySynchronizer, SyncOptions, SyncReport, SyncStatus};
use crate::db::{open_catalog, Catalog, DeletedEntryRow, LibraryEntry, SqlitePool};
use crate::error::{LibraryError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 重建报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub operation_id: String,
    pub success: bool,
    /// 替换前目录的备份，只在成功时存在
    pub backup_path: Option<PathBuf>,
    pub entries: u64,
    pub sync: SyncReport,
}

/// 原子重建器
pub struct AtomicRebuilder<'a> {
    layout: LibraryLayout,
    catalog: &'a Catalog,
    cache: Arc<HashCache>,
    checkpoints: Arc<CheckpointManager>,
    reader: Arc<dyn MetadataReader>,
    options: SyncOptions,
    backup: BackupConfig,
    cancelled: Arc<AtomicBool>,
    progress: ProgressSink,
}

impl<'a> AtomicRebuilder<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: LibraryLayout,
        catalog: &'a Catalog,
        cache: Arc<HashCache>,
        checkpoints: Arc<CheckpointManager>,
        reader: Arc<dyn MetadataReader>,
        mut options: SyncOptions,
        backup: BackupConfig,
        cancelled: Arc<AtomicBool>,
        progress: ProgressSink,
    ) -> Self {
        // 重建只写新目录，不移动文件、不清理目录
        options.relocate = false;
        options.prune_empty_dirs = false;
        Self {
            layout,
            catalog,
            cache,
            checkpoints,
            reader,
            options,
            backup,
            cancelled,
            progress,
        }
    }

    /// 清理上次崩溃留下的临时目录，并把对应的重建记录标为失败
    pub async fn recover_from_failed_rebuild(&self) -> Result<bool> {
        recover_stale_rebuild(&self.layout, &self.checkpoints).await
    }

    pub async fn rebuild(&self, token: &OperationToken) -> Result<RebuildReport> {
        self.recover_from_failed_rebuild().await?;

        let checkpoint = self.checkpoints.begin(OperationKind::Rebuild, None).await?;
        let temp_path = self.layout.rebuild_temp_path();
        info!("开始重建目录: {:?}", temp_path);

        // 失败时删除临时目录；成功替换后解除
        let temp_guard = scopeguard::guard(temp_path.clone(), |path| {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("删除临时目录失败 {:?}: {}", path, e);
                }
            }
        });

        let built = self.build(token, &checkpoint, &temp_path).await;
        let (sync, entries) = match built {
            Ok((sync, Some(entries))) => (sync, entries),
            Ok((sync, None)) => {
                // 临时目录随 guard 删除，取消的重建无法续跑
                self.checkpoints.fail(&checkpoint.id, "重建已取消").await?;
                info!("重建已取消，当前目录保持不变");
                return Ok(RebuildReport {
                    operation_id: checkpoint.id.clone(),
                    success: false,
                    backup_path: None,
                    entries: 0,
                    sync,
                });
            }
            Err(e) => {
                error!("重建失败，当前目录保持不变: {}", e);
                if let Err(save_err) = self.checkpoints.fail(&checkpoint.id, &e.to_string()).await {
                    warn!("无法记录失败状态: {}", save_err);
                }
                return Err(e);
            }
        };

        // 替换
        self.progress
            .phase(&checkpoint.id, OperationKind::Rebuild, ProgressPhase::Swapping, 0, 0)
            .await;
        let backup_path = next_backup_path(&self.layout.backup_dir());
        if let Err(e) = self.catalog.swap_in(&temp_path, &backup_path).await {
            error!("替换目录失败: {}", e);
            if let Err(save_err) = self.checkpoints.fail(&checkpoint.id, &e.to_string()).await {
                warn!("无法记录失败状态: {}", save_err);
            }
            return Err(e);
        }
        scopeguard::ScopeGuard::into_inner(temp_guard);

        let trimmed = trim_backups(&self.layout.backup_dir(), self.backup.max_backups).await;
        if trimmed > 0 {
            info!("删除了 {} 个旧备份", trimmed);
        }

        self.checkpoints.complete(&checkpoint.id).await?;
        self.progress
            .phase(&checkpoint.id, OperationKind::Rebuild, ProgressPhase::Finished, entries, entries)
            .await;
        info!("重建完成: {} 个条目, 备份 {:?}", entries, backup_path);

        Ok(RebuildReport {
            operation_id: checkpoint.id.clone(),
            success: true,
            backup_path: Some(backup_path),
            entries,
            sync,
        })
    }

    /// 在临时目录上执行完整扫描；取消时条目数为 None
    async fn build(
        &self,
        token: &OperationToken,
        checkpoint: &OperationCheckpoint,
        temp_path: &Path,
    ) -> Result<(SyncReport, Option<u64>)> {
        if tokio::fs::try_exists(temp_path).await.unwrap_or(false) {
            tokio::fs::remove_file(temp_path)
                .await
                .map_err(|e| LibraryError::io(temp_path, e))?;
        }

        let pool = Arc::new(open_catalog(temp_path).await?);
        let result = self.populate(token, checkpoint, &pool).await;
        pool.close().await;
        result
    }

    async fn populate(
        &self,
        token: &OperationToken,
        checkpoint: &OperationCheckpoint,
        pool: &Arc<SqlitePool>,
    ) -> Result<(SyncReport, Option<u64>)> {
        let synchronizer = LibrarySynchronizer::new(
            self.layout.clone(),
            pool.clone(),
            self.cache.clone(),
            self.checkpoints.clone(),
            self.reader.clone(),
            self.options.clone(),
            self.cancelled.clone(),
            self.progress.clone(),
        );

        let report = synchronizer.execute(token, checkpoint, false).await?;
        if report.status == SyncStatus::Cancelled {
            return Ok((report, None));
        }

        let carried = carry_over_tombstones(&*self.catalog.pool().await, pool).await?;
        if carried > 0 {
            info!("保留了 {} 条删除记录", carried);
        }

        let entries = LibraryEntry::count(pool).await?;
        Ok((report, Some(entries)))
    }
}

/// 删除残留的临时目录；返回是否发现了残留
pub async fn recover_stale_rebuild(
    layout: &LibraryLayout,
    checkpoints: &CheckpointManager,
) -> Result<bool> {
    let temp_path = layout.rebuild_temp_path();
    let found = tokio::fs::try_exists(&temp_path).await.unwrap_or(false);
    if found {
        warn!("发现上次未完成的重建，删除临时目录: {:?}", temp_path);
        tokio::fs::remove_file(&temp_path)
            .await
            .map_err(|e| LibraryError::io(&temp_path, e))?;
    }

    for stale in checkpoints.list_incomplete().await? {
        if stale.kind == OperationKind::Rebuild {
            checkpoints.fail(&stale.id, "重建被中断").await?;
        }
    }
    Ok(found)
}

/// 删除记录（墓碑）不属于磁盘扫描的结果，从旧目录原样带到新目录
async fn carry_over_tombstones(active: &SqlitePool, rebuilt: &SqlitePool) -> Result<u64> {
    let rows = sqlx::query_as::<_, DeletedEntryRow>("SELECT * FROM deleted_entries ORDER BY id")
        .fetch_all(active)
        .await?;

    let mut tx = rebuilt.begin().await?;
    for row in &rows {
        sqlx::query(
            r#"INSERT INTO deleted_entries
               (id, entry_id, original_path, trash_path, reason, entry_data, deleted_at, restored_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(row.id)
        .bind(row.entry_id)
        .bind(&row.original_path)
        .bind(&row.trash_path)
        .bind(&row.reason)
        .bind(&row.entry_data)
        .bind(row.deleted_at)
        .bind(row.restored_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(rows.len() as u64)
}

/// `catalog_YYYYMMDD_HHMMSS.db`，同一秒内重复时追加 `_N`
pub fn next_backup_path(backup_dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let candidate = backup_dir.join(format!("catalog_{}.db", stamp));
    if !candidate.exists() {
        return candidate;
    }

    let mut counter = 1;
    loop {
        let candidate = backup_dir.join(format!("catalog_{}_{}.db", stamp, counter));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// 只保留最新的 `keep` 个备份，返回删除数量
pub async fn trim_backups(backup_dir: &Path, keep: usize) -> usize {
    let mut backups = Vec::new();
    let mut dir = match tokio::fs::read_dir(backup_dir).await {
        Ok(dir) => dir,
        Err(_) => return 0,
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("catalog_") && name.ends_with(".db") {
            backups.push(entry.path());
        }
    }

    // 文件名以时间戳开头，字典序即时间序
    backups.sort();
    let excess = backups.len().saturating_sub(keep);
    let mut removed = 0;
    for path in backups.into_iter().take(excess) {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("删除旧备份失败 {:?}: {}", path, e),
        }
    }
    removed
}
