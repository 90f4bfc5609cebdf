//! 内容寻址的媒体库目录：增量同步、原子重建、导入与元数据改写

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;

use crate::config::LibraryConfig;
use crate::core::checkpoint::{CheckpointManager, CheckpointTicker, OperationCheckpoint};
use crate::core::duplicate::{IdentityGroup, SharedContent};
use crate::core::rebuild::recover_stale_rebuild;
use crate::db::{Catalog, SqlitePool};

pub use crate::core::{
    AdoptionSummary, CacheStats, DeleteReport, DuplicateEvent, ExifTool, FileOutcome,
    LibraryLayout, MetadataChange, MetadataReader, MetadataWriter, OperationKind, ProgressEvent,
    ProgressPhase, QuarantineCategory, RebuildReport, RestoreReport, RewriteOutcome, SyncPreview,
    SyncReport,
};
pub use crate::core::{ContentHasher, OperationToken};
pub use crate::db::{CaptureTime, DeletedEntry, LibraryEntry, MediaKind};
pub use crate::error::{LibraryError, Result};

use crate::core::{
    AdoptionPipeline, AtomicRebuilder, Blake3Hasher, DuplicateResolver, HashCache,
    LibrarySynchronizer, MetadataRewriteCoordinator, OperationLock, ProgressSink, RewriteSubject,
    ScanConfig, SyncOptions, TrashBin,
};

/// 批量改写结果
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEditReport {
    pub operation_id: String,
    pub updated: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub cancelled: bool,
    pub errors: Vec<String>,
}

/// 一个打开的媒体库，拥有所有组件
///
/// 结构性操作（同步、重建、导入、改写、删除、恢复）在内部获取操作锁后串行执行。
pub struct Library {
    layout: LibraryLayout,
    config: LibraryConfig,
    catalog: Catalog,
    state: Arc<SqlitePool>,
    cache: Arc<HashCache>,
    checkpoints: Arc<CheckpointManager>,
    lock: OperationLock,
    reader: Arc<dyn MetadataReader>,
    writer: Arc<dyn MetadataWriter>,
    cancelled: Arc<AtomicBool>,
    progress: ProgressSink,
}

impl Library {
    /// 使用 `config.json` 中的配置和外部工具打开媒体库
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let layout = LibraryLayout::new(root);
        let config = LibraryConfig::load(&layout.meta_dir());
        let hasher = Arc::new(Blake3Hasher::new(config.cache.chunk_size));
        let tool = Arc::new(ExifTool::new());
        Self::open_with(layout.root(), config, tool.clone(), tool, hasher).await
    }

    /// 使用指定的配置、元数据读写器和哈希算法打开媒体库
    pub async fn open_with(
        root: impl Into<PathBuf>,
        config: LibraryConfig,
        reader: Arc<dyn MetadataReader>,
        writer: Arc<dyn MetadataWriter>,
        hasher: Arc<dyn ContentHasher>,
    ) -> Result<Self> {
        let layout = LibraryLayout::new(root);
        layout
            .ensure_dirs()
            .map_err(|e| LibraryError::io(layout.meta_dir(), e))?;

        let state = Arc::new(db::open_state(&layout.state_path()).await?);
        let checkpoints = Arc::new(CheckpointManager::new(state.clone()));
        if recover_stale_rebuild(&layout, &checkpoints).await? {
            warn!("已清理上次中断的重建");
        }

        let catalog = Catalog::open(&layout.catalog_path()).await?;
        let cache = Arc::new(HashCache::new(
            state.clone(),
            hasher,
            config.cache.memory_capacity,
        ));

        info!("媒体库已打开: {:?}", layout.root());
        Ok(Self {
            layout,
            config,
            catalog,
            state,
            cache,
            checkpoints,
            lock: OperationLock::new(),
            reader,
            writer,
            cancelled: Arc::new(AtomicBool::new(false)),
            progress: ProgressSink::disabled(),
        })
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &LibraryLayout {
        &self.layout
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    /// 订阅进度事件；之后开始的操作都会发送到返回的接收端
    pub fn subscribe(&mut self, buffer: usize) -> mpsc::Receiver<ProgressEvent> {
        let (sink, rx) = ProgressSink::channel(buffer);
        self.progress = sink;
        rx
    }

    /// 请求取消当前操作，在下一个文件边界生效
    pub fn cancel(&self) {
        info!("收到取消请求");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 可以在其他任务中使用的取消标志
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// 当前正在进行的结构性操作
    pub fn current_operation(&self) -> Option<OperationKind> {
        self.lock.current()
    }

    async fn begin(&self, kind: OperationKind) -> OperationToken {
        let token = self.lock.acquire(kind).await;
        self.cancelled.store(false, Ordering::SeqCst);
        token
    }

    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            exclude_patterns: self.config.sync.exclude_patterns.clone(),
        }
    }

    async fn coordinator(&self) -> MetadataRewriteCoordinator {
        MetadataRewriteCoordinator::new(
            self.layout.clone(),
            self.catalog.pool().await,
            self.cache.clone(),
            self.writer.clone(),
        )
    }

    /// 增量同步，有未完成的同步时续跑
    pub async fn synchronize(&self) -> Result<SyncReport> {
        let token = self.begin(OperationKind::Synchronize).await;
        self.synchronizer(self.catalog.pool().await).run(&token).await
    }

    /// 预览下一次同步会删除、新增的条目和会清理的空目录，不加锁也不做任何修改
    pub async fn preview_sync(&self) -> Result<SyncPreview> {
        self.synchronizer(self.catalog.pool().await).preview().await
    }

    fn synchronizer(&self, catalog: Arc<SqlitePool>) -> LibrarySynchronizer {
        LibrarySynchronizer::new(
            self.layout.clone(),
            catalog,
            self.cache.clone(),
            self.checkpoints.clone(),
            self.reader.clone(),
            SyncOptions::from(&self.config.sync),
            self.cancelled.clone(),
            self.progress.clone(),
        )
    }

    /// 从磁盘重建目录，成功后原子替换
    pub async fn rebuild(&self) -> Result<RebuildReport> {
        let token = self.begin(OperationKind::Rebuild).await;
        let rebuilder = AtomicRebuilder::new(
            self.layout.clone(),
            &self.catalog,
            self.cache.clone(),
            self.checkpoints.clone(),
            self.reader.clone(),
            SyncOptions::from(&self.config.sync),
            self.config.backup.clone(),
            self.cancelled.clone(),
            self.progress.clone(),
        );
        rebuilder.rebuild(&token).await
    }

    /// 把根目录下未整理的文件导入为规范布局
    pub async fn adopt(&self) -> Result<AdoptionSummary> {
        let token = self.begin(OperationKind::Adopt).await;
        let pipeline = AdoptionPipeline::new(
            self.layout.clone(),
            self.catalog.pool().await,
            self.cache.clone(),
            self.checkpoints.clone(),
            self.reader.clone(),
            self.writer.clone(),
            self.config.adopt.clone(),
            self.scan_config(),
            self.cancelled.clone(),
            self.progress.clone(),
        );
        pipeline.run(&token).await
    }

    /// 改写单个条目的拍摄时间或评分
    pub async fn edit_metadata(&self, entry_id: i64, change: MetadataChange) -> Result<RewriteOutcome> {
        let token = self.begin(OperationKind::BulkEdit).await;
        let entry = self.require_entry(entry_id).await?;
        self.coordinator()
            .await
            .apply(&token, RewriteSubject::Entry(entry), change, None)
            .await
    }

    /// 对多个条目应用同一改写，逐个提交并保存检查点
    pub async fn edit_metadata_bulk(
        &self,
        entry_ids: &[i64],
        change: MetadataChange,
    ) -> Result<BulkEditReport> {
        let token = self.begin(OperationKind::BulkEdit).await;
        let context = serde_json::to_string(&serde_json::json!({
            "entryIds": entry_ids,
            "change": change,
        }))?;
        let checkpoint = self
            .checkpoints
            .begin(OperationKind::BulkEdit, Some(&context))
            .await?;

        match self.run_bulk_edit(&token, &checkpoint, entry_ids, change).await {
            Ok(report) => {
                if report.cancelled {
                    self.checkpoints.fail(&checkpoint.id, "已取消").await?;
                } else {
                    self.checkpoints.complete(&checkpoint.id).await?;
                }
                Ok(report)
            }
            Err(e) => {
                if let Err(save_err) = self.checkpoints.fail(&checkpoint.id, &e.to_string()).await {
                    warn!("无法记录失败状态: {}", save_err);
                }
                Err(e)
            }
        }
    }

    async fn run_bulk_edit(
        &self,
        token: &OperationToken,
        checkpoint: &OperationCheckpoint,
        entry_ids: &[i64],
        change: MetadataChange,
    ) -> Result<BulkEditReport> {
        let op_id = checkpoint.id.as_str();
        let mut report = BulkEditReport {
            operation_id: op_id.to_string(),
            updated: 0,
            duplicates: 0,
            failed: 0,
            cancelled: false,
            errors: Vec::new(),
        };
        let coordinator = self.coordinator().await;
        let pool = self.catalog.pool().await;
        let mut ticker = CheckpointTicker::new(
            &self.checkpoints,
            checkpoint,
            self.config.sync.checkpoint_interval,
        );
        let total = entry_ids.len() as u64;

        for (index, &id) in entry_ids.iter().enumerate() {
            if self.cancelled.load(Ordering::SeqCst) {
                report.cancelled = true;
                break;
            }

            let result = match LibraryEntry::load(&pool, id).await? {
                Some(entry) => {
                    coordinator
                        .apply(token, RewriteSubject::Entry(entry), change, Some(op_id))
                        .await
                }
                None => Err(LibraryError::NotFound(format!("条目 #{}", id))),
            };
            let (path, outcome) = match result {
                Ok(RewriteOutcome::Committed(entry)) => {
                    report.updated += 1;
                    (entry.path, FileOutcome::Relocated)
                }
                Ok(RewriteOutcome::DuplicateQuarantined {
                    quarantine_path, ..
                }) => {
                    report.duplicates += 1;
                    (quarantine_path, FileOutcome::Duplicate)
                }
                Err(e) if e.is_fatal() => {
                    ticker.flush(None).await?;
                    return Err(e);
                }
                Err(e) => {
                    warn!("改写条目 #{} 失败: {}", id, e);
                    report.failed += 1;
                    report.errors.push(format!("#{}: {}", id, e));
                    (format!("#{}", id), FileOutcome::Failed)
                }
            };

            ticker.advance(&id.to_string(), None).await?;
            self.progress
                .file(
                    op_id,
                    OperationKind::BulkEdit,
                    ProgressPhase::Processing,
                    index as u64 + 1,
                    total,
                    &path,
                    outcome,
                )
                .await;
        }
        ticker.flush(None).await?;

        info!(
            "批量改写完成: 成功 {}, 重复 {}, 失败 {}",
            report.updated, report.duplicates, report.failed
        );
        Ok(report)
    }

    /// 软删除：文件移到回收站并留下墓碑
    pub async fn delete_entries(&self, entry_ids: &[i64]) -> Result<DeleteReport> {
        let token = self.begin(OperationKind::BulkEdit).await;
        self.trash().await.delete(&token, entry_ids).await
    }

    /// 从回收站恢复
    pub async fn restore_entries(&self, tombstone_ids: &[i64]) -> Result<RestoreReport> {
        let token = self.begin(OperationKind::BulkEdit).await;
        self.trash().await.restore(&token, tombstone_ids).await
    }

    async fn trash(&self) -> TrashBin {
        TrashBin::new(self.layout.clone(), self.catalog.pool().await, self.cache.clone())
    }

    async fn require_entry(&self, entry_id: i64) -> Result<LibraryEntry> {
        LibraryEntry::load(&*self.catalog.pool().await, entry_id)
            .await?
            .ok_or_else(|| LibraryError::NotFound(format!("条目 #{}", entry_id)))
    }

    pub async fn entries(&self) -> Result<Vec<LibraryEntry>> {
        LibraryEntry::load_all(&*self.catalog.pool().await).await
    }

    pub async fn entry(&self, entry_id: i64) -> Result<Option<LibraryEntry>> {
        LibraryEntry::load(&*self.catalog.pool().await, entry_id).await
    }

    pub async fn deleted_entries(&self) -> Result<Vec<DeletedEntry>> {
        self.trash().await.list().await
    }

    /// 重复事件，可按操作 id 过滤
    pub async fn duplicate_events(&self, operation_id: Option<&str>) -> Result<Vec<DuplicateEvent>> {
        DuplicateResolver::new(self.catalog.pool().await)
            .events(operation_id)
            .await
    }

    /// 违反唯一性的身份组，正常情况下为空
    pub async fn audit_duplicates(&self) -> Result<Vec<IdentityGroup>> {
        DuplicateResolver::new(self.catalog.pool().await).audit().await
    }

    /// 内容相同但拍摄时间不同的条目，属于合法情况，仅供查看
    pub async fn shared_content(&self) -> Result<Vec<SharedContent>> {
        DuplicateResolver::new(self.catalog.pool().await)
            .shared_content()
            .await
    }

    pub async fn incomplete_operations(&self) -> Result<Vec<OperationCheckpoint>> {
        self.checkpoints.list_incomplete().await
    }

    pub async fn operation(&self, operation_id: &str) -> Result<Option<OperationCheckpoint>> {
        self.checkpoints.get(operation_id).await
    }

    /// 清理过期的操作记录和已不存在文件的哈希缓存
    pub async fn cleanup_operations(&self) -> Result<u64> {
        let removed = self
            .checkpoints
            .cleanup_old(self.config.maintenance.checkpoint_retention_days)
            .await?;
        let pruned = self.cache.prune_missing().await?;
        info!("维护完成: 操作记录 {} 条, 缓存 {} 条", removed, pruned);
        Ok(removed)
    }

    pub async fn hash_cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// 关闭数据库连接
    pub async fn close(&self) {
        info!("正在关闭媒体库...");
        self.cancel();
        self.catalog.close().await;
        self.state.close().await;
    }
}
