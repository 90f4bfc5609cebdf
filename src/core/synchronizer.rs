//! 媒体库同步：让目录与磁盘一致
//!
//! 目录中有而磁盘上没有的条目（ghost）被删除；磁盘上有而目录中没有的文件（mole）
//! 计算 hash、读取元数据后入库。同步从不修改文件字节，只改目录行、
//! 文件位置（增量模式下移动到规范路径）和空目录结构。

use crate::config::SyncSettings;
use crate::core::checkpoint::{
    CheckpointManager, CheckpointTicker, OperationCheckpoint, OperationKind,
};
use crate::core::comparator::{DiffSummary, LibraryComparator};
use crate::core::duplicate::{DuplicateCheck, DuplicateRecord, DuplicateResolver, DuplicateStage};
use crate::core::hash_cache::HashCache;
use crate::core::layout::{
    canonical_path_for, find_empty_dirs, move_file, prune_empty_dirs, LibraryLayout,
};
use crate::core::lock::OperationToken;
use crate::core::metadata::{capture_time_or_mtime, MetadataError, MetadataReader};
use crate::core::progress::{FileOutcome, ProgressPhase, ProgressSink};
use crate::core::scanner::{FileScanner, ScanConfig, ScannedFile};
use crate::db::{CaptureTime, LibraryEntry, NewEntry, SqlitePool};
use crate::error::{LibraryError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 同步选项
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// 把新文件和不在规范路径的条目移动到规范路径（重建时关闭）
    pub relocate: bool,
    pub prune_empty_dirs: bool,
    pub checkpoint_interval: usize,
    pub scan: ScanConfig,
}

impl From<&SyncSettings> for SyncOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            relocate: settings.relocate_moles,
            prune_empty_dirs: settings.prune_empty_dirs,
            checkpoint_interval: settings.checkpoint_interval,
            scan: ScanConfig {
                exclude_patterns: settings.exclude_patterns.clone(),
            },
        }
    }
}

/// 同步结束状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    /// 在文件边界被取消，检查点已暂停，可续跑
    Cancelled,
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub operation_id: String,
    pub resumed: bool,
    pub status: SyncStatus,
    pub scanned: u64,
    pub added: u64,
    pub removed: u64,
    pub duplicates: u64,
    /// 之前的同步已记录过、仍留在原位的重复文件
    pub known_duplicates: u64,
    pub failed: u64,
    pub relocated: u64,
    /// 规范路径被占用、只能留在原位的条目数
    pub non_canonical: u64,
    pub pruned_dirs: Vec<String>,
    pub errors: Vec<String>,
    pub started_at: i64,
    pub finished_at: i64,
}

impl SyncReport {
    fn new(operation_id: &str, resumed: bool) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            resumed,
            status: SyncStatus::Completed,
            scanned: 0,
            added: 0,
            removed: 0,
            duplicates: 0,
            known_duplicates: 0,
            failed: 0,
            relocated: 0,
            non_canonical: 0,
            pruned_dirs: Vec::new(),
            errors: Vec::new(),
            started_at: chrono::Utc::now().timestamp(),
            finished_at: 0,
        }
    }
}

/// 同步预览：下一次同步会处理的内容，生成时不改动磁盘和目录
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPreview {
    #[serde(flatten)]
    pub summary: DiffSummary,
    pub ghosts: Vec<String>,
    pub moles: Vec<String>,
    /// 当前已经为空、同步结束时会被清理的目录
    pub empty_dirs: Vec<String>,
}

/// 单个 mole 的处理结果
enum MoleOutcome {
    Added { relocated: bool, in_place: bool },
    Duplicate,
    /// 已记录过的重复，不再计数也不再写事件
    KnownDuplicate,
}

/// 同步器
pub struct LibrarySynchronizer {
    layout: LibraryLayout,
    catalog: Arc<SqlitePool>,
    cache: Arc<HashCache>,
    checkpoints: Arc<CheckpointManager>,
    reader: Arc<dyn MetadataReader>,
    options: SyncOptions,
    cancelled: Arc<AtomicBool>,
    progress: ProgressSink,
}

impl LibrarySynchronizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: LibraryLayout,
        catalog: Arc<SqlitePool>,
        cache: Arc<HashCache>,
        checkpoints: Arc<CheckpointManager>,
        reader: Arc<dyn MetadataReader>,
        options: SyncOptions,
        cancelled: Arc<AtomicBool>,
        progress: ProgressSink,
    ) -> Self {
        Self {
            layout,
            catalog,
            cache,
            checkpoints,
            reader,
            options,
            cancelled,
            progress,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 增量同步：有未完成的同步就续跑，否则开始新的
    pub async fn run(&self, token: &OperationToken) -> Result<SyncReport> {
        let (checkpoint, resumed) = self
            .checkpoints
            .resume_or_begin(OperationKind::Synchronize, None)
            .await?;

        match self.execute(token, &checkpoint, resumed).await {
            Ok(report) => {
                match report.status {
                    SyncStatus::Completed => self.checkpoints.complete(&checkpoint.id).await?,
                    SyncStatus::Cancelled => self.checkpoints.pause(&checkpoint.id).await?,
                }
                Ok(report)
            }
            Err(e) => {
                error!("同步失败: {}", e);
                if let Err(save_err) = self.checkpoints.fail(&checkpoint.id, &e.to_string()).await {
                    warn!("无法记录失败状态: {}", save_err);
                }
                Err(e)
            }
        }
    }

    /// 只读预览：扫描并比对，不计算 hash，不需要操作锁
    pub async fn preview(&self) -> Result<SyncPreview> {
        let disk = FileScanner::with_config(self.options.scan.clone())
            .scan(&self.layout)
            .await?;
        let catalog = LibraryEntry::load_all(&self.catalog).await?;
        let diff = LibraryComparator::diff(disk, catalog);

        let empty_dirs = if self.options.prune_empty_dirs {
            let layout = self.layout.clone();
            tokio::task::spawn_blocking(move || find_empty_dirs(&layout))
                .await
                .map_err(|e| LibraryError::Invalid(format!("查找空目录任务失败: {}", e)))?
        } else {
            Vec::new()
        };

        let preview = SyncPreview {
            summary: diff.summary(),
            ghosts: diff.ghosts.into_iter().map(|e| e.path).collect(),
            moles: diff.moles.into_iter().map(|f| f.rel_path).collect(),
            empty_dirs,
        };
        debug!(
            "同步预览: {} 个 ghost, {} 个 mole, {} 个空目录",
            preview.ghosts.len(),
            preview.moles.len(),
            preview.empty_dirs.len()
        );
        Ok(preview)
    }

    /// 在给定检查点下执行一次完整同步；检查点状态由调用方收尾
    pub async fn execute(
        &self,
        _token: &OperationToken,
        checkpoint: &OperationCheckpoint,
        resumed: bool,
    ) -> Result<SyncReport> {
        let op_id = checkpoint.id.as_str();
        let kind = checkpoint.kind;
        let mut report = SyncReport::new(op_id, resumed);
        info!("开始同步: {:?} ({}, 续跑: {})", self.layout.root(), op_id, resumed);

        // 1. 扫描
        self.progress
            .phase(op_id, kind, ProgressPhase::Scanning, 0, 0)
            .await;
        let scanner = FileScanner::with_config(self.options.scan.clone())
            .with_cancel(self.cancelled.clone());
        let disk = match scanner.scan(&self.layout).await {
            Ok(files) => files,
            Err(LibraryError::Cancelled) => return Ok(self.cancelled_report(report)),
            Err(e) => return Err(e),
        };
        report.scanned = disk.len() as u64;

        let catalog = LibraryEntry::load_all(&self.catalog).await?;
        let diff = LibraryComparator::diff(disk, catalog);
        let summary = diff.summary();
        info!(
            "差异: {} 个 ghost, {} 个 mole, {} 个已跟踪 ({} 个不在规范路径)",
            summary.ghosts, summary.moles, summary.tracked, summary.non_canonical
        );

        // 2. 删除 ghost
        let ghost_total = diff.ghosts.len() as u64;
        for (index, ghost) in diff.ghosts.iter().enumerate() {
            if self.is_cancelled() {
                return Ok(self.cancelled_report(report));
            }
            let mut conn = self.catalog.acquire().await?;
            if LibraryEntry::delete(&mut conn, ghost.id).await? {
                debug!("删除 ghost: #{} {}", ghost.id, ghost.path);
                report.removed += 1;
            }
            self.progress
                .file(
                    op_id,
                    kind,
                    ProgressPhase::Removing,
                    index as u64 + 1,
                    ghost_total,
                    &ghost.path,
                    FileOutcome::Removed,
                )
                .await;
        }

        // 3. 处理 mole
        let moles = if resumed {
            LibraryComparator::resume_order(diff.moles, checkpoint.marker.as_deref())
        } else {
            diff.moles
        };
        let mole_total = moles.len() as u64;
        let resolver = DuplicateResolver::new(self.catalog.clone());
        let mut ticker =
            CheckpointTicker::new(&self.checkpoints, checkpoint, self.options.checkpoint_interval);

        for (index, file) in moles.iter().enumerate() {
            // 只在文件边界响应取消
            if self.is_cancelled() {
                ticker.flush(None).await?;
                return Ok(self.cancelled_report(report));
            }

            let outcome = match self.process_mole(file, &resolver, op_id).await {
                Ok(MoleOutcome::Added { relocated, in_place }) => {
                    report.added += 1;
                    if relocated {
                        report.relocated += 1;
                    }
                    if in_place {
                        report.non_canonical += 1;
                    }
                    FileOutcome::Added
                }
                Ok(MoleOutcome::Duplicate) => {
                    report.duplicates += 1;
                    FileOutcome::Duplicate
                }
                Ok(MoleOutcome::KnownDuplicate) => {
                    report.known_duplicates += 1;
                    FileOutcome::Duplicate
                }
                Err(e) if e.is_fatal() => {
                    ticker.flush(None).await?;
                    return Err(e);
                }
                Err(e) => {
                    warn!("处理文件失败 {}: {}", file.rel_path, e);
                    report.failed += 1;
                    report.errors.push(format!("{}: {}", file.rel_path, e));
                    FileOutcome::Failed
                }
            };

            ticker.advance(&file.rel_path, None).await?;
            self.progress
                .file(
                    op_id,
                    kind,
                    ProgressPhase::Processing,
                    index as u64 + 1,
                    mole_total,
                    &file.rel_path,
                    outcome,
                )
                .await;
        }
        ticker.flush(None).await?;

        // 4. 已跟踪但不在规范路径的条目
        if self.options.relocate {
            self.progress
                .phase(op_id, kind, ProgressPhase::Reconciling, 0, 0)
                .await;
            for entry in diff
                .tracked
                .iter()
                .filter(|e| !LibraryComparator::is_canonical(e))
            {
                if self.is_cancelled() {
                    return Ok(self.cancelled_report(report));
                }
                match self.reconcile(entry).await {
                    Ok(true) => report.relocated += 1,
                    Ok(false) => report.non_canonical += 1,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("移动到规范路径失败 {}: {}", entry.path, e);
                        report.non_canonical += 1;
                        report.errors.push(format!("{}: {}", entry.path, e));
                    }
                }
            }
        }

        // 5. 清理空目录
        if self.options.prune_empty_dirs {
            self.progress
                .phase(op_id, kind, ProgressPhase::Pruning, 0, 0)
                .await;
            let layout = self.layout.clone();
            report.pruned_dirs = tokio::task::spawn_blocking(move || prune_empty_dirs(&layout))
                .await
                .map_err(|e| LibraryError::Invalid(format!("清理目录任务失败: {}", e)))?;
        }

        report.finished_at = chrono::Utc::now().timestamp();
        self.progress
            .phase(op_id, kind, ProgressPhase::Finished, mole_total, mole_total)
            .await;
        info!(
            "同步完成: 新增 {}, 删除 {}, 重复 {} (已知 {}), 失败 {}, 移动 {}, 清理目录 {}",
            report.added,
            report.removed,
            report.duplicates,
            report.known_duplicates,
            report.failed,
            report.relocated,
            report.pruned_dirs.len()
        );
        Ok(report)
    }

    fn cancelled_report(&self, mut report: SyncReport) -> SyncReport {
        info!("同步已取消: {}", report.operation_id);
        report.status = SyncStatus::Cancelled;
        report.finished_at = chrono::Utc::now().timestamp();
        report
    }

    /// hash → 元数据 → 重复预检 → 入库 → 移动到规范路径
    async fn process_mole(
        &self,
        file: &ScannedFile,
        resolver: &DuplicateResolver,
        op_id: &str,
    ) -> Result<MoleOutcome> {
        let content_hash = self.cache.get_or_compute(&file.abs_path).await?;
        let taken_at = capture_time_or_mtime(self.reader.as_ref(), &file.abs_path, file.kind).await?;
        let dimensions = match self.reader.dimensions(&file.abs_path, file.kind).await {
            Ok(d) => d,
            Err(MetadataError::Corrupted(reason)) => {
                return Err(LibraryError::Corrupted {
                    path: file.abs_path.clone(),
                    reason,
                })
            }
            Err(e) => {
                debug!("无法读取尺寸 {}: {}", file.rel_path, e);
                None
            }
        };

        if let DuplicateCheck::Duplicate(existing) =
            resolver.check(&content_hash, taken_at, None).await?
        {
            if resolver
                .is_recorded_in_place(&file.rel_path, &content_hash, taken_at)
                .await?
            {
                debug!("重复文件已记录过: {}", file.rel_path);
                return Ok(MoleOutcome::KnownDuplicate);
            }
            let stage = DuplicateStage::Sync;
            self.record_duplicate(resolver, op_id, stage, file, &content_hash, taken_at, existing.id)
                .await?;
            return Ok(MoleOutcome::Duplicate);
        }

        let canonical = canonical_path_for(taken_at, &content_hash, &file.abs_path);
        let mut target = file.rel_path.clone();
        let mut in_place = false;
        if self.options.relocate && canonical != file.rel_path {
            if tokio::fs::try_exists(self.layout.absolute(&canonical))
                .await
                .unwrap_or(false)
            {
                debug!("规范路径已被占用，保持原位: {}", canonical);
                in_place = true;
            } else {
                target = canonical;
            }
        }

        let new_entry = NewEntry {
            path: target.clone(),
            original_filename: file
                .abs_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            content_hash: content_hash.clone(),
            taken_at,
            file_size: file.size,
            kind: file.kind,
            width: dimensions.map(|d| d.0),
            height: dimensions.map(|d| d.1),
            rating: 0,
        };

        let mut conn = self.catalog.acquire().await?;
        let entry = match LibraryEntry::insert(&mut conn, &new_entry).await {
            Ok(entry) => entry,
            Err(e @ LibraryError::IntegrityViolation { .. }) => {
                drop(conn);
                let existing_id = match resolver.reclassify(e).await {
                    LibraryError::DuplicateDetected { existing_id, .. } => existing_id,
                    other => return Err(other),
                };
                let stage = DuplicateStage::Insert;
                self.record_duplicate(resolver, op_id, stage, file, &content_hash, taken_at, existing_id)
                    .await?;
                return Ok(MoleOutcome::Duplicate);
            }
            Err(e) => return Err(e),
        };

        if target == file.rel_path {
            return Ok(MoleOutcome::Added {
                relocated: false,
                in_place,
            });
        }

        // 行与移动作为一个单元：移动失败时撤销插入
        let target_abs = self.layout.absolute(&target);
        if let Err(e) = move_file(&file.abs_path, &target_abs).await {
            LibraryEntry::delete(&mut conn, entry.id).await?;
            return Err(LibraryError::io(&file.abs_path, e));
        }
        drop(conn);
        self.cache.relocate(&file.abs_path, &target_abs).await?;
        debug!("新文件已入库: {} -> {}", file.rel_path, target);

        Ok(MoleOutcome::Added {
            relocated: true,
            in_place,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_duplicate(
        &self,
        resolver: &DuplicateResolver,
        op_id: &str,
        stage: DuplicateStage,
        file: &ScannedFile,
        content_hash: &str,
        taken_at: CaptureTime,
        existing_id: i64,
    ) -> Result<()> {
        info!("重复文件保持原位: {} (已有条目 #{})", file.rel_path, existing_id);
        resolver
            .record(DuplicateRecord {
                operation_id: Some(op_id),
                stage,
                source_path: &file.rel_path,
                quarantine_path: None,
                content_hash,
                taken_at,
                existing_entry_id: Some(existing_id),
            })
            .await?;
        Ok(())
    }

    /// 把已跟踪的条目移动到规范路径；目标被占用时返回 false
    async fn reconcile(&self, entry: &LibraryEntry) -> Result<bool> {
        let canonical = LibraryComparator::canonical_of(entry);
        let from = self.layout.absolute(&entry.path);
        let to = self.layout.absolute(&canonical);
        if tokio::fs::try_exists(&to).await.unwrap_or(false) {
            return Ok(false);
        }

        move_file(&from, &to)
            .await
            .map_err(|e| LibraryError::io(&from, e))?;

        let mut conn = self.catalog.acquire().await?;
        if let Err(e) = LibraryEntry::update_path(&mut conn, entry.id, &canonical).await {
            if let Err(revert) = move_file(&to, &from).await {
                error!("回滚移动失败 {:?}: {}", to, revert);
            }
            return Err(e);
        }
        drop(conn);

        self.cache.relocate(&from, &to).await?;
        debug!("移动到规范路径: {} -> {}", entry.path, canonical);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hasher::Blake3Hasher;
    use crate::core::lock::OperationLock;
    use crate::db::MediaKind;
    use async_trait::async_trait;
    use std::path::Path;

    /// 文件内容第一行之后的 `#taken=` 即拍摄时间
    struct TrailerReader;

    #[async_trait]
    impl MetadataReader for TrailerReader {
        async fn capture_time(
            &self,
            path: &Path,
            _kind: MediaKind,
        ) -> std::result::Result<Option<CaptureTime>, MetadataError> {
            let text = tokio::fs::read_to_string(path).await?;
            Ok(text
                .lines()
                .find_map(|l| l.strip_prefix("#taken="))
                .and_then(CaptureTime::parse))
        }

        async fn dimensions(
            &self,
            _path: &Path,
            _kind: MediaKind,
        ) -> std::result::Result<Option<(u32, u32)>, MetadataError> {
            Ok(Some((4, 3)))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: LibraryLayout,
        catalog: Arc<SqlitePool>,
        sync: LibrarySynchronizer,
        lock: OperationLock,
    }

    async fn fixture(relocate: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = LibraryLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        let catalog = Arc::new(crate::db::open_catalog(&layout.catalog_path()).await.unwrap());
        let state = Arc::new(crate::db::open_state(&layout.state_path()).await.unwrap());
        let cache = Arc::new(HashCache::new(state.clone(), Arc::new(Blake3Hasher::default()), 64));
        let sync = LibrarySynchronizer::new(
            layout.clone(),
            catalog.clone(),
            cache,
            Arc::new(CheckpointManager::new(state)),
            Arc::new(TrailerReader),
            SyncOptions {
                relocate,
                prune_empty_dirs: true,
                checkpoint_interval: 2,
                scan: ScanConfig::default(),
            },
            Arc::new(AtomicBool::new(false)),
            ProgressSink::disabled(),
        );
        Fixture {
            _dir: dir,
            layout,
            catalog,
            sync,
            lock: OperationLock::new(),
        }
    }

    fn write(root: &Path, rel: &str, body: &str, taken: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, format!("{}\n#taken={}\n", body, taken)).unwrap();
    }

    #[tokio::test]
    async fn moles_are_added_at_canonical_path() {
        let f = fixture(true).await;
        write(f.layout.root(), "inbox/a.jpg", "a", "2023:06:01 10:00:00");
        write(f.layout.root(), "inbox/b.JPG", "b", "2024:01:02 03:04:05");

        let token = f.lock.acquire(OperationKind::Synchronize).await;
        let report = f.sync.run(&token).await.unwrap();
        assert_eq!(report.status, SyncStatus::Completed);
        assert_eq!(report.added, 2);
        assert_eq!(report.relocated, 2);
        assert_eq!(report.pruned_dirs, vec!["inbox"]);

        let entries = LibraryEntry::load_all(&f.catalog).await.unwrap();
        assert!(entries.iter().all(LibraryComparator::is_canonical));
        assert!(entries.iter().all(|e| f.layout.absolute(&e.path).exists()));
        assert_eq!(entries[1].original_filename, "b.JPG");
        assert!(entries[1].path.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn identical_file_with_same_date_is_a_duplicate() {
        let f = fixture(false).await;
        write(f.layout.root(), "a.jpg", "same", "2023:06:01 10:00:00");
        write(f.layout.root(), "copy/a.jpg", "same", "2023:06:01 10:00:00");
        write(f.layout.root(), "other.jpg", "same", "2023:06:01 10:00:01");

        let token = f.lock.acquire(OperationKind::Synchronize).await;
        let report = f.sync.run(&token).await.unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.duplicates, 1);
        // 重复文件留在原位
        assert!(f.layout.root().join("copy/a.jpg").exists());
        assert_eq!(LibraryEntry::count(&f.catalog).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rebuild_mode_never_moves_files() {
        let f = fixture(false).await;
        write(f.layout.root(), "misc/a.jpg", "a", "2023:06:01 10:00:00");

        let token = f.lock.acquire(OperationKind::Synchronize).await;
        let report = f.sync.run(&token).await.unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(report.relocated, 0);
        assert!(f.layout.root().join("misc/a.jpg").exists());
        let entry = LibraryEntry::find_by_path(&f.catalog, "misc/a.jpg").await.unwrap();
        assert!(entry.is_some());
    }
}
