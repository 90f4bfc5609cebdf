//! 导入：把未整理的文件夹转换为规范布局
//!
//! 严格逐个文件处理。每个文件都会落入 processed / duplicate / 某个失败分类之一，
//! 并在清单中留下对应记录，单个坏文件不会中止整个导入。

use crate::config::AdoptConfig;
use crate::core::checkpoint::{
    CheckpointManager, CheckpointTicker, OperationCheckpoint, OperationKind,
};
use crate::core::comparator::LibraryComparator;
use crate::core::duplicate::{DuplicateCheck, DuplicateRecord, DuplicateResolver, DuplicateStage};
use crate::core::hash_cache::HashCache;
use crate::core::layout::{prune_empty_dirs, quarantine_file, LibraryLayout, QuarantineCategory};
use crate::core::lock::OperationToken;
use crate::core::manifest::{self, ManifestRecord, ManifestReplay, ManifestWriter};
use crate::core::metadata::{capture_time_or_mtime, MetadataError, MetadataReader, MetadataWriter};
use crate::core::progress::{FileOutcome, ProgressPhase, ProgressSink};
use crate::core::rewrite::{
    MetadataChange, MetadataRewriteCoordinator, RewriteOutcome, RewriteSubject, UnmanagedFile,
};
use crate::core::scanner::{FileScanner, ScanConfig, ScannedFile};
use crate::db::{LibraryEntry, SqlitePool};
use crate::error::{LibraryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const WRITE_CHECK: &str = ".photolib_write_check";

/// 导入结果汇总
///
/// 任何情况下都满足 `processed + duplicates + Σfailed_by_category == total_scanned`。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdoptionSummary {
    pub operation_id: String,
    pub resumed: bool,
    pub cancelled: bool,
    pub total_scanned: u64,
    pub processed: u64,
    pub duplicates: u64,
    pub failed_by_category: BTreeMap<QuarantineCategory, u64>,
    pub manifest_path: PathBuf,
    pub pruned_dirs: Vec<String>,
    pub started_at: i64,
    pub finished_at: i64,
}

impl AdoptionSummary {
    fn new(operation_id: &str, resumed: bool, manifest_path: PathBuf, replay: &ManifestReplay) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            resumed,
            cancelled: false,
            total_scanned: replay.total(),
            processed: replay.processed,
            duplicates: replay.duplicates,
            failed_by_category: replay.failed.clone(),
            manifest_path,
            pruned_dirs: Vec::new(),
            started_at: chrono::Utc::now().timestamp(),
            finished_at: 0,
        }
    }

    pub fn failed(&self) -> u64 {
        self.failed_by_category.values().sum()
    }

    /// 已处理的文件数
    pub fn handled(&self) -> u64 {
        self.processed + self.duplicates + self.failed()
    }
}

/// 保存在检查点中的上下文
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdoptContext {
    /// 相对媒体库根目录
    manifest: String,
}

/// 单个文件的成功结果
enum Adopted {
    Processed(LibraryEntry),
    Duplicate {
        quarantine: Option<String>,
        existing_id: i64,
        stage: DuplicateStage,
    },
}

/// 导入流程
pub struct AdoptionPipeline {
    layout: LibraryLayout,
    catalog: Arc<SqlitePool>,
    cache: Arc<HashCache>,
    checkpoints: Arc<CheckpointManager>,
    reader: Arc<dyn MetadataReader>,
    writer: Arc<dyn MetadataWriter>,
    coordinator: MetadataRewriteCoordinator,
    config: AdoptConfig,
    scan: ScanConfig,
    cancelled: Arc<AtomicBool>,
    progress: ProgressSink,
}

impl AdoptionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: LibraryLayout,
        catalog: Arc<SqlitePool>,
        cache: Arc<HashCache>,
        checkpoints: Arc<CheckpointManager>,
        reader: Arc<dyn MetadataReader>,
        writer: Arc<dyn MetadataWriter>,
        config: AdoptConfig,
        scan: ScanConfig,
        cancelled: Arc<AtomicBool>,
        progress: ProgressSink,
    ) -> Self {
        let coordinator = MetadataRewriteCoordinator::new(
            layout.clone(),
            catalog.clone(),
            cache.clone(),
            writer.clone(),
        );
        Self {
            layout,
            catalog,
            cache,
            checkpoints,
            reader,
            writer,
            coordinator,
            config,
            scan,
            cancelled,
            progress,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 前置检查，所有失败项汇总后一次返回，不做任何修改
    pub async fn preflight(&self) -> Result<()> {
        let mut problems = Vec::new();

        for tool in self.writer.missing_tools().await {
            problems.push(format!("缺少外部工具: {}", tool));
        }

        match fs2::available_space(self.layout.root()) {
            Ok(free) if free < self.config.min_free_bytes => problems.push(format!(
                "可用空间不足: {} 字节 (至少需要 {} 字节)",
                free, self.config.min_free_bytes
            )),
            Ok(_) => {}
            Err(e) => problems.push(format!("无法获取可用空间: {}", e)),
        }

        let marker = self.layout.root().join(WRITE_CHECK);
        match tokio::fs::write(&marker, b"ok").await {
            Ok(()) => {
                if let Err(e) = tokio::fs::remove_file(&marker).await {
                    warn!("无法删除写入检查文件 {:?}: {}", marker, e);
                }
            }
            Err(e) => problems.push(format!("媒体库根目录不可写: {}", e)),
        }

        if problems.is_empty() {
            Ok(())
        } else {
            warn!("导入前置检查失败: {:?}", problems);
            Err(LibraryError::PreconditionFailed(problems))
        }
    }

    /// 执行导入；有未完成的导入就续跑
    pub async fn run(&self, token: &OperationToken) -> Result<AdoptionSummary> {
        self.preflight().await?;

        let (checkpoint, resumed) = self
            .checkpoints
            .resume_or_begin(OperationKind::Adopt, None)
            .await?;

        let manifest_rel = checkpoint
            .context
            .as_deref()
            .and_then(|c| serde_json::from_str::<AdoptContext>(c).ok())
            .map(|c| c.manifest)
            .unwrap_or_else(|| {
                self.layout
                    .relative(&self.layout.manifest_dir().join(format!("adopt_{}.jsonl", checkpoint.id)))
                    .unwrap_or_else(|| format!(".library/manifests/adopt_{}.jsonl", checkpoint.id))
            });
        let context = serde_json::to_string(&AdoptContext {
            manifest: manifest_rel.clone(),
        })?;
        if !resumed {
            self.checkpoints
                .save(&checkpoint.id, None, 0, Some(&context))
                .await?;
        }

        let manifest_path = self.layout.absolute(&manifest_rel);
        match self
            .execute(token, &checkpoint, resumed, manifest_path, &context)
            .await
        {
            Ok(summary) => {
                if summary.cancelled {
                    self.checkpoints.pause(&checkpoint.id).await?;
                } else {
                    self.checkpoints.complete(&checkpoint.id).await?;
                }
                Ok(summary)
            }
            Err(e) => {
                error!("导入失败: {}", e);
                if let Err(save_err) = self.checkpoints.fail(&checkpoint.id, &e.to_string()).await {
                    warn!("无法记录失败状态: {}", save_err);
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        token: &OperationToken,
        checkpoint: &OperationCheckpoint,
        resumed: bool,
        manifest_path: PathBuf,
        context: &str,
    ) -> Result<AdoptionSummary> {
        let op_id = checkpoint.id.as_str();
        let kind = checkpoint.kind;

        let replay = if resumed {
            manifest::replay(&manifest_path).await?
        } else {
            ManifestReplay::default()
        };
        let mut summary = AdoptionSummary::new(op_id, resumed, manifest_path.clone(), &replay);
        let mut manifest = ManifestWriter::open(&manifest_path).await?;
        if !resumed {
            manifest
                .append(&ManifestRecord::Start {
                    operation_id: op_id.to_string(),
                    root: self.layout.root().display().to_string(),
                    timestamp: chrono::Utc::now().timestamp(),
                })
                .await?;
        }
        if resumed {
            self.recover_pending(&replay, op_id, &mut manifest, &mut summary)
                .await?;
        }
        info!(
            "开始导入: {:?} ({}, 续跑: {}, 已处理 {})",
            self.layout.root(),
            op_id,
            resumed,
            replay.total()
        );

        // 1. 扫描候选文件
        self.progress
            .phase(op_id, kind, ProgressPhase::Scanning, 0, 0)
            .await;
        let scanner =
            FileScanner::with_config(self.scan.clone()).with_cancel(self.cancelled.clone());
        let disk = match scanner.scan(&self.layout).await {
            Ok(files) => files,
            Err(LibraryError::Cancelled) => return Ok(Self::cancelled(summary)),
            Err(e) => return Err(e),
        };
        let catalogued = LibraryEntry::path_index(&self.catalog).await?;
        let candidates: Vec<ScannedFile> = disk
            .into_iter()
            .filter(|f| !catalogued.contains_key(&f.rel_path) && !replay.handled.contains(&f.rel_path))
            .collect();
        let candidates = if resumed {
            LibraryComparator::resume_order(candidates, checkpoint.marker.as_deref())
        } else {
            candidates
        };
        summary.total_scanned += candidates.len() as u64;
        info!("待导入文件: {} 个", candidates.len());

        // 2. 逐个处理
        let total = summary.total_scanned;
        let resolver = DuplicateResolver::new(self.catalog.clone());
        let mut ticker =
            CheckpointTicker::new(&self.checkpoints, checkpoint, self.config.checkpoint_interval);

        for file in &candidates {
            if self.is_cancelled() {
                ticker.flush(Some(context)).await?;
                return Ok(Self::cancelled(summary));
            }

            manifest
                .append(&ManifestRecord::Pending {
                    source: file.rel_path.clone(),
                    timestamp: chrono::Utc::now().timestamp(),
                })
                .await?;
            let now = chrono::Utc::now().timestamp();
            let (record, outcome) = match self.adopt_file(token, file, &resolver, op_id).await {
                Ok(Adopted::Processed(entry)) => {
                    summary.processed += 1;
                    let record = ManifestRecord::Processed {
                        source: file.rel_path.clone(),
                        destination: entry.path.clone(),
                        entry_id: entry.id,
                        content_hash: entry.content_hash.clone(),
                        taken_at: entry.taken_at.to_string(),
                        timestamp: now,
                    };
                    (record, FileOutcome::Added)
                }
                Ok(Adopted::Duplicate {
                    quarantine,
                    existing_id,
                    stage,
                }) => {
                    summary.duplicates += 1;
                    let record = ManifestRecord::Duplicate {
                        source: file.rel_path.clone(),
                        quarantine,
                        existing_entry_id: existing_id,
                        stage: stage.to_string(),
                        timestamp: now,
                    };
                    (record, FileOutcome::Duplicate)
                }
                Err(e) if e.is_fatal() => {
                    ticker.flush(Some(context)).await?;
                    return Err(e);
                }
                Err(e) => {
                    let category = failure_category(&e);
                    warn!("导入失败 {} ({}): {}", file.rel_path, category, e);
                    let quarantine = self.quarantine(file, category).await;
                    let outcome = if quarantine.is_some() {
                        FileOutcome::Quarantined
                    } else {
                        FileOutcome::Failed
                    };
                    *summary.failed_by_category.entry(category).or_default() += 1;
                    let record = ManifestRecord::Failed {
                        source: file.rel_path.clone(),
                        category,
                        reason: e.to_string(),
                        quarantine,
                        timestamp: now,
                    };
                    (record, outcome)
                }
            };

            manifest.append(&record).await?;
            ticker.advance(&file.rel_path, Some(context)).await?;
            self.progress
                .file(
                    op_id,
                    kind,
                    ProgressPhase::Processing,
                    summary.handled(),
                    total,
                    &file.rel_path,
                    outcome,
                )
                .await;
        }
        ticker.flush(Some(context)).await?;

        // 3. 清理空目录
        self.progress
            .phase(op_id, kind, ProgressPhase::Pruning, 0, 0)
            .await;
        let layout = self.layout.clone();
        summary.pruned_dirs = tokio::task::spawn_blocking(move || prune_empty_dirs(&layout))
            .await
            .map_err(|e| LibraryError::Invalid(format!("清理目录任务失败: {}", e)))?;

        summary.finished_at = chrono::Utc::now().timestamp();
        manifest
            .append(&ManifestRecord::Complete {
                processed: summary.processed,
                duplicates: summary.duplicates,
                failed: summary.failed(),
                timestamp: summary.finished_at,
            })
            .await?;
        self.progress
            .phase(op_id, kind, ProgressPhase::Finished, total, total)
            .await;

        info!(
            "导入完成: 共 {}, 成功 {}, 重复 {}, 失败 {:?}",
            summary.total_scanned, summary.processed, summary.duplicates, summary.failed_by_category
        );
        Ok(summary)
    }

    /// 补记中断在"已入库或已判重、结果尚未写入清单"之间的文件
    async fn recover_pending(
        &self,
        replay: &ManifestReplay,
        op_id: &str,
        manifest: &mut ManifestWriter,
        summary: &mut AdoptionSummary,
    ) -> Result<()> {
        if replay.pending.is_empty() {
            return Ok(());
        }
        let events = DuplicateResolver::new(self.catalog.clone())
            .events(Some(op_id))
            .await?;

        for (source, &since) in &replay.pending {
            let now = chrono::Utc::now().timestamp();
            if self.layout.absolute(source).exists() {
                debug!("中断的文件仍在原位，重新处理: {}", source);
                continue;
            }
            let file_name = source.rsplit('/').next().unwrap_or(source);
            let entry = LibraryEntry::find_created_since(&self.catalog, file_name, since)
                .await?
                .into_iter()
                .find(|e| !replay.entry_ids.contains(&e.id));

            let record = if let Some(entry) = entry {
                summary.processed += 1;
                ManifestRecord::Processed {
                    source: source.clone(),
                    destination: entry.path.clone(),
                    entry_id: entry.id,
                    content_hash: entry.content_hash.clone(),
                    taken_at: entry.taken_at.to_string(),
                    timestamp: now,
                }
            } else if let Some((event, existing_id)) = events
                .iter()
                .filter(|e| e.source_path == *source)
                .find_map(|e| e.existing_entry_id.map(|id| (e, id)))
            {
                summary.duplicates += 1;
                ManifestRecord::Duplicate {
                    source: source.clone(),
                    quarantine: event.quarantine_path.clone(),
                    existing_entry_id: existing_id,
                    stage: event.stage.to_string(),
                    timestamp: now,
                }
            } else {
                warn!("无法确定中断文件的结果: {}", source);
                continue;
            };

            info!("补记中断前已完成的文件: {}", source);
            manifest.append(&record).await?;
            summary.total_scanned += 1;
        }
        Ok(())
    }

    /// 取消时只统计已处理的文件
    fn cancelled(mut summary: AdoptionSummary) -> AdoptionSummary {
        info!("导入已取消: {}", summary.operation_id);
        summary.cancelled = true;
        summary.total_scanned = summary.handled();
        summary.finished_at = chrono::Utc::now().timestamp();
        summary
    }

    /// hash → 元数据 → 改写前重复判定 → 改写并入库
    async fn adopt_file(
        &self,
        token: &OperationToken,
        file: &ScannedFile,
        resolver: &DuplicateResolver,
        op_id: &str,
    ) -> Result<Adopted> {
        let content_hash = self.cache.get_or_compute(&file.abs_path).await?;
        let taken_at =
            capture_time_or_mtime(self.reader.as_ref(), &file.abs_path, file.kind).await?;
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
            let quarantine = self.quarantine(file, QuarantineCategory::Duplicate).await;
            resolver
                .record(DuplicateRecord {
                    operation_id: Some(op_id),
                    stage: DuplicateStage::PreRewrite,
                    source_path: &file.rel_path,
                    quarantine_path: quarantine.as_deref(),
                    content_hash: &content_hash,
                    taken_at,
                    existing_entry_id: Some(existing.id),
                })
                .await?;
            info!("改写前已与条目 #{} 重复: {}", existing.id, file.rel_path);
            return Ok(Adopted::Duplicate {
                quarantine,
                existing_id: existing.id,
                stage: DuplicateStage::PreRewrite,
            });
        }

        let subject = RewriteSubject::Unmanaged(UnmanagedFile {
            path: file.abs_path.clone(),
            kind: file.kind,
            taken_at,
            width: dimensions.map(|d| d.0),
            height: dimensions.map(|d| d.1),
        });
        match self
            .coordinator
            .apply(token, subject, MetadataChange::CaptureTime(taken_at), Some(op_id))
            .await?
        {
            RewriteOutcome::Committed(entry) => Ok(Adopted::Processed(entry)),
            RewriteOutcome::DuplicateQuarantined {
                quarantine_path,
                existing_id,
            } => Ok(Adopted::Duplicate {
                quarantine: Some(quarantine_path),
                existing_id,
                stage: DuplicateStage::PostRewrite,
            }),
        }
    }

    /// 移入隔离区，返回隔离后的相对路径；移动失败时文件留在原位
    async fn quarantine(&self, file: &ScannedFile, category: QuarantineCategory) -> Option<String> {
        match quarantine_file(&self.layout, category, &file.abs_path).await {
            Ok(target) => {
                if let Err(e) = self.cache.invalidate(&file.abs_path).await {
                    warn!("清除缓存失败 {}: {}", file.rel_path, e);
                }
                self.layout.relative(&target)
            }
            Err(e) => {
                warn!("无法隔离 {}: {}", file.rel_path, e);
                None
            }
        }
    }
}

/// 单文件失败的隔离分类
fn failure_category(err: &LibraryError) -> QuarantineCategory {
    match err {
        LibraryError::MetadataRewriteFailed { .. } => QuarantineCategory::MetadataRewriteFailed,
        LibraryError::Corrupted { .. } => QuarantineCategory::Corrupted,
        _ => QuarantineCategory::Other,
    }
}
