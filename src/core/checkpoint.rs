//! 检查点管理 - 长任务的持久进度与断点续跑

use crate::error::{LibraryError, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Synchronize,
    Rebuild,
    Adopt,
    BulkEdit,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Synchronize => write!(f, "synchronize"),
            OperationKind::Rebuild => write!(f, "rebuild"),
            OperationKind::Adopt => write!(f, "adopt"),
            OperationKind::BulkEdit => write!(f, "bulk_edit"),
        }
    }
}

impl From<&str> for OperationKind {
    fn from(s: &str) -> Self {
        match s {
            "rebuild" => OperationKind::Rebuild,
            "adopt" => OperationKind::Adopt,
            "bulk_edit" => OperationKind::BulkEdit,
            _ => OperationKind::Synchronize,
        }
    }
}

/// 操作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    /// 被取消，可以续跑
    Paused,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::Running => write!(f, "running"),
            OperationStatus::Paused => write!(f, "paused"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

impl From<&str> for OperationStatus {
    fn from(s: &str) -> Self {
        match s {
            "running" => OperationStatus::Running,
            "paused" => OperationStatus::Paused,
            "completed" => OperationStatus::Completed,
            "failed" => OperationStatus::Failed,
            _ => OperationStatus::Pending,
        }
    }
}

/// 操作检查点
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationCheckpoint {
    pub id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    /// 最后处理的位置（通常是相对路径）
    pub marker: Option<String>,
    pub processed: u64,
    /// 操作自定义的 JSON 上下文
    pub context: Option<String>,
    pub error_message: Option<String>,
    pub started_at: i64,
    pub updated_at: i64,
}

/// 续跑位置
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumePoint {
    pub marker: Option<String>,
    pub processed: u64,
    pub context: Option<String>,
}

/// 数据库行
#[derive(Debug, sqlx::FromRow)]
struct OperationRow {
    id: String,
    kind: String,
    status: String,
    marker: Option<String>,
    processed: i64,
    context: Option<String>,
    error_message: Option<String>,
    started_at: i64,
    updated_at: i64,
}

impl From<OperationRow> for OperationCheckpoint {
    fn from(row: OperationRow) -> Self {
        OperationCheckpoint {
            id: row.id,
            kind: OperationKind::from(row.kind.as_str()),
            status: OperationStatus::from(row.status.as_str()),
            marker: row.marker,
            processed: row.processed.max(0) as u64,
            context: row.context,
            error_message: row.error_message,
            started_at: row.started_at,
            updated_at: row.updated_at,
        }
    }
}

const INCOMPLETE: &str = "('pending', 'running', 'paused')";

/// 检查点管理器，同步、重建、导入共用
pub struct CheckpointManager {
    db: Arc<SqlitePool>,
}

impl CheckpointManager {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// 开始新操作，返回其检查点
    pub async fn begin(
        &self,
        kind: OperationKind,
        context: Option<&str>,
    ) -> Result<OperationCheckpoint> {
        let now = chrono::Utc::now().timestamp();
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"INSERT INTO operations (id, kind, status, marker, processed, context, started_at, updated_at)
               VALUES (?, ?, 'running', NULL, 0, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(kind.to_string())
        .bind(context)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;

        info!("开始操作: {} ({})", kind, id);
        Ok(OperationCheckpoint {
            id,
            kind,
            status: OperationStatus::Running,
            marker: None,
            processed: 0,
            context: context.map(str::to_string),
            error_message: None,
            started_at: now,
            updated_at: now,
        })
    }

    /// 同类操作有未完成的就续跑，否则开始新的；返回 (检查点, 是否续跑)
    pub async fn resume_or_begin(
        &self,
        kind: OperationKind,
        context: Option<&str>,
    ) -> Result<(OperationCheckpoint, bool)> {
        let existing = sqlx::query_as::<_, OperationRow>(&format!(
            "SELECT * FROM operations WHERE kind = ? AND status IN {} ORDER BY updated_at DESC, started_at DESC LIMIT 1",
            INCOMPLETE
        ))
        .bind(kind.to_string())
        .fetch_optional(&*self.db)
        .await?;

        match existing {
            Some(row) => {
                let mut checkpoint = OperationCheckpoint::from(row);
                self.set_status(&checkpoint.id, OperationStatus::Running, None)
                    .await?;
                checkpoint.status = OperationStatus::Running;
                info!(
                    "续跑操作: {} ({}), 已处理 {}, 位置 {:?}",
                    kind, checkpoint.id, checkpoint.processed, checkpoint.marker
                );
                Ok((checkpoint, true))
            }
            None => Ok((self.begin(kind, context).await?, false)),
        }
    }

    /// 持久化进度；同一操作的进度不允许回退
    pub async fn save(
        &self,
        operation_id: &str,
        marker: Option<&str>,
        processed: u64,
        context: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"UPDATE operations SET
                   marker = COALESCE(?, marker),
                   processed = ?,
                   context = COALESCE(?, context),
                   updated_at = ?
               WHERE id = ? AND processed <= ?"#,
        )
        .bind(marker)
        .bind(processed as i64)
        .bind(context)
        .bind(now)
        .bind(operation_id)
        .bind(processed as i64)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(operation_id).await? {
                Some(current) => Err(LibraryError::CheckpointRegression {
                    operation_id: operation_id.to_string(),
                    current: current.processed,
                    requested: processed,
                }),
                None => Err(LibraryError::NotFound(format!("操作 {}", operation_id))),
            };
        }

        debug!("检查点已保存: {} -> {}", operation_id, processed);
        Ok(())
    }

    pub async fn get(&self, operation_id: &str) -> Result<Option<OperationCheckpoint>> {
        let row = sqlx::query_as::<_, OperationRow>("SELECT * FROM operations WHERE id = ?")
            .bind(operation_id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row.map(OperationCheckpoint::from))
    }

    /// 续跑位置
    pub async fn resume_from(&self, operation_id: &str) -> Result<ResumePoint> {
        let checkpoint = self
            .get(operation_id)
            .await?
            .ok_or_else(|| LibraryError::NotFound(format!("操作 {}", operation_id)))?;

        Ok(ResumePoint {
            marker: checkpoint.marker,
            processed: checkpoint.processed,
            context: checkpoint.context,
        })
    }

    /// 所有未结束的操作
    pub async fn list_incomplete(&self) -> Result<Vec<OperationCheckpoint>> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            "SELECT * FROM operations WHERE status IN {} ORDER BY started_at",
            INCOMPLETE
        ))
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(OperationCheckpoint::from).collect())
    }

    pub async fn complete(&self, operation_id: &str) -> Result<()> {
        self.set_status(operation_id, OperationStatus::Completed, None)
            .await?;
        info!("操作完成: {}", operation_id);
        Ok(())
    }

    /// 取消后暂停，保留进度以便续跑
    pub async fn pause(&self, operation_id: &str) -> Result<()> {
        self.set_status(operation_id, OperationStatus::Paused, None)
            .await?;
        info!("操作已暂停: {}", operation_id);
        Ok(())
    }

    pub async fn fail(&self, operation_id: &str, message: &str) -> Result<()> {
        self.set_status(operation_id, OperationStatus::Failed, Some(message))
            .await?;
        warn!("操作失败: {}: {}", operation_id, message);
        Ok(())
    }

    async fn set_status(
        &self,
        operation_id: &str,
        status: OperationStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE operations SET status = ?, error_message = COALESCE(?, error_message), updated_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(error_message)
        .bind(chrono::Utc::now().timestamp())
        .bind(operation_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// 清理超过保留期的已结束操作
    pub async fn cleanup_old(&self, retention_days: u32) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - i64::from(retention_days) * 86_400;
        let result = sqlx::query(
            "DELETE FROM operations WHERE status IN ('completed', 'failed') AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(&*self.db)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!("清理了 {} 条过期操作记录", removed);
        }
        Ok(removed)
    }
}

/// 按固定间隔保存检查点
pub struct CheckpointTicker<'a> {
    manager: &'a CheckpointManager,
    operation_id: String,
    interval: u64,
    processed: u64,
    since_save: u64,
    marker: Option<String>,
}

impl<'a> CheckpointTicker<'a> {
    pub fn new(manager: &'a CheckpointManager, checkpoint: &OperationCheckpoint, interval: usize) -> Self {
        Self {
            manager,
            operation_id: checkpoint.id.clone(),
            interval: interval.max(1) as u64,
            processed: checkpoint.processed,
            since_save: 0,
            marker: checkpoint.marker.clone(),
        }
    }

    /// 记录一个已提交的文件，到达间隔时落盘
    pub async fn advance(&mut self, marker: &str, context: Option<&str>) -> Result<()> {
        self.processed += 1;
        self.since_save += 1;
        self.marker = Some(marker.to_string());
        if self.since_save >= self.interval {
            self.flush(context).await?;
        }
        Ok(())
    }

    /// 立即保存当前进度
    pub async fn flush(&mut self, context: Option<&str>) -> Result<()> {
        self.manager
            .save(&self.operation_id, self.marker.as_deref(), self.processed, context)
            .await?;
        self.since_save = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> (tempfile::TempDir, CheckpointManager) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::open_state(&dir.path().join("state.db")).await.unwrap();
        (dir, CheckpointManager::new(Arc::new(pool)))
    }

    #[tokio::test]
    async fn save_and_resume_from_marker() {
        let (_dir, manager) = manager().await;
        let op = manager.begin(OperationKind::Synchronize, None).await.unwrap();
        manager.save(&op.id, Some("a/b.jpg"), 100, None).await.unwrap();

        let point = manager.resume_from(&op.id).await.unwrap();
        assert_eq!(point.marker.as_deref(), Some("a/b.jpg"));
        assert_eq!(point.processed, 100);

        let incomplete = manager.list_incomplete().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, op.id);

        manager.complete(&op.id).await.unwrap();
        assert!(manager.list_incomplete().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn progress_never_moves_backwards() {
        let (_dir, manager) = manager().await;
        let op = manager.begin(OperationKind::Adopt, None).await.unwrap();
        manager.save(&op.id, Some("b"), 200, None).await.unwrap();

        let err = manager.save(&op.id, Some("a"), 100, None).await.unwrap_err();
        assert!(matches!(
            err,
            LibraryError::CheckpointRegression { current: 200, requested: 100, .. }
        ));
        let point = manager.resume_from(&op.id).await.unwrap();
        assert_eq!(point.marker.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn resume_or_begin_picks_paused_operation_of_same_kind() {
        let (_dir, manager) = manager().await;
        let sync = manager.begin(OperationKind::Synchronize, None).await.unwrap();
        manager.save(&sync.id, Some("x"), 5, Some("{}")).await.unwrap();
        manager.pause(&sync.id).await.unwrap();

        let (adopt, resumed) = manager
            .resume_or_begin(OperationKind::Adopt, None)
            .await
            .unwrap();
        assert!(!resumed);
        assert_ne!(adopt.id, sync.id);

        let (again, resumed) = manager
            .resume_or_begin(OperationKind::Synchronize, None)
            .await
            .unwrap();
        assert!(resumed);
        assert_eq!(again.id, sync.id);
        assert_eq!(again.processed, 5);
        assert_eq!(again.context.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn ticker_saves_on_interval() {
        let (_dir, manager) = manager().await;
        let op = manager.begin(OperationKind::Synchronize, None).await.unwrap();
        let mut ticker = CheckpointTicker::new(&manager, &op, 2);

        ticker.advance("a", None).await.unwrap();
        assert_eq!(manager.resume_from(&op.id).await.unwrap().processed, 0);
        ticker.advance("b", None).await.unwrap();
        assert_eq!(manager.resume_from(&op.id).await.unwrap().processed, 2);
        ticker.advance("c", None).await.unwrap();
        ticker.flush(None).await.unwrap();

        let point = manager.resume_from(&op.id).await.unwrap();
        assert_eq!(point.processed, 3);
        assert_eq!(point.marker.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn cleanup_keeps_incomplete_operations() {
        let (_dir, manager) = manager().await;
        let done = manager.begin(OperationKind::Rebuild, None).await.unwrap();
        manager.complete(&done.id).await.unwrap();
        let open = manager.begin(OperationKind::Rebuild, None).await.unwrap();

        // 保留期为 0 天时，只要不是未来时间的记录都过期
        sqlx::query("UPDATE operations SET updated_at = updated_at - 10")
            .execute(&*manager.db)
            .await
            .unwrap();
        assert_eq!(manager.cleanup_old(0).await.unwrap(), 1);
        assert!(manager.get(&open.id).await.unwrap().is_some());
        assert!(manager.get(&done.id).await.unwrap().is_none());
    }
}
