//! 重复判定：内容 hash 相同且拍摄时间精确到秒相同，才是同一个媒体
//!
//! 相同字节但拍摄时间不同是合法的（同一张参考图可以属于两个不同事件）。

use crate::db::{CaptureTime, LibraryEntry};
use crate::error::{LibraryError, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, warn};

/// 发现重复的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateStage {
    Sync,
    PreRewrite,
    PostRewrite,
    Insert,
    Restore,
}

impl std::fmt::Display for DuplicateStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DuplicateStage::Sync => write!(f, "sync"),
            DuplicateStage::PreRewrite => write!(f, "pre_rewrite"),
            DuplicateStage::PostRewrite => write!(f, "post_rewrite"),
            DuplicateStage::Insert => write!(f, "insert"),
            DuplicateStage::Restore => write!(f, "restore"),
        }
    }
}

impl From<&str> for DuplicateStage {
    fn from(s: &str) -> Self {
        match s {
            "pre_rewrite" => DuplicateStage::PreRewrite,
            "post_rewrite" => DuplicateStage::PostRewrite,
            "insert" => DuplicateStage::Insert,
            "restore" => DuplicateStage::Restore,
            _ => DuplicateStage::Sync,
        }
    }
}

/// 重复事件
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateEvent {
    pub id: i64,
    pub operation_id: Option<String>,
    pub stage: DuplicateStage,
    pub source_path: String,
    pub quarantine_path: Option<String>,
    pub content_hash: String,
    pub taken_at: String,
    pub existing_entry_id: Option<i64>,
    pub created_at: i64,
}

/// 待记录的重复事件
#[derive(Debug, Clone)]
pub struct DuplicateRecord<'a> {
    pub operation_id: Option<&'a str>,
    pub stage: DuplicateStage,
    pub source_path: &'a str,
    pub quarantine_path: Option<&'a str>,
    pub content_hash: &'a str,
    pub taken_at: CaptureTime,
    pub existing_entry_id: Option<i64>,
}

/// 数据库行
#[derive(Debug, sqlx::FromRow)]
struct DuplicateEventRow {
    id: i64,
    operation_id: Option<String>,
    stage: String,
    source_path: String,
    quarantine_path: Option<String>,
    content_hash: String,
    taken_at: String,
    existing_entry_id: Option<i64>,
    created_at: i64,
}

impl From<DuplicateEventRow> for DuplicateEvent {
    fn from(row: DuplicateEventRow) -> Self {
        DuplicateEvent {
            id: row.id,
            operation_id: row.operation_id,
            stage: DuplicateStage::from(row.stage.as_str()),
            source_path: row.source_path,
            quarantine_path: row.quarantine_path,
            content_hash: row.content_hash,
            taken_at: row.taken_at,
            existing_entry_id: row.existing_entry_id,
            created_at: row.created_at,
        }
    }
}

/// 重复检查结果
#[derive(Debug, Clone)]
pub enum DuplicateCheck {
    Unique,
    Duplicate(LibraryEntry),
}

/// 同一内容出现在多个拍摄时间下
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedContent {
    pub content_hash: String,
    pub occurrences: i64,
}

/// 违反唯一性的身份组（不变式成立时始终为空）
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct IdentityGroup {
    pub content_hash: String,
    pub taken_at: String,
    pub occurrences: i64,
}

/// 重复解析器
pub struct DuplicateResolver {
    db: Arc<SqlitePool>,
}

impl DuplicateResolver {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn find_existing(
        &self,
        content_hash: &str,
        taken_at: CaptureTime,
    ) -> Result<Option<LibraryEntry>> {
        LibraryEntry::find_by_identity(&self.db, content_hash, taken_at).await
    }

    /// 检查身份是否已被其他条目占用；`exclude_id` 为正在修改的条目自身
    pub async fn check(
        &self,
        content_hash: &str,
        taken_at: CaptureTime,
        exclude_id: Option<i64>,
    ) -> Result<DuplicateCheck> {
        match self.find_existing(content_hash, taken_at).await? {
            Some(existing) if Some(existing.id) != exclude_id => {
                debug!(
                    "发现重复: hash={}, 拍摄时间={}, 已有条目 #{}",
                    content_hash, taken_at, existing.id
                );
                Ok(DuplicateCheck::Duplicate(existing))
            }
            _ => Ok(DuplicateCheck::Unique),
        }
    }

    /// 把持久层的唯一约束冲突改写为 `DuplicateDetected`，其他错误原样返回
    pub async fn reclassify(&self, err: LibraryError) -> LibraryError {
        let (content_hash, taken_at) = match err {
            LibraryError::IntegrityViolation {
                content_hash,
                taken_at,
            } => (content_hash, taken_at),
            other => return other,
        };

        match self.find_existing(&content_hash, taken_at).await {
            Ok(Some(existing)) => LibraryError::DuplicateDetected {
                content_hash,
                taken_at,
                existing_id: existing.id,
            },
            Ok(None) => {
                // 冲突的条目在回查前已被删除，仍按重复处理
                warn!("唯一约束冲突后未找到已有条目: {}", content_hash);
                LibraryError::DuplicateDetected {
                    content_hash,
                    taken_at,
                    existing_id: 0,
                }
            }
            Err(e) => e,
        }
    }

    /// 记录重复事件
    pub async fn record(&self, record: DuplicateRecord<'_>) -> Result<i64> {
        let result = sqlx::query(
            r#"INSERT INTO duplicate_events
               (operation_id, stage, source_path, quarantine_path, content_hash, taken_at, existing_entry_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.operation_id)
        .bind(record.stage.to_string())
        .bind(record.source_path)
        .bind(record.quarantine_path)
        .bind(record.content_hash)
        .bind(record.taken_at.to_exif_string())
        .bind(record.existing_entry_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&*self.db)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// 留在原位的重复文件是否已经记录过（同一来源路径、同一身份）
    pub async fn is_recorded_in_place(
        &self,
        source_path: &str,
        content_hash: &str,
        taken_at: CaptureTime,
    ) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            r#"SELECT id FROM duplicate_events
               WHERE source_path = ? AND content_hash = ? AND taken_at = ?
                 AND quarantine_path IS NULL
               LIMIT 1"#,
        )
        .bind(source_path)
        .bind(content_hash)
        .bind(taken_at.to_exif_string())
        .fetch_optional(&*self.db)
        .await?;
        Ok(found.is_some())
    }

    /// 查询重复事件，`operation_id` 为空时返回全部
    pub async fn events(&self, operation_id: Option<&str>) -> Result<Vec<DuplicateEvent>> {
        let rows = match operation_id {
            Some(id) => {
                sqlx::query_as::<_, DuplicateEventRow>(
                    "SELECT * FROM duplicate_events WHERE operation_id = ? ORDER BY id",
                )
                .bind(id)
                .fetch_all(&*self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, DuplicateEventRow>("SELECT * FROM duplicate_events ORDER BY id")
                    .fetch_all(&*self.db)
                    .await?
            }
        };

        Ok(rows.into_iter().map(DuplicateEvent::from).collect())
    }

    /// 审计：列出违反唯一性的身份组
    pub async fn audit(&self) -> Result<Vec<IdentityGroup>> {
        let groups = sqlx::query_as::<_, IdentityGroup>(
            r#"SELECT content_hash, taken_at, COUNT(*) AS occurrences
               FROM entries GROUP BY content_hash, taken_at HAVING COUNT(*) > 1"#,
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(groups)
    }

    /// 同一内容被多个拍摄时间使用的情况
    pub async fn shared_content(&self) -> Result<Vec<SharedContent>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"SELECT content_hash, COUNT(*) FROM entries
               GROUP BY content_hash HAVING COUNT(*) > 1 ORDER BY COUNT(*) DESC"#,
        )
        .fetch_all(&*self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(content_hash, occurrences)| SharedContent {
                content_hash,
                occurrences,
            })
            .collect())
    }
}
