//! 错误类型
//!
//! 批处理中的单文件错误（不可读、损坏、写元数据失败、重复）由调用方就地归类并计数，
//! 只有 [`LibraryError::is_fatal`] 为真的错误才会中止整个操作。

use crate::db::CaptureTime;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("文件不可用: {}: {source}", .path.display())]
    IoUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("媒体内容损坏: {}: {reason}", .path.display())]
    Corrupted { path: PathBuf, reason: String },

    #[error("元数据写入失败: {}: {reason}", .path.display())]
    MetadataRewriteFailed { path: PathBuf, reason: String },

    #[error("检测到重复文件: hash={content_hash}, 拍摄时间={taken_at}, 已有条目 #{existing_id}")]
    DuplicateDetected {
        content_hash: String,
        taken_at: CaptureTime,
        existing_id: i64,
    },

    #[error("前置条件不满足: {}", .0.join("; "))]
    PreconditionFailed(Vec<String>),

    /// 持久层唯一约束冲突，离开重复解析器之前必须被改写为 `DuplicateDetected`
    #[error("唯一约束冲突: hash={content_hash}, 拍摄时间={taken_at}")]
    IntegrityViolation {
        content_hash: String,
        taken_at: CaptureTime,
    },

    #[error("规范路径已被占用: {0}")]
    CanonicalPathOccupied(String),

    #[error("磁盘空间不足: {0}")]
    StorageFull(String),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("已有结构性操作正在进行: {0}")]
    Busy(String),

    #[error("操作已取消")]
    Cancelled,

    #[error("检查点进度不能回退: {operation_id} ({current} -> {requested})")]
    CheckpointRegression {
        operation_id: String,
        current: u64,
        requested: u64,
    },

    #[error("无效参数: {0}")]
    Invalid(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, LibraryError>;

impl LibraryError {
    /// 包装与具体文件相关的 IO 错误；磁盘写满单独归类
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::StorageFull {
            return LibraryError::StorageFull(format!("{}: {}", path.display(), source));
        }
        LibraryError::IoUnavailable { path, source }
    }

    /// 是否需要中止整个批处理
    pub fn is_fatal(&self) -> bool {
        match self {
            LibraryError::StorageFull(_)
            | LibraryError::Cancelled
            | LibraryError::PreconditionFailed(_)
            | LibraryError::Database(_)
            | LibraryError::Migrate(_) => true,
            LibraryError::Io(e) => e.kind() == io::ErrorKind::StorageFull,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_full_io_is_fatal() {
        let err = LibraryError::io(
            "/tmp/a.jpg",
            io::Error::new(io::ErrorKind::StorageFull, "disk full"),
        );
        assert!(matches!(err, LibraryError::StorageFull(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn missing_file_is_recoverable() {
        let err = LibraryError::io("/tmp/a.jpg", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, LibraryError::IoUnavailable { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn precondition_message_lists_every_failure() {
        let err = LibraryError::PreconditionFailed(vec!["a".into(), "b".into()]);
        assert!(err.to_string().contains("a; b"));
    }
}
