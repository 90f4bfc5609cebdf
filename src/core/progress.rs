//! 进度事件

use crate::core::checkpoint::OperationKind;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// 进度阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Scanning,
    Removing,
    Processing,
    Reconciling,
    Pruning,
    Swapping,
    Finished,
}

/// 单个文件的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    Added,
    Removed,
    Relocated,
    Duplicate,
    Quarantined,
    Failed,
}

/// 进度事件，携带稳定的操作 id，可用于检查点查询
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub operation_id: String,
    pub kind: OperationKind,
    pub phase: ProgressPhase,
    pub current: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<FileOutcome>,
}

/// 进度发送端，未订阅时所有发送都是空操作
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// 创建一对发送端与接收端
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    pub async fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }

    /// 阶段变化
    pub async fn phase(
        &self,
        operation_id: &str,
        kind: OperationKind,
        phase: ProgressPhase,
        current: u64,
        total: u64,
    ) {
        if self.tx.is_none() {
            return;
        }
        self.emit(ProgressEvent {
            operation_id: operation_id.to_string(),
            kind,
            phase,
            current,
            total,
            path: None,
            outcome: None,
        })
        .await;
    }

    /// 单个文件处理完成
    #[allow(clippy::too_many_arguments)]
    pub async fn file(
        &self,
        operation_id: &str,
        kind: OperationKind,
        phase: ProgressPhase,
        current: u64,
        total: u64,
        path: &str,
        outcome: FileOutcome,
    ) {
        if self.tx.is_none() {
            return;
        }
        self.emit(ProgressEvent {
            operation_id: operation_id.to_string(),
            kind,
            phase,
            current,
            total,
            path: Some(path.to_string()),
            outcome: Some(outcome),
        })
        .await;
    }
}
