//! 进程级操作锁：同一时间只允许一个结构性操作修改目录

use crate::core::checkpoint::OperationKind;
use crate::error::{LibraryError, Result};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// 操作令牌，持有期间独占目录写权限；显式传入每个修改目录的调用
#[derive(Debug)]
pub struct OperationToken {
    kind: OperationKind,
    current: Arc<StdMutex<Option<OperationKind>>>,
    _guard: OwnedMutexGuard<()>,
}

impl OperationToken {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl Drop for OperationToken {
    fn drop(&mut self) {
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
        debug!("释放操作锁: {}", self.kind);
    }
}

/// 操作锁
#[derive(Clone, Default)]
pub struct OperationLock {
    inner: Arc<Mutex<()>>,
    current: Arc<StdMutex<Option<OperationKind>>>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取令牌，已有操作进行时排队等待
    pub async fn acquire(&self, kind: OperationKind) -> OperationToken {
        let guard = self.inner.clone().lock_owned().await;
        self.issue(kind, guard)
    }

    /// 立即获取令牌，已有操作进行时返回 `Busy`
    pub fn try_acquire(&self, kind: OperationKind) -> Result<OperationToken> {
        match self.inner.clone().try_lock_owned() {
            Ok(guard) => Ok(self.issue(kind, guard)),
            Err(_) => {
                let running = self
                    .current()
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                Err(LibraryError::Busy(running))
            }
        }
    }

    /// 当前持有锁的操作类型
    pub fn current(&self) -> Option<OperationKind> {
        self.current.lock().ok().and_then(|c| *c)
    }

    fn issue(&self, kind: OperationKind, guard: OwnedMutexGuard<()>) -> OperationToken {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(kind);
        }
        debug!("获取操作锁: {}", kind);
        OperationToken {
            kind,
            current: self.current.clone(),
            _guard: guard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_operation_is_rejected_while_first_holds_token() {
        let lock = OperationLock::new();
        let token = lock.acquire(OperationKind::Synchronize).await;
        assert_eq!(token.kind(), OperationKind::Synchronize);

        let err = lock.try_acquire(OperationKind::Adopt).unwrap_err();
        assert!(matches!(err, LibraryError::Busy(ref k) if k == "synchronize"));

        drop(token);
        assert!(lock.current().is_none());
        assert!(lock.try_acquire(OperationKind::Adopt).is_ok());
    }

    #[tokio::test]
    async fn waiting_operation_runs_after_release() {
        let lock = OperationLock::new();
        let token = lock.acquire(OperationKind::Rebuild).await;

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire(OperationKind::Adopt).await.kind() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(token);
        assert_eq!(waiter.await.unwrap(), OperationKind::Adopt);
    }
}
