//! 导入清单：每行一个 JSON 记录，只追加
//!
//! 每条记录写入后立即落盘。处理一个文件前先写 `pending`，处理完再写结果，
//! 因此中断时最多只有一条 `pending` 没有结果，续跑时据此补记。

use crate::core::layout::QuarantineCategory;
use crate::error::{LibraryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// 清单记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ManifestRecord {
    Start {
        operation_id: String,
        root: String,
        timestamp: i64,
    },
    /// 开始处理某个文件
    Pending {
        source: String,
        timestamp: i64,
    },
    Processed {
        source: String,
        destination: String,
        entry_id: i64,
        content_hash: String,
        taken_at: String,
        timestamp: i64,
    },
    Duplicate {
        source: String,
        quarantine: Option<String>,
        existing_entry_id: i64,
        stage: String,
        timestamp: i64,
    },
    Failed {
        source: String,
        category: QuarantineCategory,
        reason: String,
        quarantine: Option<String>,
        timestamp: i64,
    },
    Complete {
        processed: u64,
        duplicates: u64,
        failed: u64,
        timestamp: i64,
    },
}

impl ManifestRecord {
    /// 单个源文件的结果记录返回其相对路径（`pending` 不是结果）
    pub fn source(&self) -> Option<&str> {
        match self {
            ManifestRecord::Processed { source, .. }
            | ManifestRecord::Duplicate { source, .. }
            | ManifestRecord::Failed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// 清单写入器
pub struct ManifestWriter {
    path: PathBuf,
    file: File,
}

impl ManifestWriter {
    /// 以追加方式打开（不存在则创建）
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LibraryError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| LibraryError::io(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub async fn append(&mut self, record: &ManifestRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| LibraryError::io(&self.path, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| LibraryError::io(&self.path, e))?;
        self.file
            .sync_data()
            .await
            .map_err(|e| LibraryError::io(&self.path, e))?;
        Ok(())
    }
}

/// 回放清单得到的状态
#[derive(Debug, Clone, Default)]
pub struct ManifestReplay {
    pub processed: u64,
    pub duplicates: u64,
    pub failed: BTreeMap<QuarantineCategory, u64>,
    /// 已有结果记录的源文件
    pub handled: HashSet<String>,
    /// 已写 `pending` 但没有结果的源文件及其开始时间
    pub pending: BTreeMap<String, i64>,
    /// `processed` 记录里出现过的条目 id
    pub entry_ids: HashSet<i64>,
}

impl ManifestReplay {
    pub fn total(&self) -> u64 {
        self.processed + self.duplicates + self.failed.values().sum::<u64>()
    }
}

/// 读取清单；不存在时返回空状态，无法解析的行（通常是中断时写了一半的最后一行）被跳过
pub async fn replay(path: &Path) -> Result<ManifestReplay> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ManifestReplay::default()),
        Err(e) => return Err(LibraryError::io(path, e)),
    };

    let mut state = ManifestReplay::default();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: ManifestRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!("跳过无法解析的清单行 {}: {}", number + 1, e);
                continue;
            }
        };

        if let ManifestRecord::Pending { source, timestamp } = &record {
            if !state.handled.contains(source) {
                state.pending.insert(source.clone(), *timestamp);
            }
            continue;
        }
        let Some(source) = record.source() else {
            continue;
        };
        state.pending.remove(source);
        // 同一文件只计一次
        if !state.handled.insert(source.to_string()) {
            continue;
        }
        match &record {
            ManifestRecord::Processed { entry_id, .. } => {
                state.processed += 1;
                state.entry_ids.insert(*entry_id);
            }
            ManifestRecord::Duplicate { .. } => state.duplicates += 1,
            ManifestRecord::Failed { category, .. } => {
                *state.failed.entry(*category).or_default() += 1
            }
            _ => {}
        }
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replay_restores_counters_and_handled_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifests/adopt_x.jsonl");
        let mut writer = ManifestWriter::open(&path).await.unwrap();

        writer
            .append(&ManifestRecord::Start {
                operation_id: "x".into(),
                root: "/lib".into(),
                timestamp: 1,
            })
            .await
            .unwrap();
        writer
            .append(&ManifestRecord::Processed {
                source: "a.jpg".into(),
                destination: "2023/2023-06-01/img.jpg".into(),
                entry_id: 1,
                content_hash: "h".into(),
                taken_at: "2023:06:01 00:00:00".into(),
                timestamp: 2,
            })
            .await
            .unwrap();
        writer
            .append(&ManifestRecord::Failed {
                source: "b.jpg".into(),
                category: QuarantineCategory::Corrupted,
                reason: "bad".into(),
                quarantine: None,
                timestamp: 3,
            })
            .await
            .unwrap();
        drop(writer);

        // 中断时写了一半的行
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{\"event\":\"proc");
        std::fs::write(&path, text).unwrap();

        let state = replay(&path).await.unwrap();
        assert_eq!(state.processed, 1);
        assert_eq!(state.failed.get(&QuarantineCategory::Corrupted), Some(&1));
        assert_eq!(state.total(), 2);
        assert!(state.handled.contains("a.jpg"));
        assert!(state.handled.contains("b.jpg"));
    }

    #[tokio::test]
    async fn pending_without_result_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adopt.jsonl");
        let mut writer = ManifestWriter::open(&path).await.unwrap();
        for record in [
            ManifestRecord::Pending {
                source: "a.jpg".into(),
                timestamp: 10,
            },
            ManifestRecord::Processed {
                source: "a.jpg".into(),
                destination: "2023/2023-06-01/img.jpg".into(),
                entry_id: 7,
                content_hash: "h".into(),
                taken_at: "2023:06:01 00:00:00".into(),
                timestamp: 11,
            },
            ManifestRecord::Pending {
                source: "b.jpg".into(),
                timestamp: 12,
            },
        ] {
            writer.append(&record).await.unwrap();
        }
        drop(writer);

        let state = replay(&path).await.unwrap();
        assert_eq!(state.total(), 1);
        assert!(state.entry_ids.contains(&7));
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.pending.get("b.jpg"), Some(&12));
        assert!(!state.handled.contains("b.jpg"));
    }

    #[tokio::test]
    async fn missing_manifest_replays_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = replay(&dir.path().join("none.jsonl")).await.unwrap();
        assert_eq!(state.total(), 0);
    }

    #[test]
    fn records_are_tagged_by_event() {
        let json = serde_json::to_value(ManifestRecord::Duplicate {
            source: "a.jpg".into(),
            quarantine: Some(".quarantine/duplicate/a.jpg".into()),
            existing_entry_id: 3,
            stage: "pre_rewrite".into(),
            timestamp: 0,
        })
        .unwrap();
        assert_eq!(json["event"], "duplicate");
        assert_eq!(json["existing_entry_id"], 3);
    }
}
