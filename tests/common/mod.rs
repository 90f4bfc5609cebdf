#![allow(dead_code)]

use async_trait::async_trait;
use photolib_lib::config::LibraryConfig;
use photolib_lib::core::metadata::MetadataError;
use photolib_lib::core::Blake3Hasher;
use photolib_lib::db::MediaKind;
use photolib_lib::{CaptureTime, Library, LibraryEntry, MetadataReader, MetadataWriter};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// 把拍摄时间与评分保存在文件末尾的假元数据工具
///
/// 文件格式：正文行，之后是 `#taken=`、`#rating=`、`#noise=` 行。
/// 写入时丢弃 `#noise=` 行，因此两个只在 noise 上不同的文件改写后字节相同。
/// 正文包含 `CORRUPT` 时读取报告损坏，包含 `NOWRITE` 时写入失败。
#[derive(Default)]
pub struct FakeMetadata {
    reads: AtomicUsize,
    storage_full_at: Mutex<Option<usize>>,
    cancel_at: Mutex<Option<(usize, Arc<AtomicBool>)>>,
    fail_writes: AtomicBool,
    missing: Mutex<Vec<String>>,
}

impl FakeMetadata {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 之后第 `n` 次读取拍摄时间时报告磁盘已满
    pub fn storage_full_after(&self, n: usize) {
        let at = self.reads.load(Ordering::SeqCst) + n;
        *self.storage_full_at.lock().unwrap() = Some(at);
    }

    /// 之后第 `n` 次读取拍摄时间时设置取消标志（只触发一次）
    pub fn cancel_after(&self, n: usize, flag: Arc<AtomicBool>) {
        let at = self.reads.load(Ordering::SeqCst) + n;
        *self.cancel_at.lock().unwrap() = Some((at, flag));
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_missing_tools(&self, tools: &[&str]) {
        *self.missing.lock().unwrap() = tools.iter().map(|t| t.to_string()).collect();
    }

    async fn read_text(path: &Path) -> io::Result<String> {
        let bytes = tokio::fs::read(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn trailer<'a>(text: &'a str, key: &str) -> Option<&'a str> {
        text.lines().find_map(|l| l.strip_prefix(key))
    }

    async fn rewrite(&self, path: &Path, taken: Option<CaptureTime>, rating: Option<u8>) -> Result<(), MetadataError> {
        let text = Self::read_text(path).await?;
        if self.fail_writes.load(Ordering::SeqCst) || text.contains("NOWRITE") {
            return Err(MetadataError::Failed("写入被拒绝".into()));
        }

        let taken = taken
            .map(|t| t.to_string())
            .or_else(|| Self::trailer(&text, "#taken=").map(str::to_string));
        let rating = rating
            .map(|r| r.to_string())
            .or_else(|| Self::trailer(&text, "#rating=").map(str::to_string));

        let mut out = String::new();
        for line in text.lines().filter(|l| !l.starts_with('#')) {
            out.push_str(line);
            out.push('\n');
        }
        if let Some(taken) = taken {
            out.push_str(&format!("#taken={}\n", taken));
        }
        if let Some(rating) = rating {
            out.push_str(&format!("#rating={}\n", rating));
        }
        tokio::fs::write(path, out).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataReader for FakeMetadata {
    async fn capture_time(
        &self,
        path: &Path,
        _kind: MediaKind,
    ) -> Result<Option<CaptureTime>, MetadataError> {
        let call = self.reads.fetch_add(1, Ordering::SeqCst) + 1;

        if *self.storage_full_at.lock().unwrap() == Some(call) {
            return Err(MetadataError::Io(io::Error::new(
                io::ErrorKind::StorageFull,
                "no space left on device",
            )));
        }
        {
            let mut cancel = self.cancel_at.lock().unwrap();
            if matches!(cancel.as_ref(), Some((at, _)) if *at == call) {
                if let Some((_, flag)) = cancel.take() {
                    flag.store(true, Ordering::SeqCst);
                }
            }
        }

        let text = Self::read_text(path).await?;
        if text.contains("CORRUPT") {
            return Err(MetadataError::Corrupted("无法解析".into()));
        }
        Ok(Self::trailer(&text, "#taken=").and_then(CaptureTime::parse))
    }

    async fn dimensions(
        &self,
        _path: &Path,
        _kind: MediaKind,
    ) -> Result<Option<(u32, u32)>, MetadataError> {
        Ok(Some((640, 480)))
    }
}

#[async_trait]
impl MetadataWriter for FakeMetadata {
    async fn write_capture_time(
        &self,
        path: &Path,
        _kind: MediaKind,
        taken_at: CaptureTime,
    ) -> Result<(), MetadataError> {
        self.rewrite(path, Some(taken_at), None).await
    }

    async fn write_rating(&self, path: &Path, _kind: MediaKind, rating: u8) -> Result<(), MetadataError> {
        self.rewrite(path, None, Some(rating)).await
    }

    async fn missing_tools(&self) -> Vec<String> {
        self.missing.lock().unwrap().clone()
    }
}

pub fn test_config() -> LibraryConfig {
    let mut config = LibraryConfig::default();
    config.sync.checkpoint_interval = 100;
    config.adopt.min_free_bytes = 0;
    config.adopt.checkpoint_interval = 5;
    config
}

pub async fn open_library(root: &Path, fake: &Arc<FakeMetadata>) -> Library {
    open_library_with(root, fake, test_config()).await
}

pub async fn open_library_with(root: &Path, fake: &Arc<FakeMetadata>, config: LibraryConfig) -> Library {
    Library::open_with(
        root,
        config,
        fake.clone(),
        fake.clone(),
        Arc::new(Blake3Hasher::default()),
    )
    .await
    .unwrap()
}

/// 写入一个已是规范格式的媒体文件
pub fn write_media(root: &Path, rel: &str, body: &str, taken: &str) {
    write_raw(root, rel, &format!("{}\n#taken={}\n", body, taken));
}

pub fn write_raw(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

pub fn hash_file(path: &Path) -> String {
    blake3::hash(&std::fs::read(path).unwrap()).to_hex().to_string()
}

/// 与 id、时间戳无关的目录快照
pub fn snapshot(entries: &[LibraryEntry]) -> Vec<(String, String, String)> {
    let mut rows: Vec<_> = entries
        .iter()
        .map(|e| (e.path.clone(), e.content_hash.clone(), e.taken_at.to_string()))
        .collect();
    rows.sort();
    rows
}

/// 目录中的普通文件数（不含子目录）
pub fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|d| d.filter_map(|e| e.ok()).filter(|e| e.path().is_file()).count())
        .unwrap_or(0)
}
