//! 哈希缓存 - 内存 LRU + 持久层两级缓存
//!
//! 缓存项以 (修改时间, 大小) 作为有效性依据，任何一项与当前文件不符即视为失效。

use crate::core::hasher::ContentHasher;
use crate::error::{LibraryError, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 文件的 (修改时间, 大小) 指纹
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub mtime_ns: i64,
    pub size: u64,
}

impl FileStamp {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Self {
            mtime_ns,
            size: meta.len(),
        }
    }

    pub async fn of(path: &Path) -> Result<Self> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| LibraryError::io(path, e))?;
        Ok(Self::from_metadata(&meta))
    }
}

struct MemoryEntry {
    stamp: FileStamp,
    hash: String,
    tick: u64,
}

/// 有界 LRU：`order` 按访问序号记录最近使用顺序
struct LruMemory {
    capacity: usize,
    entries: HashMap<PathBuf, MemoryEntry>,
    order: BTreeMap<u64, PathBuf>,
    next_tick: u64,
}

impl LruMemory {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// 命中时提升为最近使用；指纹不符时直接丢弃
    fn get(&mut self, path: &Path, stamp: FileStamp) -> Option<String> {
        let (old_tick, valid) = match self.entries.get(path) {
            Some(entry) => (entry.tick, entry.stamp == stamp),
            None => return None,
        };

        if !valid {
            self.remove(path);
            return None;
        }

        let tick = self.tick();
        self.order.remove(&old_tick);
        self.order.insert(tick, path.to_path_buf());
        let entry = self.entries.get_mut(path)?;
        entry.tick = tick;
        Some(entry.hash.clone())
    }

    fn put(&mut self, path: &Path, stamp: FileStamp, hash: String) {
        self.remove(path);
        let tick = self.tick();
        self.order.insert(tick, path.to_path_buf());
        self.entries
            .insert(path.to_path_buf(), MemoryEntry { stamp, hash, tick });

        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn remove(&mut self, path: &Path) -> Option<MemoryEntry> {
        let entry = self.entries.remove(path)?;
        self.order.remove(&entry.tick);
        Some(entry)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// 缓存统计
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub memory_hits: u64,
    pub db_hits: u64,
    pub misses: u64,
    pub memory_entries: usize,
    pub hit_rate: f64,
}

/// 数据库行
#[derive(Debug, sqlx::FromRow)]
struct HashCacheRow {
    mtime_ns: i64,
    file_size: i64,
    content_hash: String,
}

impl HashCacheRow {
    fn stamp(&self) -> FileStamp {
        FileStamp {
            mtime_ns: self.mtime_ns,
            size: self.file_size.max(0) as u64,
        }
    }
}

/// 哈希缓存，每个进程构造一次，按引用传给需要哈希的组件
pub struct HashCache {
    db: Arc<SqlitePool>,
    hasher: Arc<dyn ContentHasher>,
    memory: Mutex<LruMemory>,
    memory_hits: AtomicU64,
    db_hits: AtomicU64,
    misses: AtomicU64,
}

fn cache_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl HashCache {
    pub fn new(db: Arc<SqlitePool>, hasher: Arc<dyn ContentHasher>, memory_capacity: usize) -> Self {
        Self {
            db,
            hasher,
            memory: Mutex::new(LruMemory::new(memory_capacity)),
            memory_hits: AtomicU64::new(0),
            db_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// 获取文件哈希：内存 -> 持久层 -> 重新计算
    pub async fn get_or_compute(&self, path: &Path) -> Result<String> {
        let stamp = FileStamp::of(path).await?;

        // 先查内存
        {
            let mut memory = self.memory.lock().await;
            if let Some(hash) = memory.get(path, stamp) {
                self.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hash);
            }
        }

        // 再查持久层
        if let Some(row) = self.load_row(path).await? {
            if row.stamp() == stamp {
                self.db_hits.fetch_add(1, Ordering::Relaxed);
                self.memory
                    .lock()
                    .await
                    .put(path, stamp, row.content_hash.clone());
                return Ok(row.content_hash);
            }
            debug!("缓存指纹已过期: {:?}", path);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let hash = self
            .hasher
            .hash(path)
            .await
            .map_err(|e| LibraryError::io(path, e))?;

        // 计算期间文件被改动时，结果不可信，不写入缓存
        let after = FileStamp::of(path).await?;
        if after != stamp {
            warn!("文件在计算哈希期间被修改，不写入缓存: {:?}", path);
            return Ok(hash);
        }

        self.store(path, stamp, &hash).await?;
        Ok(hash)
    }

    async fn load_row(&self, path: &Path) -> Result<Option<HashCacheRow>> {
        let row = sqlx::query_as::<_, HashCacheRow>(
            "SELECT mtime_ns, file_size, content_hash FROM hash_cache WHERE file_path = ?",
        )
        .bind(cache_key(path))
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    async fn store(&self, path: &Path, stamp: FileStamp, hash: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO hash_cache (file_path, mtime_ns, file_size, content_hash, cached_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(file_path) DO UPDATE SET
                   mtime_ns = excluded.mtime_ns,
                   file_size = excluded.file_size,
                   content_hash = excluded.content_hash,
                   cached_at = excluded.cached_at"#,
        )
        .bind(cache_key(path))
        .bind(stamp.mtime_ns)
        .bind(stamp.size as i64)
        .bind(hash)
        .bind(chrono::Utc::now().timestamp())
        .execute(&*self.db)
        .await?;

        self.memory.lock().await.put(path, stamp, hash.to_string());
        Ok(())
    }

    /// 无条件移除某个路径的缓存（写入文件后必须调用）
    pub async fn invalidate(&self, path: &Path) -> Result<()> {
        self.memory.lock().await.remove(path);
        sqlx::query("DELETE FROM hash_cache WHERE file_path = ?")
            .bind(cache_key(path))
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// 文件被重命名后沿用原缓存（重命名不改变内容与修改时间）
    pub async fn relocate(&self, from: &Path, to: &Path) -> Result<()> {
        let carried = {
            let mut memory = self.memory.lock().await;
            memory.remove(from).map(|e| (e.stamp, e.hash))
        };
        let carried = match carried {
            Some(found) => Some(found),
            None => self
                .load_row(from)
                .await?
                .map(|row| (row.stamp(), row.content_hash)),
        };
        self.invalidate(from).await?;

        if let Some((stamp, hash)) = carried {
            let current = FileStamp::of(to).await?;
            if current == stamp {
                self.store(to, stamp, &hash).await?;
            } else {
                self.invalidate(to).await?;
            }
        }
        Ok(())
    }

    /// 删除文件已不存在的持久缓存
    pub async fn prune_missing(&self) -> Result<u64> {
        let paths: Vec<String> = sqlx::query_scalar("SELECT file_path FROM hash_cache")
            .fetch_all(&*self.db)
            .await?;

        let mut removed = 0;
        for path in paths {
            let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
            if !exists {
                self.invalidate(Path::new(&path)).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("清理了 {} 个失效的哈希缓存", removed);
        }
        Ok(removed)
    }

    pub async fn clear_memory(&self) {
        self.memory.lock().await.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let memory_hits = self.memory_hits.load(Ordering::Relaxed);
        let db_hits = self.db_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = memory_hits + db_hits + misses;
        CacheStats {
            memory_hits,
            db_hits,
            misses,
            memory_entries: self.memory.lock().await.len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                (memory_hits + db_hits) as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hasher::Blake3Hasher;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    struct CountingHasher {
        inner: Blake3Hasher,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentHasher for CountingHasher {
        async fn hash(&self, path: &Path) -> io::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.hash(path).await
        }
    }

    async fn setup(capacity: usize) -> (tempfile::TempDir, Arc<SqlitePool>, Arc<CountingHasher>, HashCache) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(crate::db::open_state(&dir.path().join("state.db")).await.unwrap());
        let hasher = Arc::new(CountingHasher {
            inner: Blake3Hasher::default(),
            calls: AtomicUsize::new(0),
        });
        let cache = HashCache::new(pool.clone(), hasher.clone(), capacity);
        (dir, pool, hasher, cache)
    }

    #[tokio::test]
    async fn second_lookup_hits_memory() {
        let (dir, _pool, hasher, cache) = setup(10).await;
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"hello").unwrap();

        let first = cache.get_or_compute(&path).await.unwrap();
        let second = cache.get_or_compute(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(hasher.calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.memory_hits, 1);
    }

    #[tokio::test]
    async fn durable_tier_survives_new_instance() {
        let (dir, pool, hasher, cache) = setup(10).await;
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"hello").unwrap();
        let first = cache.get_or_compute(&path).await.unwrap();

        let fresh = HashCache::new(pool, hasher.clone(), 10);
        let again = fresh.get_or_compute(&path).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(hasher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fresh.stats().await.db_hits, 1);
    }

    #[tokio::test]
    async fn changed_bytes_are_never_served_stale() {
        let (dir, _pool, _hasher, cache) = setup(10).await;
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"before").unwrap();
        let before = cache.get_or_compute(&path).await.unwrap();

        std::fs::write(&path, b"after, with a different length").unwrap();
        let after = cache.get_or_compute(&path).await.unwrap();
        assert_ne!(before, after);
        assert_eq!(after, blake3::hash(b"after, with a different length").to_hex().to_string());
    }

    #[tokio::test]
    async fn invalidate_forces_recompute() {
        let (dir, _pool, hasher, cache) = setup(10).await;
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"same").unwrap();
        cache.get_or_compute(&path).await.unwrap();

        cache.invalidate(&path).await.unwrap();
        cache.get_or_compute(&path).await.unwrap();
        assert_eq!(hasher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn memory_tier_is_bounded() {
        let (dir, _pool, _hasher, cache) = setup(2).await;
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            let path = dir.path().join(name);
            std::fs::write(&path, name.as_bytes()).unwrap();
            cache.get_or_compute(&path).await.unwrap();
        }
        assert_eq!(cache.stats().await.memory_entries, 2);

        // 最早的条目被淘汰，但持久层仍然命中
        cache.get_or_compute(&dir.path().join("a.jpg")).await.unwrap();
        assert_eq!(cache.stats().await.db_hits, 1);
    }

    #[tokio::test]
    async fn relocate_carries_entry_and_prune_drops_missing() {
        let (dir, _pool, hasher, cache) = setup(10).await;
        let from = dir.path().join("a.jpg");
        let to = dir.path().join("b.jpg");
        std::fs::write(&from, b"content").unwrap();
        cache.get_or_compute(&from).await.unwrap();

        std::fs::rename(&from, &to).unwrap();
        cache.relocate(&from, &to).await.unwrap();
        cache.get_or_compute(&to).await.unwrap();
        assert_eq!(hasher.calls.load(Ordering::SeqCst), 1);

        std::fs::remove_file(&to).unwrap();
        assert_eq!(cache.prune_missing().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unreadable_file_is_not_cached() {
        let (dir, _pool, _hasher, cache) = setup(10).await;
        let err = cache
            .get_or_compute(&dir.path().join("missing.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, LibraryError::IoUnavailable { .. }));
        assert_eq!(cache.stats().await.memory_entries, 0);
    }
}
