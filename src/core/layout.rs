//! 媒体库目录布局：规范路径、受管理目录、隔离区与空目录清理

use crate::db::CaptureTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 元数据目录（数据库、备份、清单、日志、配置）
pub const LIBRARY_DIR: &str = ".library";
pub const TRASH_DIR: &str = ".trash";
pub const QUARANTINE_DIR: &str = ".quarantine";

/// 扫描时永远跳过的受管理目录
const MANAGED_DIRS: &[&str] = &[LIBRARY_DIR, TRASH_DIR, QUARANTINE_DIR, ".thumbnails"];

const MAX_PRUNE_PASSES: usize = 10;

/// 隔离分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineCategory {
    Duplicate,
    MetadataRewriteFailed,
    Corrupted,
    Other,
}

impl std::fmt::Display for QuarantineCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuarantineCategory::Duplicate => write!(f, "duplicate"),
            QuarantineCategory::MetadataRewriteFailed => write!(f, "metadata_rewrite_failed"),
            QuarantineCategory::Corrupted => write!(f, "corrupted"),
            QuarantineCategory::Other => write!(f, "other"),
        }
    }
}

/// 媒体库根目录及其受管理子目录
#[derive(Debug, Clone)]
pub struct LibraryLayout {
    root: PathBuf,
}

impl LibraryLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(LIBRARY_DIR)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.meta_dir().join("catalog.db")
    }

    pub fn state_path(&self) -> PathBuf {
        self.meta_dir().join("state.db")
    }

    /// 重建期间使用的临时目录数据库
    pub fn rebuild_temp_path(&self) -> PathBuf {
        self.meta_dir().join(".catalog.db.rebuilding")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.meta_dir().join("backups")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.meta_dir().join("manifests")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.meta_dir().join("logs")
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.root.join(TRASH_DIR)
    }

    pub fn quarantine_dir(&self, category: QuarantineCategory) -> PathBuf {
        self.root.join(QUARANTINE_DIR).join(category.to_string())
    }

    /// 创建所有受管理目录
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [
            self.meta_dir(),
            self.backup_dir(),
            self.manifest_dir(),
            self.log_dir(),
            self.trash_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// 相对路径（`/` 分隔）转绝对路径
    pub fn absolute(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    /// 绝对路径转相对路径，不在根目录下时返回 None
    pub fn relative(&self, absolute: &Path) -> Option<String> {
        let rel = absolute.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }
}

/// 是否是受管理目录名
pub fn is_managed_dir(name: &OsStr) -> bool {
    name.to_str()
        .map(|n| MANAGED_DIRS.contains(&n))
        .unwrap_or(false)
}

/// 是否是隐藏文件或目录
pub fn is_hidden(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// 规范路径：`YYYY/YYYY-MM-DD/img_YYYYMMDD_HHMMSS_<hash8>.<ext>`
pub fn canonical_path(taken_at: CaptureTime, content_hash: &str, extension: &str) -> String {
    let dt = taken_at.as_naive();
    let short_hash: String = content_hash.chars().take(8).collect();
    format!(
        "{}/{}/img_{}_{}.{}",
        dt.format("%Y"),
        dt.format("%Y-%m-%d"),
        dt.format("%Y%m%d_%H%M%S"),
        short_hash,
        extension.to_lowercase()
    )
}

/// 按原文件扩展名生成规范路径
pub fn canonical_path_for(taken_at: CaptureTime, content_hash: &str, original: &Path) -> String {
    let ext = original
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    canonical_path(taken_at, content_hash, ext)
}

/// 在 `dir` 中为 `file_name` 找一个不冲突的位置：name.ext, name_1.ext, name_2.ext ...
pub fn unique_destination(dir: &Path, file_name: &OsStr) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1;
    loop {
        let candidate = dir.join(format!("{}_{}{}", stem, counter, ext));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// 移动文件，自动创建目标目录；跨设备时退化为复制后删除
pub async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if !tokio::fs::try_exists(from).await.unwrap_or(false) {
                return Err(rename_err);
            }
            debug!("重命名失败，尝试复制: {:?} -> {:?}: {}", from, to, rename_err);
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

/// 把文件移入隔离区，返回隔离后的路径
pub async fn quarantine_file(
    layout: &LibraryLayout,
    category: QuarantineCategory,
    path: &Path,
) -> io::Result<PathBuf> {
    let dir = layout.quarantine_dir(category);
    tokio::fs::create_dir_all(&dir).await?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "缺少文件名"))?;
    let target = unique_destination(&dir, file_name);
    move_file(path, &target).await?;
    Ok(target)
}

/// 目录在忽略隐藏文件后是否为空；为空时删除其中的隐藏文件与目录本身
fn remove_if_empty(dir: &Path) -> io::Result<bool> {
    let mut hidden_files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() || !is_hidden(&entry.file_name()) {
            return Ok(false);
        }
        hidden_files.push(entry.path());
    }

    for file in hidden_files {
        fs::remove_file(file)?;
    }
    fs::remove_dir(dir)?;
    Ok(true)
}

/// 自底向上清理空目录，返回被删除目录的相对路径（已排序）
///
/// 根目录、隐藏目录和受管理目录永远不会被删除。
pub fn prune_empty_dirs(layout: &LibraryLayout) -> Vec<String> {
    let mut removed = Vec::new();

    for pass in 0..MAX_PRUNE_PASSES {
        let dirs: Vec<PathBuf> = WalkDir::new(layout.root())
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !is_hidden(e.file_name()))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.into_path())
            .collect();

        // 先序遍历的逆序：子目录总在父目录之前处理
        let mut removed_this_pass = 0;
        for dir in dirs.into_iter().rev() {
            match remove_if_empty(&dir) {
                Ok(true) => {
                    removed_this_pass += 1;
                    if let Some(rel) = layout.relative(&dir) {
                        debug!("删除空目录: {}", rel);
                        removed.push(rel);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("清理目录失败 {:?}: {}", dir, e),
            }
        }

        if removed_this_pass == 0 {
            break;
        }
        debug!("第 {} 轮清理删除 {} 个目录", pass + 1, removed_this_pass);
    }

    removed.sort();
    removed
}

/// 只读地找出 `prune_empty_dirs` 此刻会删除的目录（已排序）
pub fn find_empty_dirs(layout: &LibraryLayout) -> Vec<String> {
    let root = layout.root();
    let mut candidates = Vec::new();
    let mut occupied: HashSet<PathBuf> = HashSet::new();

    // 从 start 起向上标记，直到根目录；祖先链总是整条写入
    let mut occupy = |start: &Path| {
        for dir in start.ancestors() {
            if dir == root || !dir.starts_with(root) || !occupied.insert(dir.to_path_buf()) {
                break;
            }
        }
    };

    let mut walker = WalkDir::new(root).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // 读不了的目录清理时也删不掉
                if let Some(path) = e.path() {
                    occupy(path);
                }
                continue;
            }
        };
        let is_dir = entry.file_type().is_dir();
        if is_hidden(entry.file_name()) {
            if is_dir {
                if let Some(parent) = entry.path().parent() {
                    occupy(parent);
                }
                walker.skip_current_dir();
            }
            continue;
        }
        if is_dir {
            candidates.push(entry.into_path());
        } else if let Some(parent) = entry.path().parent() {
            occupy(parent);
        }
    }

    let mut empty: Vec<String> = candidates
        .iter()
        .filter(|dir| !occupied.contains(*dir))
        .filter_map(|dir| layout.relative(dir))
        .collect();
    empty.sort();
    empty
}

/// 从 `start` 向上清理空目录，直到根目录或遇到非空目录
pub fn prune_empty_ancestors(layout: &LibraryLayout, start: &Path) -> Vec<String> {
    let mut removed = Vec::new();
    let mut current = start.to_path_buf();

    while current.starts_with(layout.root()) && current != layout.root() {
        let name_is_hidden = current.file_name().map(is_hidden).unwrap_or(true);
        if name_is_hidden {
            break;
        }
        match remove_if_empty(&current) {
            Ok(true) => {
                if let Some(rel) = layout.relative(&current) {
                    removed.push(rel);
                }
            }
            _ => break,
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_path_encodes_time_and_hash() {
        let t = CaptureTime::parse("2023:06:01 08:09:10").unwrap();
        assert_eq!(
            canonical_path(t, "abcdef0123456789", "JPG"),
            "2023/2023-06-01/img_20230601_080910_abcdef01.jpg"
        );
        assert_eq!(
            canonical_path_for(t, "abcdef0123456789", Path::new("x/Clip.MOV")),
            "2023/2023-06-01/img_20230601_080910_abcdef01.mov"
        );
    }

    #[test]
    fn relative_and_absolute_round_trip() {
        let layout = LibraryLayout::new("/lib");
        let abs = layout.absolute("2023/2023-06-01/a.jpg");
        assert_eq!(abs, PathBuf::from("/lib/2023/2023-06-01/a.jpg"));
        assert_eq!(layout.relative(&abs).as_deref(), Some("2023/2023-06-01/a.jpg"));
        assert_eq!(layout.relative(Path::new("/lib")), None);
        assert_eq!(layout.relative(Path::new("/other/a.jpg")), None);
    }

    #[test]
    fn unique_destination_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"1").unwrap();
        fs::write(dir.path().join("a_1.jpg"), b"2").unwrap();
        let target = unique_destination(dir.path(), OsStr::new("a.jpg"));
        assert_eq!(target, dir.path().join("a_2.jpg"));
    }

    #[test]
    fn prunes_nested_empty_dirs_but_keeps_managed_and_root() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LibraryLayout::new(dir.path());
        layout.ensure_dirs().unwrap();

        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        fs::create_dir_all(dir.path().join("keep")).unwrap();
        fs::write(dir.path().join("keep/photo.jpg"), b"x").unwrap();
        fs::create_dir_all(dir.path().join("hidden_only")).unwrap();
        fs::write(dir.path().join("hidden_only/.DS_Store"), b"x").unwrap();

        let removed = prune_empty_dirs(&layout);
        assert_eq!(removed, vec!["a", "a/b", "a/b/c", "hidden_only"]);
        assert!(dir.path().join("keep/photo.jpg").exists());
        assert!(layout.meta_dir().exists());
        assert!(layout.trash_dir().exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn finding_empty_dirs_matches_pruning_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LibraryLayout::new(dir.path());
        layout.ensure_dirs().unwrap();

        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        fs::create_dir_all(dir.path().join("keep/empty")).unwrap();
        fs::write(dir.path().join("keep/photo.jpg"), b"x").unwrap();
        fs::create_dir_all(dir.path().join("hidden_only")).unwrap();
        fs::write(dir.path().join("hidden_only/.DS_Store"), b"x").unwrap();
        fs::create_dir_all(dir.path().join("holder/.cache")).unwrap();

        let found = find_empty_dirs(&layout);
        assert_eq!(found, vec!["a", "a/b", "a/b/c", "hidden_only", "keep/empty"]);
        assert!(dir.path().join("a/b/c").exists());
        assert!(dir.path().join("hidden_only/.DS_Store").exists());

        assert_eq!(prune_empty_dirs(&layout), found);
        assert!(dir.path().join("holder/.cache").exists());
    }

    #[test]
    fn prunes_ancestors_up_to_first_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LibraryLayout::new(dir.path());
        fs::create_dir_all(dir.path().join("2023/2023-06-01")).unwrap();
        fs::write(dir.path().join("2023/other.jpg"), b"x").unwrap();

        let removed = prune_empty_ancestors(&layout, &dir.path().join("2023/2023-06-01"));
        assert_eq!(removed, vec!["2023/2023-06-01"]);
        assert!(dir.path().join("2023").exists());
    }

    #[tokio::test]
    async fn quarantine_moves_into_category_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LibraryLayout::new(dir.path());
        let source = dir.path().join("in/a.jpg");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"x").unwrap();

        let target = quarantine_file(&layout, QuarantineCategory::Corrupted, &source)
            .await
            .unwrap();
        assert_eq!(target, dir.path().join(".quarantine/corrupted/a.jpg"));
        assert!(!source.exists());
        assert!(target.exists());
    }
}
