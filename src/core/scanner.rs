use crate::core::layout::{is_hidden, is_managed_dir, LibraryLayout};
use crate::db::MediaKind;
use crate::error::{LibraryError, Result};
use regex::Regex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 文件扫描器配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 排除规则（glob patterns）
    pub exclude_patterns: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: vec![
                "Thumbs.db".to_string(),
                "*.tmp".to_string(),
                "*.temp".to_string(),
                "~*".to_string(),
            ],
        }
    }
}

/// 磁盘上的一个媒体文件
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    /// 相对库根目录的路径，`/` 分隔
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    /// 修改时间（秒）
    pub mtime: i64,
    pub kind: MediaKind,
}

/// 编译后的排除规则
#[derive(Debug, Clone)]
struct ExcludeRules {
    patterns: Vec<Regex>,
    literals: Vec<String>,
}

impl ExcludeRules {
    fn compile(patterns: &[String]) -> Self {
        let mut rules = Self {
            patterns: Vec::new(),
            literals: Vec::new(),
        };

        for pattern in patterns {
            let pattern = pattern.to_lowercase();
            if !pattern.contains('*') {
                rules.literals.push(pattern);
                continue;
            }

            // ** 跨目录，* 只匹配单个路径段
            let escaped = regex::escape(&pattern)
                .replace(r"\*\*", ".*")
                .replace(r"\*", "[^/]*");
            match Regex::new(&format!("^{}$", escaped)) {
                Ok(re) => rules.patterns.push(re),
                Err(e) => warn!("无效的排除规则 {}: {}", pattern, e),
            }
        }
        rules
    }

    /// 规则同时匹配完整相对路径与文件名
    fn matches(&self, rel_path: &str) -> bool {
        let path = rel_path.to_lowercase();
        let name = path.rsplit('/').next().unwrap_or(&path);

        self.literals
            .iter()
            .any(|lit| path == *lit || name == lit || path.ends_with(&format!("/{}", lit)))
            || self
                .patterns
                .iter()
                .any(|re| re.is_match(&path) || re.is_match(name))
    }
}

/// 文件扫描器
pub struct FileScanner {
    rules: ExcludeRules,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl FileScanner {
    pub fn new() -> Self {
        Self::with_config(ScanConfig::default())
    }

    pub fn with_config(config: ScanConfig) -> Self {
        Self {
            rules: ExcludeRules::compile(&config.exclude_patterns),
            cancel_flag: None,
        }
    }

    /// 附加取消标志
    pub fn with_cancel(mut self, cancel_flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(cancel_flag);
        self
    }

    /// 检查路径是否应该被排除
    pub fn should_exclude(&self, rel_path: &str) -> bool {
        self.rules.matches(rel_path)
    }

    /// 扫描库根目录，返回按相对路径排序的媒体文件
    ///
    /// 隐藏目录与受管理目录整体跳过，隐藏文件和非媒体扩展名被忽略。
    pub async fn scan(&self, layout: &LibraryLayout) -> Result<Vec<ScannedFile>> {
        let root = layout.root().to_path_buf();
        if !tokio::fs::metadata(&root)
            .await
            .map_err(|e| LibraryError::io(&root, e))?
            .is_dir()
        {
            return Err(LibraryError::Invalid(format!("不是目录: {:?}", root)));
        }

        info!("开始扫描: {:?}", root);
        let rules = self.rules.clone();
        let cancel = self.cancel_flag.clone();
        let walk_layout = layout.clone();

        let files = tokio::task::spawn_blocking(move || walk(&walk_layout, &rules, cancel.as_deref()))
            .await
            .map_err(|e| LibraryError::Invalid(format!("扫描任务失败: {}", e)))??;

        info!("扫描完成: {} 个媒体文件", files.len());
        Ok(files)
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn walk(
    layout: &LibraryLayout,
    rules: &ExcludeRules,
    cancel: Option<&AtomicBool>,
) -> Result<Vec<ScannedFile>> {
    let mut files = Vec::new();
    let mut excluded = 0usize;

    let walker = WalkDir::new(layout.root())
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name();
            !(is_hidden(name) || (e.file_type().is_dir() && is_managed_dir(name)))
        });

    for (index, entry) in walker.enumerate() {
        // 每处理一定数量检查一次取消状态
        if index % 100 == 0 && cancel.map(|c| c.load(Ordering::SeqCst)).unwrap_or(false) {
            return Err(LibraryError::Cancelled);
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("无法读取目录项: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(kind) = MediaKind::from_path(entry.path()) else {
            continue;
        };
        let Some(rel_path) = layout.relative(entry.path()) else {
            continue;
        };
        if rules.matches(&rel_path) {
            debug!("排除文件: {}", rel_path);
            excluded += 1;
            continue;
        }

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("无法读取文件信息 {}: {}", rel_path, e);
                continue;
            }
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        files.push(ScannedFile {
            rel_path,
            abs_path: entry.into_path(),
            size: meta.len(),
            mtime,
            kind,
        });
    }

    if excluded > 0 {
        debug!("{} 个文件被排除规则跳过", excluded);
    }
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}
