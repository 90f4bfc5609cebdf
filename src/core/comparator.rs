use crate::core::layout::canonical_path_for;
use crate::core::scanner::ScannedFile;
use crate::db::LibraryEntry;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

/// 目录与磁盘的差异
#[derive(Debug, Clone, Default)]
pub struct LibraryDiff {
    /// 目录中有、磁盘上已不存在的条目
    pub ghosts: Vec<LibraryEntry>,
    /// 磁盘上有、目录中没有的文件
    pub moles: Vec<ScannedFile>,
    /// 两边都有的条目
    pub tracked: Vec<LibraryEntry>,
}

impl LibraryDiff {
    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            ghosts: self.ghosts.len(),
            moles: self.moles.len(),
            tracked: self.tracked.len(),
            non_canonical: self
                .tracked
                .iter()
                .filter(|e| !LibraryComparator::is_canonical(e))
                .count(),
        }
    }
}

/// 差异统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub ghosts: usize,
    pub moles: usize,
    pub tracked: usize,
    pub non_canonical: usize,
}

/// 按相对路径比较目录与磁盘
pub struct LibraryComparator;

impl LibraryComparator {
    /// 结果中各列表均按路径排序，保证多次运行顺序一致
    pub fn diff(disk: Vec<ScannedFile>, catalog: Vec<LibraryEntry>) -> LibraryDiff {
        let mut on_disk: HashMap<String, ScannedFile> = disk
            .into_iter()
            .map(|f| (f.rel_path.clone(), f))
            .collect();

        let mut diff = LibraryDiff::default();
        for entry in catalog {
            if on_disk.remove(&entry.path).is_some() {
                diff.tracked.push(entry);
            } else {
                diff.ghosts.push(entry);
            }
        }
        diff.moles = on_disk.into_values().collect();

        diff.ghosts.sort_by(|a, b| a.path.cmp(&b.path));
        diff.tracked.sort_by(|a, b| a.path.cmp(&b.path));
        diff.moles.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        diff
    }

    /// 条目路径是否与其身份推导出的规范路径一致
    pub fn is_canonical(entry: &LibraryEntry) -> bool {
        entry.path == Self::canonical_of(entry)
    }

    pub fn canonical_of(entry: &LibraryEntry) -> String {
        canonical_path_for(entry.taken_at, &entry.content_hash, Path::new(&entry.path))
    }

    /// 续跑顺序：断点之后的文件优先，之前的（上次失败、仍未入库）随后重试
    pub fn resume_order(moles: Vec<ScannedFile>, marker: Option<&str>) -> Vec<ScannedFile> {
        match marker {
            None => moles,
            Some(marker) => {
                let (before, mut after): (Vec<_>, Vec<_>) =
                    moles.into_iter().partition(|f| f.rel_path.as_str() <= marker);
                after.extend(before);
                after
            }
        }
    }
}
