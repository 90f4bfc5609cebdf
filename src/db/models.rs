use crate::error::LibraryError;
use chrono::{DateTime, Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::SystemTime;

/// 拍摄时间在数据库与元数据中的文本格式
pub const CAPTURE_TIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

const PHOTO_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "heic", "heif", "png", "gif", "bmp", "tiff", "tif", "webp", "avif", "jp2",
    "raw", "cr2", "nef", "arw", "dng",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    "mov", "mp4", "m4v", "mkv", "wmv", "webm", "flv", "3gp", "mpg", "mpeg", "vob", "ts", "mts",
    "avi",
];

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    /// 按扩展名判断（不区分大小写）
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_lowercase();
        if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Photo)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    /// 所有受管理的扩展名
    pub fn all_extensions() -> impl Iterator<Item = &'static str> {
        PHOTO_EXTENSIONS.iter().chain(VIDEO_EXTENSIONS.iter()).copied()
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Photo => write!(f, "photo"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

impl From<&str> for MediaKind {
    fn from(s: &str) -> Self {
        match s {
            "video" => MediaKind::Video,
            _ => MediaKind::Photo,
        }
    }
}

/// 拍摄时间，精确到秒，不带时区
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CaptureTime(NaiveDateTime);

impl CaptureTime {
    pub fn new(dt: NaiveDateTime) -> Self {
        Self(dt.with_nanosecond(0).unwrap_or(dt))
    }

    /// 解析常见的时间文本：EXIF 格式、ISO 格式以及带时区的 RFC 3339
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim().trim_matches('\0');
        if text.is_empty() {
            return None;
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(Self::new(dt.with_timezone(&Local).naive_local()));
        }

        // 只取到秒，忽略小数秒和时区后缀
        let head = text.get(..19).unwrap_or(text);
        for format in [CAPTURE_TIME_FORMAT, "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(head, format) {
                return Some(Self::new(dt));
            }
        }
        None
    }

    /// 由文件修改时间构造（本地时间）
    pub fn from_system_time(time: SystemTime) -> Self {
        Self::new(DateTime::<Local>::from(time).naive_local())
    }

    pub fn as_naive(&self) -> NaiveDateTime {
        self.0
    }

    pub fn to_exif_string(&self) -> String {
        self.0.format(CAPTURE_TIME_FORMAT).to_string()
    }
}

impl fmt::Display for CaptureTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(CAPTURE_TIME_FORMAT))
    }
}

impl FromStr for CaptureTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("无法解析的时间: {}", s))
    }
}

impl Serialize for CaptureTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_exif_string())
    }
}

impl<'de> Deserialize<'de> for CaptureTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// 媒体库条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryEntry {
    pub id: i64,
    /// 相对媒体库根目录的路径，使用 `/` 分隔
    pub path: String,
    pub original_filename: String,
    pub content_hash: String,
    pub taken_at: CaptureTime,
    pub file_size: u64,
    pub kind: MediaKind,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub rating: u8,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 待插入的条目
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub path: String,
    pub original_filename: String,
    pub content_hash: String,
    pub taken_at: CaptureTime,
    pub file_size: u64,
    pub kind: MediaKind,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub rating: u8,
}

impl NewEntry {
    pub fn from_entry(entry: &LibraryEntry) -> Self {
        Self {
            path: entry.path.clone(),
            original_filename: entry.original_filename.clone(),
            content_hash: entry.content_hash.clone(),
            taken_at: entry.taken_at,
            file_size: entry.file_size,
            kind: entry.kind,
            width: entry.width,
            height: entry.height,
            rating: entry.rating,
        }
    }
}

/// 软删除墓碑
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedEntry {
    pub id: i64,
    pub entry_id: i64,
    pub original_path: String,
    pub trash_path: String,
    pub reason: String,
    pub entry: LibraryEntry,
    pub deleted_at: i64,
    pub restored_at: Option<i64>,
}

// 数据库表模型
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntryRow {
    pub id: i64,
    pub path: String,
    pub original_filename: String,
    pub content_hash: String,
    pub taken_at: String,
    pub file_size: i64,
    pub media_kind: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub rating: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<EntryRow> for LibraryEntry {
    type Error = LibraryError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let taken_at = CaptureTime::parse(&row.taken_at).ok_or_else(|| {
            LibraryError::Invalid(format!("条目 #{} 的拍摄时间无效: {}", row.id, row.taken_at))
        })?;

        Ok(LibraryEntry {
            id: row.id,
            path: row.path,
            original_filename: row.original_filename,
            content_hash: row.content_hash,
            taken_at,
            file_size: row.file_size.max(0) as u64,
            kind: MediaKind::from(row.media_kind.as_str()),
            width: row.width.map(|w| w as u32),
            height: row.height.map(|h| h as u32),
            rating: row.rating.clamp(0, 5) as u8,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeletedEntryRow {
    pub id: i64,
    pub entry_id: i64,
    pub original_path: String,
    pub trash_path: String,
    pub reason: String,
    pub entry_data: String,
    pub deleted_at: i64,
    pub restored_at: Option<i64>,
}

impl TryFrom<DeletedEntryRow> for DeletedEntry {
    type Error = LibraryError;

    fn try_from(row: DeletedEntryRow) -> Result<Self, Self::Error> {
        let entry: LibraryEntry = serde_json::from_str(&row.entry_data)?;
        Ok(DeletedEntry {
            id: row.id,
            entry_id: row.entry_id,
            original_path: row.original_path,
            trash_path: row.trash_path,
            reason: row.reason,
            entry,
            deleted_at: row.deleted_at,
            restored_at: row.restored_at,
        })
    }
}
