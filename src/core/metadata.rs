//! 元数据读写契约，以及基于 exiftool / ffmpeg 的默认实现

use crate::db::{CaptureTime, MediaKind};
use crate::error::LibraryError;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// 不支持嵌入元数据的视频格式
const UNWRITABLE_VIDEO_EXTENSIONS: &[&str] = &["mpg", "mpeg", "vob", "ts", "mts", "avi", "wmv"];

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("媒体内容无法解析: {0}")]
    Corrupted(String),

    #[error("缺少外部工具: {0}")]
    ToolMissing(String),

    #[error("该格式不支持写入元数据: {0}")]
    Unsupported(String),

    #[error("外部工具执行超时: {0}")]
    Timeout(String),

    #[error("{0}")]
    Failed(String),

    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),
}

impl MetadataError {
    /// 读取阶段的错误归类
    pub fn into_read_error(self, path: &Path) -> LibraryError {
        match self {
            MetadataError::Io(e) => LibraryError::io(path, e),
            other => LibraryError::Corrupted {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        }
    }

    /// 写入阶段的错误归类
    pub fn into_write_error(self, path: &Path) -> LibraryError {
        match self {
            MetadataError::Io(e) if e.kind() == io::ErrorKind::StorageFull => {
                LibraryError::io(path, e)
            }
            MetadataError::Corrupted(reason) => LibraryError::Corrupted {
                path: path.to_path_buf(),
                reason,
            },
            other => LibraryError::MetadataRewriteFailed {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        }
    }
}

/// 元数据读取
#[async_trait]
pub trait MetadataReader: Send + Sync {
    /// 嵌入的拍摄时间，没有时返回 None
    async fn capture_time(
        &self,
        path: &Path,
        kind: MediaKind,
    ) -> Result<Option<CaptureTime>, MetadataError>;

    async fn dimensions(
        &self,
        path: &Path,
        kind: MediaKind,
    ) -> Result<Option<(u32, u32)>, MetadataError>;
}

/// 元数据写入：成功时文件字节已反映新元数据，失败时文件保持不变
#[async_trait]
pub trait MetadataWriter: Send + Sync {
    async fn write_capture_time(
        &self,
        path: &Path,
        kind: MediaKind,
        taken_at: CaptureTime,
    ) -> Result<(), MetadataError>;

    async fn write_rating(&self, path: &Path, kind: MediaKind, rating: u8)
        -> Result<(), MetadataError>;

    /// 缺失的外部工具名称
    async fn missing_tools(&self) -> Vec<String> {
        Vec::new()
    }
}

/// 读取拍摄时间，没有嵌入时间时退回文件修改时间
pub async fn capture_time_or_mtime(
    reader: &dyn MetadataReader,
    path: &Path,
    kind: MediaKind,
) -> Result<CaptureTime, LibraryError> {
    match reader.capture_time(path, kind).await {
        Ok(Some(taken_at)) => return Ok(taken_at),
        Ok(None) => debug!("没有嵌入的拍摄时间，使用修改时间: {:?}", path),
        Err(MetadataError::Corrupted(reason)) => {
            return Err(LibraryError::Corrupted {
                path: path.to_path_buf(),
                reason,
            })
        }
        Err(MetadataError::Io(e)) => return Err(LibraryError::io(path, e)),
        Err(e) => warn!("读取拍摄时间失败，使用修改时间: {:?}: {}", path, e),
    }

    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| LibraryError::io(path, e))?;
    let modified = meta.modified().map_err(|e| LibraryError::io(path, e))?;
    Ok(CaptureTime::from_system_time(modified))
}

/// 调用 exiftool（照片）与 ffprobe / ffmpeg（视频）
#[derive(Debug, Clone)]
pub struct ExifTool {
    exiftool: String,
    ffprobe: String,
    ffmpeg: String,
    timeout: Duration,
}

impl Default for ExifTool {
    fn default() -> Self {
        Self {
            exiftool: "exiftool".to_string(),
            ffprobe: "ffprobe".to_string(),
            ffmpeg: "ffmpeg".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl ExifTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, program: &str, args: &[&str], path: &Path) -> Result<Output, MetadataError> {
        let mut command = Command::new(program);
        command.args(args).arg(path).kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => Err(MetadataError::Timeout(format!("{} {:?}", program, path))),
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
                Err(MetadataError::ToolMissing(program.to_string()))
            }
            Ok(Err(e)) => Err(MetadataError::Io(e)),
            Ok(Ok(output)) => Ok(output),
        }
    }

    async fn is_available(&self, program: &str, flag: &str) -> bool {
        Command::new(program)
            .arg(flag)
            .kill_on_drop(true)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn stderr_of(output: &Output) -> String {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    }

    fn is_unwritable_video(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| UNWRITABLE_VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false)
    }

    async fn write_video_time(&self, path: &Path, taken_at: CaptureTime) -> Result<(), MetadataError> {
        if Self::is_unwritable_video(path) {
            return Err(MetadataError::Unsupported(format!("{:?}", path)));
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        // 临时文件以 . 开头，扫描时会被忽略
        let temp = path.with_file_name(format!(".{}.rewrite", file_name));
        let iso = taken_at.as_naive().format("%Y-%m-%dT%H:%M:%S").to_string();
        let metadata_arg = format!("creation_time={}", iso);

        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-v")
            .arg("error")
            .arg("-i")
            .arg(path)
            .args(["-map_metadata", "0", "-metadata", &metadata_arg, "-codec", "copy", "-y"])
            .arg("-f")
            .arg(path.extension().and_then(|e| e.to_str()).unwrap_or("mp4").to_lowercase())
            .arg(&temp)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => Err(MetadataError::Timeout(format!("ffmpeg {:?}", path))),
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
                Err(MetadataError::ToolMissing(self.ffmpeg.clone()))
            }
            Ok(Err(e)) => Err(MetadataError::Io(e)),
            Ok(Ok(output)) => Ok(output),
        };

        let output = match output {
            Ok(o) if o.status.success() => o,
            Ok(o) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(MetadataError::Failed(format!("ffmpeg 失败: {}", Self::stderr_of(&o))));
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };
        debug!("ffmpeg 写入完成: {:?} ({} 字节输出)", path, output.stdout.len());

        if let Err(e) = tokio::fs::rename(&temp, path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(MetadataError::Io(e));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataReader for ExifTool {
    async fn capture_time(
        &self,
        path: &Path,
        kind: MediaKind,
    ) -> Result<Option<CaptureTime>, MetadataError> {
        match kind {
            MediaKind::Video => {
                let output = self
                    .run(
                        &self.ffprobe,
                        &[
                            "-v",
                            "error",
                            "-show_entries",
                            "format_tags=creation_time",
                            "-of",
                            "default=noprint_wrappers=1:nokey=1",
                        ],
                        path,
                    )
                    .await?;
                if !output.status.success() {
                    return Err(MetadataError::Corrupted(Self::stderr_of(&output)));
                }
                // 2024-03-15T14:30:45.000000Z 只取到秒，不做时区换算
                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok(stdout
                    .lines()
                    .filter_map(|line| CaptureTime::parse(line.trim().get(..19).unwrap_or(line)))
                    .next())
            }
            MediaKind::Photo => {
                let output = self
                    .run(
                        &self.exiftool,
                        &[
                            "-DateTimeOriginal",
                            "-CreateDate",
                            "-ModifyDate",
                            "-s3",
                            "-d",
                            "%Y:%m:%d %H:%M:%S",
                        ],
                        path,
                    )
                    .await?;
                if !output.status.success() {
                    return Err(MetadataError::Corrupted(Self::stderr_of(&output)));
                }
                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok(stdout.lines().filter_map(CaptureTime::parse).next())
            }
        }
    }

    async fn dimensions(
        &self,
        path: &Path,
        kind: MediaKind,
    ) -> Result<Option<(u32, u32)>, MetadataError> {
        let (program, args): (&str, &[&str]) = match kind {
            MediaKind::Video => (
                &self.ffprobe,
                &[
                    "-v",
                    "error",
                    "-select_streams",
                    "v:0",
                    "-show_entries",
                    "stream=width,height",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                ],
            ),
            MediaKind::Photo => (&self.exiftool, &["-s3", "-ImageWidth", "-ImageHeight"]),
        };

        let output = self.run(program, args, path).await?;
        if !output.status.success() {
            return Err(MetadataError::Corrupted(Self::stderr_of(&output)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let numbers: Vec<u32> = stdout
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect();
        match numbers.as_slice() {
            [w, h, ..] if *w > 0 && *h > 0 => Ok(Some((*w, *h))),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl MetadataWriter for ExifTool {
    async fn write_capture_time(
        &self,
        path: &Path,
        kind: MediaKind,
        taken_at: CaptureTime,
    ) -> Result<(), MetadataError> {
        if kind == MediaKind::Video {
            return self.write_video_time(path, taken_at).await;
        }

        let value = taken_at.to_exif_string();
        let args = [
            format!("-DateTimeOriginal={}", value),
            format!("-CreateDate={}", value),
            format!("-ModifyDate={}", value),
            "-overwrite_original".to_string(),
            "-P".to_string(),
        ];
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self.run(&self.exiftool, &args, path).await?;
        if !output.status.success() {
            return Err(MetadataError::Failed(format!(
                "exiftool 失败: {}",
                Self::stderr_of(&output)
            )));
        }

        // 写入后回读校验
        match self.capture_time(path, kind).await? {
            Some(written) if written == taken_at => Ok(()),
            other => Err(MetadataError::Failed(format!(
                "写入后校验不一致: 期望 {}, 实际 {:?}",
                taken_at, other
            ))),
        }
    }

    async fn write_rating(
        &self,
        path: &Path,
        kind: MediaKind,
        rating: u8,
    ) -> Result<(), MetadataError> {
        if kind == MediaKind::Video {
            return Err(MetadataError::Unsupported(format!("{:?}", path)));
        }

        let rating_arg = format!("-Rating={}", rating);
        let percent_arg = format!("-RatingPercent={}", u32::from(rating) * 20);
        let output = self
            .run(
                &self.exiftool,
                &["-overwrite_original", &rating_arg, &percent_arg],
                path,
            )
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(MetadataError::Failed(format!(
                "exiftool 失败: {}",
                Self::stderr_of(&output)
            )))
        }
    }

    async fn missing_tools(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if !self.is_available(&self.exiftool, "-ver").await {
            missing.push(self.exiftool.clone());
        }
        if !self.is_available(&self.ffprobe, "-version").await {
            missing.push(self.ffprobe.clone());
        }
        if !self.is_available(&self.ffmpeg, "-version").await {
            missing.push(self.ffmpeg.clone());
        }
        missing
    }
}
