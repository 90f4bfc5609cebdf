//! 日志模块 - 文件日志与大小轮转

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 带大小限制的日志写入器，超过上限时把当前文件改名为 `.old` 后重新开始
///
/// 由 `tracing_appender::non_blocking` 在后台线程独占使用，因此不需要内部加锁。
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    written: u64,
    writer: BufWriter<File>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join("photolib.log");
        let max_size = u64::from(max_size_mb.max(1)) * 1024 * 1024;

        let existing = fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
        if existing > max_size {
            Self::rotate_log(&file_path)?;
        }
        let written = fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            writer: Self::open_file(&file_path)?,
            file_path,
            max_size,
            written,
        })
    }

    fn open_file(file_path: &Path) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        Ok(BufWriter::new(file))
    }

    /// 轮转日志文件：photolib.log -> photolib.log.old
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        Self::rotate_log(&self.file_path)?;
        self.writer = Self::open_file(&self.file_path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_size && self.written > 0 {
            self.rotate()?;
        }
        let n = self.writer.write(buf)?;
        self.written += n as u64;
        // 每条日志都落盘，崩溃时不丢最后几行
        self.writer.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// 日志目录：`<root>/.library/logs`
pub fn get_log_dir(library_root: &Path) -> PathBuf {
    crate::core::layout::LibraryLayout::new(library_root).log_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_when_limit_is_reached() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();

        let line = vec![b'x'; 600 * 1024];
        writer.write_all(&line).unwrap();
        writer.write_all(&line).unwrap();
        writer.flush().unwrap();

        let current = fs::metadata(dir.path().join("photolib.log")).unwrap().len();
        let old = fs::metadata(dir.path().join("photolib.log.old")).unwrap().len();
        assert_eq!(current, 600 * 1024);
        assert_eq!(old, 600 * 1024);
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        let config = LogConfig {
            level: "verbose".to_string(),
            ..Default::default()
        };
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }
}
