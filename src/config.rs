//! 媒体库配置模块
//!
//! 所有配置保存在 `<root>/.library/config.json`，每个部分独立读写，互不覆盖。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// 哈希缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// 内存层最多保留的条目数
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
    /// 计算哈希时每次读取的字节数
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_memory_capacity() -> usize {
    1000
}

fn default_chunk_size() -> usize {
    1024 * 1024 // 1MB
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: default_memory_capacity(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// 每处理多少个文件保存一次检查点
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    /// 同步结束后清理空目录
    #[serde(default = "default_true")]
    pub prune_empty_dirs: bool,
    /// 增量同步时把新文件移动到规范路径
    #[serde(default = "default_true")]
    pub relocate_moles: bool,
    /// 额外的排除规则（glob）
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

fn default_checkpoint_interval() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        "Thumbs.db".to_string(),
        "*.tmp".to_string(),
        "*.temp".to_string(),
        "~*".to_string(),
    ]
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            prune_empty_dirs: true,
            relocate_moles: true,
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

/// 导入（整理）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdoptConfig {
    /// 开始前要求的最小可用空间（字节）
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
}

fn default_min_free_bytes() -> u64 {
    1024 * 1024 * 1024 // 1GB
}

impl Default for AdoptConfig {
    fn default() -> Self {
        Self {
            min_free_bytes: default_min_free_bytes(),
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

/// 目录备份配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

fn default_max_backups() -> usize {
    20
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_backups: default_max_backups(),
        }
    }
}

/// 维护配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceConfig {
    /// 已结束的操作记录保留天数
    #[serde(default = "default_retention_days")]
    pub checkpoint_retention_days: u32,
}

fn default_retention_days() -> u32 {
    30
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            checkpoint_retention_days: default_retention_days(),
        }
    }
}

/// 可以作为 config.json 中一个部分读写的配置
pub trait ConfigSection: Serialize + DeserializeOwned + Default {
    const KEY: &'static str;

    /// 从配置文件加载，缺失或格式错误时使用默认值
    fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join("config.json");
        fs::read_to_string(&config_file)
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get(Self::KEY).cloned())
            .and_then(|section| serde_json::from_value::<Self>(section).ok())
            .unwrap_or_default()
    }

    /// 保存本部分，保留文件中的其他部分
    fn save(&self, config_dir: &Path) -> io::Result<()> {
        fs::create_dir_all(config_dir)?;
        let config_file = config_dir.join("config.json");

        // 读取现有配置
        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        config[Self::KEY] = serde_json::to_value(self).map_err(io::Error::other)?;

        let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
        fs::write(&config_file, content)
    }
}

impl ConfigSection for CacheConfig {
    const KEY: &'static str = "cache";
}

impl ConfigSection for SyncSettings {
    const KEY: &'static str = "sync";
}

impl ConfigSection for AdoptConfig {
    const KEY: &'static str = "adopt";
}

impl ConfigSection for BackupConfig {
    const KEY: &'static str = "backup";
}

impl ConfigSection for MaintenanceConfig {
    const KEY: &'static str = "maintenance";
}

impl ConfigSection for crate::logging::LogConfig {
    const KEY: &'static str = "log";
}

/// 媒体库的全部配置
#[derive(Debug, Clone, Default)]
pub struct LibraryConfig {
    pub cache: CacheConfig,
    pub sync: SyncSettings,
    pub adopt: AdoptConfig,
    pub backup: BackupConfig,
    pub maintenance: MaintenanceConfig,
}

impl LibraryConfig {
    pub fn load(config_dir: &Path) -> Self {
        Self {
            cache: CacheConfig::load(config_dir),
            sync: SyncSettings::load(config_dir),
            adopt: AdoptConfig::load(config_dir),
            backup: BackupConfig::load(config_dir),
            maintenance: MaintenanceConfig::load(config_dir),
        }
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        self.cache.save(config_dir)?;
        self.sync.save(config_dir)?;
        self.adopt.save(config_dir)?;
        self.backup.save(config_dir)?;
        self.maintenance.save(config_dir)
    }
}
