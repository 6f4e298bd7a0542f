//! 应用配置模块
//!
//! 配置保存在数据目录下的 `config.json`，按节划分：
//! `drives`、`sync`、`filter`、`log`。缺失的字段使用默认值。

use crate::core::conflict::ConflictStrategy;
use crate::core::safety::SafetyConfig;
use crate::logging::LogConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 远端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteType {
    /// 进程内驱动器（演练和测试）
    Memory,
    Fs,
    S3,
    WebDav,
}

/// 远端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    #[serde(rename = "type")]
    pub typ: RemoteType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webdav_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

/// 单个驱动器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveConfig {
    pub id: String,
    pub name: String,
    pub local_root: PathBuf,
    pub remote: RemoteConfig,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// 过滤规则配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
    /// 跳过以 . 开头的文件和目录
    pub skip_dotfiles: bool,
    /// 跳过符号链接
    pub skip_symlinks: bool,
    /// 跳过的目录（glob）
    pub skip_dirs: Vec<String>,
    /// 跳过的文件（glob）
    pub skip_files: Vec<String>,
    /// 最大文件大小（字节，0 表示不限制）
    pub max_file_size: u64,
    /// 目录中存在该文件时整个目录不同步
    pub ignore_marker: Option<String>,
    /// 仅同步这些路径前缀（空表示全部）
    pub sync_list: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            skip_dotfiles: false,
            skip_symlinks: true,
            skip_dirs: vec![],
            skip_files: vec![
                "~*".to_string(),
                "*.tmp".to_string(),
                "*.partial".to_string(),
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
            ],
            max_file_size: 0,
            ignore_marker: Some(".nosync".to_string()),
            sync_list: vec![],
        }
    }
}

/// 同步参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub download_workers: usize,
    pub upload_workers: usize,
    pub hash_workers: usize,
    /// 删除数量上限
    pub max_delete_count: usize,
    /// 删除占比上限（百分比）
    pub max_delete_percent: f64,
    /// 条目数不超过该值的驱动器不做比例检查
    pub min_items_for_delete_check: usize,
    /// 下载后本地至少保留的空间（MB）
    pub min_free_space_mb: u64,
    pub conflict_strategy: ConflictStrategy,
    pub poll_interval_secs: u64,
    /// 每隔多少次轮询做一次全量重扫
    pub full_scan_every_polls: u32,
    pub tombstone_retention_days: u64,
    pub transfer_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// 只计算决策，不执行
    pub dry_run: bool,
    /// 明确允许大批量删除
    pub allow_mass_delete: bool,
    /// 监听本地变更触发同步
    pub watch_local: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            download_workers: 4,
            upload_workers: 4,
            hash_workers: 2,
            max_delete_count: 50,
            max_delete_percent: 50.0,
            min_items_for_delete_check: 10,
            min_free_space_mb: 50,
            conflict_strategy: ConflictStrategy::KeepBoth,
            poll_interval_secs: 300,
            full_scan_every_polls: 12,
            tombstone_retention_days: 30,
            transfer_timeout_secs: 300,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            dry_run: false,
            allow_mass_delete: false,
            watch_local: true,
        }
    }
}

impl SyncSettings {
    pub fn safety(&self) -> SafetyConfig {
        SafetyConfig {
            max_delete_count: self.max_delete_count,
            max_delete_percent: self.max_delete_percent,
            min_items_floor: self.min_items_for_delete_check,
            min_free_space: self.min_free_space_mb * 1024 * 1024,
            allow_mass_delete: self.allow_mass_delete,
        }
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_days * 24 * 3600)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs.max(1))
    }
}

/// 完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub drives: Vec<DriveConfig>,
    pub sync: SyncSettings,
    pub filter: FilterConfig,
    pub log: LogConfig,
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// 从配置目录加载，文件不存在时返回默认配置
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join("config.json");
        if !config_file.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_file)
            .with_context(|| format!("读取配置失败: {:?}", config_file))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("解析配置失败: {:?}", config_file))?;
        config.validate()?;
        Ok(config)
    }

    /// 保存配置
    pub fn save(&self, config_dir: &Path) -> Result<()> {
        fs::create_dir_all(config_dir)?;
        let content = serde_json::to_string_pretty(self)?;
        fs::write(config_dir.join("config.json"), content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for drive in &self.drives {
            if drive.id.is_empty() || !drive.id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                anyhow::bail!("驱动器 ID 只能包含字母、数字、- 和 _: {:?}", drive.id);
            }
            if !seen.insert(drive.id.as_str()) {
                anyhow::bail!("驱动器 ID 重复: {}", drive.id);
            }
        }
        if !(0.0..=100.0).contains(&self.sync.max_delete_percent) {
            anyhow::bail!("maxDeletePercent 必须在 0-100 之间");
        }
        Ok(())
    }
}
