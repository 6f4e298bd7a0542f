use serde::{Deserialize, Serialize};

/// 同步轮次状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Scanning,
    Comparing,
    Syncing,
    Completed,
    /// 有条目失败或安全检查拦截，游标未推进
    Partial,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Scanning => "scanning",
            SyncStatus::Comparing => "comparing",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Completed => "completed",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }
}

/// 同步进度
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassProgress {
    pub drive_id: String,
    pub status: SyncStatus,
    pub phase: String,
    pub current_path: String,
    pub local_entries: u32,
    pub remote_changes: u32,
    pub decisions: u32,
    pub completed: u32,
    pub failed: u32,
    pub bytes_transferred: u64,
    pub start_time: i64,
}

impl PassProgress {
    pub fn new(drive_id: &str, status: SyncStatus, phase: impl Into<String>, start_time: i64) -> Self {
        Self {
            drive_id: drive_id.to_string(),
            status,
            phase: phase.into(),
            current_path: String::new(),
            local_entries: 0,
            remote_changes: 0,
            decisions: 0,
            completed: 0,
            failed: 0,
            bytes_transferred: 0,
            start_time,
        }
    }
}

// 数据库表模型
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ItemRow {
    pub item_key: String,
    pub path: String,
    pub remote_id: Option<String>,
    pub parent_remote_id: Option<String>,
    pub is_folder: bool,
    pub size: i64,
    pub local_fingerprint: Option<String>,
    pub remote_fingerprint: Option<String>,
    pub remote_version: Option<String>,
    pub local_mtime: i64,
    pub remote_mtime: i64,
    pub synced_fingerprint: Option<String>,
    pub synced_size: Option<i64>,
    pub synced_local_mtime: Option<i64>,
    pub synced_remote_version: Option<String>,
    pub synced_at: Option<i64>,
    pub last_error: Option<String>,
    pub failed_at: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TombstoneRow {
    pub item_key: String,
    pub remote_id: Option<String>,
    pub path: String,
    pub is_folder: bool,
    pub deleted_at: i64,
    pub retain_until: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogRow {
    pub id: i64,
    pub pass_id: String,
    pub mode: String,
    pub start_time: i64,
    pub end_time: i64,
    pub status: String,
    pub decisions: i64,
    pub applied: i64,
    pub failed: i64,
    pub bytes_transferred: i64,
    pub cursor_advanced: bool,
    pub error_message: Option<String>,
}
