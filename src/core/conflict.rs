use crate::core::path;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;

/// 冲突解决策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// 远端占用原路径，本地版本改名保留，两端都得到两份
    #[default]
    KeepBoth,
    KeepLocal,
    KeepRemote,
    /// 不处理，条目保持未同步
    Skip,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStrategy::KeepBoth => write!(f, "keep_both"),
            ConflictStrategy::KeepLocal => write!(f, "keep_local"),
            ConflictStrategy::KeepRemote => write!(f, "keep_remote"),
            ConflictStrategy::Skip => write!(f, "skip"),
        }
    }
}

/// 冲突详情，随决策一起传给执行阶段写入冲突日志
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub path: String,
    pub strategy: ConflictStrategy,
    pub renamed_to: Option<String>,
    pub local_fingerprint: Option<String>,
    pub remote_fingerprint: Option<String>,
    pub local_time: i64,
    pub remote_time: i64,
}

/// 冲突记录
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: i64,
    pub file_path: String,
    pub renamed_path: Option<String>,
    pub resolution: String,
    pub local_fingerprint: Option<String>,
    pub remote_fingerprint: Option<String>,
    pub local_time: Option<i64>,
    pub remote_time: Option<i64>,
    pub created_at: i64,
}

/// 生成冲突文件名
///
/// 扩展名只在文件名部分查找，`.bashrc` 这类点开头的名字视为无扩展名。
pub fn generate_conflict_name(rel_path: &str, side: &str, timestamp: i64) -> String {
    use chrono::DateTime;

    let dt = DateTime::from_timestamp(timestamp, 0)
        .map(|d| d.format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let name = path::file_name(rel_path);
    let renamed = match name.rfind('.') {
        Some(pos) if pos > 0 => {
            let (stem, ext) = name.split_at(pos);
            format!("{}_conflict_{}_{}{}", stem, side, dt, ext)
        }
        _ => format!("{}_conflict_{}_{}", name, side, dt),
    };
    path::join(path::parent(rel_path), &renamed)
}

/// 生成不与已有路径冲突的名字，必要时追加序号
pub fn unique_conflict_name(
    rel_path: &str,
    side: &str,
    timestamp: i64,
    taken: impl Fn(&str) -> bool,
) -> String {
    let base = generate_conflict_name(rel_path, side, timestamp);
    if !taken(&base) {
        return base;
    }

    let name = path::file_name(&base);
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    };
    let parent = path::parent(&base);
    (2..)
        .map(|n| path::join(parent, &format!("{}_{}{}", stem, n, ext)))
        .find(|candidate| !taken(candidate))
        .unwrap_or(base)
}

/// 冲突日志
#[derive(Debug, Clone)]
pub struct ConflictLog {
    db: Arc<SqlitePool>,
}

impl ConflictLog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// 记录冲突
    pub async fn record(&self, info: &ConflictInfo) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"INSERT INTO conflicts (file_path, renamed_path, resolution, local_fingerprint,
                   remote_fingerprint, local_time, remote_time, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&info.path)
        .bind(&info.renamed_to)
        .bind(info.strategy.to_string())
        .bind(&info.local_fingerprint)
        .bind(&info.remote_fingerprint)
        .bind(info.local_time)
        .bind(info.remote_time)
        .bind(now)
        .execute(&*self.db)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// 最近的冲突记录
    pub async fn recent(&self, limit: i64) -> Result<Vec<ConflictRecord>> {
        let rows = sqlx::query_as::<_, ConflictRecord>(
            "SELECT * FROM conflicts ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// 清理早于某时间的记录
    pub async fn cleanup_before(&self, before: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM conflicts WHERE created_at < ?")
            .bind(before)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }
}
