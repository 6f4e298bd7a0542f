//! 状态库 - 每个驱动器一份
//!
//! 记录每个条目上次同步时两端一致认可的状态、远端变更游标和墓碑。
//! 条目记录只在某个决策成功执行后更新；游标只在整轮的记录都写入后推进。

use crate::db::{ItemRow, SqlitePool, TombstoneRow};
use crate::error::Result;
use crate::core::path;
use sqlx::sqlite::{Sqlite, SqliteArguments};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const CURSOR_KEY: &str = "delta_cursor";
const PATH_KEY_PREFIX: &str = "path:";

/// 上次同步快照：两端在某一时刻一致认可的内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedSnapshot {
    pub fingerprint: Option<String>,
    pub size: u64,
    pub local_mtime: i64,
    pub remote_version: Option<String>,
}

/// 条目记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRecord {
    /// 远端 ID；从未出现在远端的条目为 `path:<路径>`
    pub key: String,
    pub path: String,
    pub remote_id: Option<String>,
    pub parent_remote_id: Option<String>,
    pub is_folder: bool,
    pub size: u64,
    pub local_fingerprint: Option<String>,
    pub remote_fingerprint: Option<String>,
    pub remote_version: Option<String>,
    pub local_mtime: i64,
    pub remote_mtime: i64,
    pub synced: Option<SyncedSnapshot>,
    pub synced_at: Option<i64>,
    pub last_error: Option<String>,
    pub failed_at: Option<i64>,
}

impl ItemRecord {
    /// 仅在本地出现过的条目的键
    pub fn key_for_path(path: &str) -> String {
        format!("{}{}", PATH_KEY_PREFIX, path)
    }

    pub fn is_path_keyed(&self) -> bool {
        self.key.starts_with(PATH_KEY_PREFIX)
    }

    /// 两端一致后的完整记录
    #[allow(clippy::too_many_arguments)]
    pub fn converged(
        remote_id: &str,
        parent_remote_id: Option<&str>,
        path: &str,
        is_folder: bool,
        fingerprint: Option<String>,
        size: u64,
        local_mtime: i64,
        remote_version: Option<String>,
        remote_mtime: i64,
        now: i64,
    ) -> Self {
        Self {
            key: remote_id.to_string(),
            path: path.to_string(),
            remote_id: Some(remote_id.to_string()),
            parent_remote_id: parent_remote_id.map(str::to_string),
            is_folder,
            size,
            local_fingerprint: fingerprint.clone(),
            remote_fingerprint: fingerprint.clone(),
            remote_version: remote_version.clone(),
            local_mtime,
            remote_mtime,
            synced: Some(SyncedSnapshot {
                fingerprint,
                size,
                local_mtime,
                remote_version,
            }),
            synced_at: Some(now),
            last_error: None,
            failed_at: None,
        }
    }
}

impl From<ItemRow> for ItemRecord {
    fn from(row: ItemRow) -> Self {
        let synced = row.synced_size.map(|size| SyncedSnapshot {
            fingerprint: row.synced_fingerprint.clone(),
            size: size as u64,
            local_mtime: row.synced_local_mtime.unwrap_or(0),
            remote_version: row.synced_remote_version.clone(),
        });

        ItemRecord {
            key: row.item_key,
            path: row.path,
            remote_id: row.remote_id,
            parent_remote_id: row.parent_remote_id,
            is_folder: row.is_folder,
            size: row.size as u64,
            local_fingerprint: row.local_fingerprint,
            remote_fingerprint: row.remote_fingerprint,
            remote_version: row.remote_version,
            local_mtime: row.local_mtime,
            remote_mtime: row.remote_mtime,
            synced,
            synced_at: row.synced_at,
            last_error: row.last_error,
            failed_at: row.failed_at,
        }
    }
}

/// 墓碑
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    pub key: String,
    pub remote_id: Option<String>,
    pub path: String,
    pub is_folder: bool,
    pub deleted_at: i64,
    pub retain_until: i64,
}

impl From<TombstoneRow> for Tombstone {
    fn from(row: TombstoneRow) -> Self {
        Tombstone {
            key: row.item_key,
            remote_id: row.remote_id,
            path: row.path,
            is_folder: row.is_folder,
            deleted_at: row.deleted_at,
            retain_until: row.retain_until,
        }
    }
}

fn upsert_query(record: &ItemRecord) -> sqlx::query::Query<'_, Sqlite, SqliteArguments<'_>> {
    let synced = record.synced.as_ref();
    sqlx::query(
        r#"INSERT INTO items (item_key, path, remote_id, parent_remote_id, is_folder, size,
               local_fingerprint, remote_fingerprint, remote_version, local_mtime, remote_mtime,
               synced_fingerprint, synced_size, synced_local_mtime, synced_remote_version, synced_at,
               last_error, failed_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(item_key) DO UPDATE SET
               path = excluded.path,
               remote_id = excluded.remote_id,
               parent_remote_id = excluded.parent_remote_id,
               is_folder = excluded.is_folder,
               size = excluded.size,
               local_fingerprint = excluded.local_fingerprint,
               remote_fingerprint = excluded.remote_fingerprint,
               remote_version = excluded.remote_version,
               local_mtime = excluded.local_mtime,
               remote_mtime = excluded.remote_mtime,
               synced_fingerprint = excluded.synced_fingerprint,
               synced_size = excluded.synced_size,
               synced_local_mtime = excluded.synced_local_mtime,
               synced_remote_version = excluded.synced_remote_version,
               synced_at = excluded.synced_at,
               last_error = excluded.last_error,
               failed_at = excluded.failed_at"#,
    )
    .bind(&record.key)
    .bind(&record.path)
    .bind(&record.remote_id)
    .bind(&record.parent_remote_id)
    .bind(record.is_folder)
    .bind(record.size as i64)
    .bind(&record.local_fingerprint)
    .bind(&record.remote_fingerprint)
    .bind(&record.remote_version)
    .bind(record.local_mtime)
    .bind(record.remote_mtime)
    .bind(synced.and_then(|s| s.fingerprint.clone()))
    .bind(synced.map(|s| s.size as i64))
    .bind(synced.map(|s| s.local_mtime))
    .bind(synced.and_then(|s| s.remote_version.clone()))
    .bind(record.synced_at)
    .bind(&record.last_error)
    .bind(record.failed_at)
}

/// 状态库
///
/// 允许并发读；同一驱动器的写入由轮次锁串行化。
#[derive(Clone)]
pub struct StateStore {
    db: Arc<SqlitePool>,
    drive_id: String,
    retention: Duration,
}

impl StateStore {
    pub fn new(db: Arc<SqlitePool>, drive_id: &str, retention: Duration) -> Self {
        Self {
            db,
            drive_id: drive_id.to_string(),
            retention,
        }
    }

    pub fn drive_id(&self) -> &str {
        &self.drive_id
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    /// 按键获取记录（包括已打墓碑的）
    pub async fn get(&self, key: &str) -> Result<Option<ItemRecord>> {
        let row = sqlx::query_as::<_, ItemRow>("SELECT * FROM items WHERE item_key = ?")
            .bind(key)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn get_by_remote_id(&self, remote_id: &str) -> Result<Option<ItemRecord>> {
        let row = sqlx::query_as::<_, ItemRow>("SELECT * FROM items WHERE remote_id = ? LIMIT 1")
            .bind(remote_id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row.map(Into::into))
    }

    /// 更新或插入记录
    pub async fn upsert(&self, record: &ItemRecord) -> Result<()> {
        upsert_query(record).execute(&*self.db).await?;
        Ok(())
    }

    /// 把记录换到新键下（路径键的条目上传后拿到远端 ID）
    pub async fn rekey(&self, old_key: &str, record: &ItemRecord) -> Result<()> {
        self.commit_item(Some(old_key), record).await?;
        debug!("记录换键: {} -> {}", old_key, record.key);
        Ok(())
    }

    /// 决策成功执行后写入记录
    ///
    /// 同一事务内清除旧键的记录和两个键上的墓碑（复活），再写入新记录。
    pub async fn commit_item(&self, old_key: Option<&str>, record: &ItemRecord) -> Result<()> {
        let mut tx = self.db.begin().await?;
        if let Some(old) = old_key.filter(|k| *k != record.key) {
            sqlx::query("DELETE FROM items WHERE item_key = ?")
                .bind(old)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM tombstones WHERE item_key = ?")
                .bind(old)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM tombstones WHERE item_key = ?")
            .bind(&record.key)
            .execute(&mut *tx)
            .await?;
        upsert_query(record).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM items WHERE item_key = ?")
            .bind(key)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// 所有未打墓碑的记录
    pub async fn list_active(&self) -> Result<Vec<ItemRecord>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM items WHERE item_key NOT IN (SELECT item_key FROM tombstones) ORDER BY path",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// 给记录打墓碑，记录本身保留到保留期结束
    pub async fn mark_tombstone(&self, key: &str, now: i64) -> Result<bool> {
        let retain_until = now + self.retention.as_secs() as i64;
        let result = sqlx::query(
            r#"INSERT INTO tombstones (item_key, remote_id, path, is_folder, deleted_at, retain_until)
               SELECT item_key, remote_id, path, is_folder, ?, ? FROM items WHERE item_key = ?
               ON CONFLICT(item_key) DO UPDATE SET
                   deleted_at = excluded.deleted_at,
                   retain_until = excluded.retain_until"#,
        )
        .bind(now)
        .bind(retain_until)
        .bind(key)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// 复活：移除墓碑
    pub async fn revive(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM tombstones WHERE item_key = ?")
            .bind(key)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// 仍在保留期内的墓碑
    pub async fn tombstones(&self, now: i64) -> Result<Vec<Tombstone>> {
        let rows = sqlx::query_as::<_, TombstoneRow>(
            "SELECT * FROM tombstones WHERE retain_until > ? ORDER BY path",
        )
        .bind(now)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// 清理过期墓碑及其记录
    pub async fn purge_expired_tombstones(&self, now: i64) -> Result<u64> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "DELETE FROM items WHERE item_key IN (SELECT item_key FROM tombstones WHERE retain_until <= ?)",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM tombstones WHERE retain_until <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!("[{}] 清理了 {} 个过期墓碑", self.drive_id, purged);
        }
        Ok(purged)
    }

    pub async fn get_cursor(&self) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM drive_state WHERE key = ?")
                .bind(CURSOR_KEY)
                .fetch_optional(&*self.db)
                .await?;
        Ok(value)
    }

    pub async fn set_cursor(&self, token: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO drive_state (key, value, updated_at) VALUES (?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"#,
        )
        .bind(CURSOR_KEY)
        .bind(token)
        .bind(chrono::Utc::now().timestamp())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn clear_cursor(&self) -> Result<()> {
        sqlx::query("DELETE FROM drive_state WHERE key = ?")
            .bind(CURSOR_KEY)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// 记录单个条目的失败；没有记录的新条目以路径为键建一条未同步记录
    pub async fn record_failure(
        &self,
        key: Option<&str>,
        rel_path: &str,
        is_folder: bool,
        error: &str,
        now: i64,
    ) -> Result<()> {
        let existing = match key {
            Some(k) => self.get(k).await?,
            None => None,
        };

        let record = match existing {
            Some(mut r) => {
                r.last_error = Some(error.to_string());
                r.failed_at = Some(now);
                r
            }
            None => ItemRecord {
                key: key
                    .map(str::to_string)
                    .unwrap_or_else(|| ItemRecord::key_for_path(rel_path)),
                path: rel_path.to_string(),
                remote_id: key
                    .filter(|k| !k.starts_with(PATH_KEY_PREFIX))
                    .map(str::to_string),
                parent_remote_id: None,
                is_folder,
                size: 0,
                local_fingerprint: None,
                remote_fingerprint: None,
                remote_version: None,
                local_mtime: 0,
                remote_mtime: 0,
                synced: None,
                synced_at: None,
                last_error: Some(error.to_string()),
                failed_at: Some(now),
            },
        };

        self.upsert(&record).await
    }

    /// 目录移动后，子孙记录的路径一起改写
    pub async fn rewrite_subtree(&self, old_prefix: &str, new_prefix: &str) -> Result<u64> {
        let rows = sqlx::query_as::<_, ItemRow>("SELECT * FROM items WHERE path LIKE ? || '/%'")
            .bind(old_prefix)
            .fetch_all(&*self.db)
            .await?;

        let mut tx = self.db.begin().await?;
        let mut rewritten = 0;
        for row in rows {
            let mut record: ItemRecord = row.into();
            // LIKE 会把 _ 和 % 当通配符，这里再精确过滤一次
            if let Some(new_path) = path::rebase(&record.path, old_prefix, new_prefix) {
                if new_path == record.path || !path::is_within(&record.path, old_prefix) {
                    continue;
                }
                record.path = new_path;
                upsert_query(&record).execute(&mut *tx).await?;
                rewritten += 1;
            }
        }
        tx.commit().await?;
        Ok(rewritten)
    }

    /// 有失败记录的条目
    pub async fn list_failed(&self) -> Result<Vec<ItemRecord>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM items WHERE last_error IS NOT NULL ORDER BY failed_at DESC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
