pub mod models;
pub use models::*;

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
pub use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// 打开某个驱动器的状态库（每个驱动器一个独立的 SQLite 文件）
pub async fn open_drive_pool(data_dir: &Path, drive_id: &str) -> Result<SqlitePool> {
    let dir = data_dir.join("drives");
    std::fs::create_dir_all(&dir)?;

    let db_path = dir.join(format!("{}.db", drive_id));
    // Windows 路径需要转换反斜杠为正斜杠
    let db_path_str = db_path.to_string_lossy().replace('\\', "/");

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path_str))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5) // 同一驱动器的写入由轮次锁串行化，读可以并发
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::debug!("状态库已打开: {:?}", db_path);

    Ok(pool)
}

/// 内存状态库（测试和演练用）
///
/// 内存库每个连接是独立的数据库，所以连接数固定为 1。
pub async fn open_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}
