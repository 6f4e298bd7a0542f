//! 日志模块 - 提供文件日志和大小管理功能

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 日志文件名
const LOG_FILE_NAME: &str = "drivesync.log";

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
    5
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

/// 带大小限制的日志写入器
///
/// 超过上限时当前文件改名为 `.old`（只保留一份），再重新打开。
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    written: u64,
    writer: BufWriter<File>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE_NAME);
        let max_size = (max_size_mb.max(1) as u64) * 1024 * 1024;

        if fs::metadata(&file_path).map(|m| m.len() > max_size).unwrap_or(false) {
            Self::rotate_log(&file_path)?;
        }
        let (writer, written) = Self::open_file(&file_path)?;

        Ok(Self {
            file_path,
            max_size,
            written,
            writer,
        })
    }

    fn open_file(file_path: &Path) -> io::Result<(BufWriter<File>, u64)> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let len = file.metadata()?.len();
        Ok((BufWriter::new(file), len))
    }

    /// 轮转日志文件
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_size {
            self.writer.flush()?;
            Self::rotate_log(&self.file_path)?;
            let (writer, written) = Self::open_file(&self.file_path)?;
            self.writer = writer;
            self.written = written;
        }

        let n = self.writer.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// 初始化日志系统
///
/// 返回的 guard 需要在进程生命周期内持有，否则缓冲中的日志会丢失。
pub fn init_logging(log_dir: &Path, config: &LogConfig) -> Option<WorkerGuard> {
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    // RUST_LOG 优先，其次是配置的级别
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config.tracing_level().to_string().to_lowercase();
        EnvFilter::new(format!("{},sqlx=warn,opendal=warn", level))
    });

    match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file_writer);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false);

            // 在 debug 模式下也输出到控制台
            let console_layer = cfg!(debug_assertions)
                .then(|| tracing_subscriber::fmt::layer().with_target(false));

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer);
            let _ = tracing::subscriber::set_global_default(subscriber);
            Some(guard)
        }
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
            tracing::warn!("无法创建日志文件，仅输出到控制台: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotates_past_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();
        let line = vec![b'x'; 64 * 1024];
        for _ in 0..20 {
            writer.write_all(&line).unwrap();
        }
        writer.flush().unwrap();

        assert!(dir.path().join("drivesync.log.old").exists());
        let current = fs::metadata(dir.path().join(LOG_FILE_NAME)).unwrap().len();
        assert!(current <= 1024 * 1024);
    }

    #[test]
    fn test_level_parsing() {
        let config = LogConfig {
            level: "DEBUG".to_string(),
            ..Default::default()
        };
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        let config = LogConfig {
            level: "bogus".to_string(),
            ..Default::default()
        };
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }
}
