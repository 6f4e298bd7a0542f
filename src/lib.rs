pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod remote;
pub mod storage;
pub mod watch;

pub use crate::core::{PassMode, SyncEngine, SyncReport};
pub use config::{AppConfig, DriveConfig, SyncSettings};
pub use error::{Result, SyncError};

/// 应用目录
pub mod dirs {
    use std::path::PathBuf;

    const APP_NAME: &str = "drivesync";

    pub fn config_dir() -> Option<PathBuf> {
        let base = if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        };
        base.map(|p| p.join(APP_NAME))
    }

    /// 状态库所在目录
    pub fn data_dir() -> Option<PathBuf> {
        let base = if cfg!(target_os = "windows") {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local").join("share"))
                })
        };
        base.map(|p| p.join(APP_NAME))
    }

    pub fn log_dir() -> Option<PathBuf> {
        data_dir().map(|p| p.join("logs"))
    }
}
