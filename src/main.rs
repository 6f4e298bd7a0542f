use anyhow::Context;
use drivesync_lib::config::AppConfig;
use drivesync_lib::core::filter::FilterRules;
use drivesync_lib::db::open_drive_pool;
use drivesync_lib::logging::init_logging;
use drivesync_lib::remote::create_remote;
use drivesync_lib::watch::LocalWatcher;
use drivesync_lib::{dirs, PassMode, SyncEngine, SyncError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 本地变化合并等待时间
const WATCH_QUIET: Duration = Duration::from_secs(2);
/// 一轮结束后继续忽略本地事件的时间，吸收本轮写入迟到的通知
const WATCH_SETTLE: Duration = Duration::from_secs(1);

/// 触发一轮同步的原因
#[derive(Debug, Clone, Copy)]
enum Trigger {
    Poll,
    Local,
}

/// 每隔若干次定时轮次做一次全量扫描；本地触发的轮次不计数
struct RescanSchedule {
    every: u32,
    polls: u32,
}

impl RescanSchedule {
    fn new(every: u32) -> Self {
        Self { every, polls: 0 }
    }

    fn mode_for(&mut self, trigger: Trigger) -> PassMode {
        match trigger {
            Trigger::Poll => {
                self.polls = self.polls.wrapping_add(1);
                if self.every > 0 && self.polls % self.every == 0 {
                    PassMode::FullRescan
                } else {
                    PassMode::Incremental
                }
            }
            Trigger::Local => PassMode::Incremental,
        }
    }
}

struct Args {
    config_dir: Option<PathBuf>,
    once: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config_dir: None,
        once: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--once" => args.once = true,
            "--config" => {
                let dir = iter.next().context("--config 需要一个目录参数")?;
                args.config_dir = Some(PathBuf::from(dir));
            }
            other => anyhow::bail!("未知参数: {}", other),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    let config_dir = args
        .config_dir
        .or_else(dirs::config_dir)
        .unwrap_or_else(|| PathBuf::from(".drivesync"));
    let data_dir = dirs::data_dir().unwrap_or_else(|| config_dir.clone());
    let log_dir = dirs::log_dir().unwrap_or_else(|| data_dir.join("logs"));
    std::fs::create_dir_all(&config_dir)?;
    std::fs::create_dir_all(&log_dir)?;

    let config = AppConfig::load(&config_dir)?;
    let _log_guard = init_logging(&log_dir, &config.log);
    info!("配置目录: {:?}，数据目录: {:?}", config_dir, data_dir);

    let rules = FilterRules::from_config(&config.filter)?;
    let shutdown = CancellationToken::new();

    let mut engines = Vec::new();
    for drive in config.drives.iter().filter(|d| d.enabled) {
        let pool = open_drive_pool(&data_dir, &drive.id)
            .await
            .with_context(|| format!("打开状态库失败: {}", drive.id))?;
        let remote = create_remote(&drive.remote)
            .await
            .with_context(|| format!("连接远端失败: {}", drive.name))?;
        let engine = SyncEngine::new(
            &drive.id,
            &drive.local_root,
            Arc::new(pool),
            remote,
            rules.clone(),
            config.sync.clone(),
        )
        .with_cancel(shutdown.child_token());
        engines.push((Arc::new(engine), drive.local_root.clone()));
    }

    if engines.is_empty() {
        warn!("没有启用的驱动器，退出");
        return Ok(());
    }

    if args.once {
        for (engine, _) in &engines {
            let report = engine.run_pass(PassMode::Incremental, None).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        return Ok(());
    }

    let mut tasks = Vec::new();
    for (engine, root) in engines {
        tasks.push(tokio::spawn(run_drive(engine, root, shutdown.clone())));
    }

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，正在停止...");
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("已退出");
    Ok(())
}

/// 单个驱动器的同步循环：定时轮询，本地有变化时提前触发
async fn run_drive(engine: Arc<SyncEngine>, root: PathBuf, shutdown: CancellationToken) {
    let settings = engine.settings().clone();
    let mut watcher = if settings.watch_local {
        match LocalWatcher::new(&root) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("[{}] 无法监听本地目录，仅定时同步: {}", engine.drive_id(), e);
                None
            }
        }
    } else {
        None
    };

    let mut interval = tokio::time::interval(settings.poll_interval());
    let mut schedule = RescanSchedule::new(settings.full_scan_every_polls);

    loop {
        let trigger = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => Some(Trigger::Poll),
            batch = next_local_batch(&mut watcher) => batch.map(|paths| {
                debug!("[{}] 本地 {} 处变化，提前同步", engine.drive_id(), paths.len());
                Trigger::Local
            }),
        };
        let Some(trigger) = trigger else {
            warn!("[{}] 本地监听已停止", engine.drive_id());
            watcher = None;
            continue;
        };

        let mode = schedule.mode_for(trigger);

        if let Some(w) = &watcher {
            w.pause();
        }
        let result = engine.run_pass(mode, None).await;
        if let Some(w) = watcher.as_mut() {
            let dropped = w.resume(WATCH_SETTLE);
            if dropped > 0 {
                debug!("[{}] 忽略本轮自身写入的 {} 个事件", engine.drive_id(), dropped);
            }
        }

        match result {
            Ok(report) => debug!(
                "[{}] 本轮状态: {:?}，执行 {}，失败 {}",
                engine.drive_id(),
                report.status,
                report.applied,
                report.failed
            ),
            Err(SyncError::PassInProgress(_)) => debug!("[{}] 上一轮尚未结束，跳过", engine.drive_id()),
            Err(e) => error!("[{}] 同步失败: {}", engine.drive_id(), e),
        }
    }
}

async fn next_local_batch(watcher: &mut Option<LocalWatcher>) -> Option<Vec<PathBuf>> {
    match watcher {
        Some(w) => w.next_batch(WATCH_QUIET).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_triggers_do_not_advance_rescan_schedule() {
        let mut schedule = RescanSchedule::new(3);
        assert_eq!(schedule.mode_for(Trigger::Poll), PassMode::Incremental);
        for _ in 0..10 {
            assert_eq!(schedule.mode_for(Trigger::Local), PassMode::Incremental);
        }
        assert_eq!(schedule.mode_for(Trigger::Poll), PassMode::Incremental);
        assert_eq!(schedule.mode_for(Trigger::Poll), PassMode::FullRescan);
        assert_eq!(schedule.mode_for(Trigger::Poll), PassMode::Incremental);
    }

    #[test]
    fn test_zero_interval_never_rescans() {
        let mut schedule = RescanSchedule::new(0);
        for _ in 0..5 {
            assert_eq!(schedule.mode_for(Trigger::Poll), PassMode::Incremental);
        }
    }
}
