//! 本地文件变化监听
//!
//! 只用来提前触发下一轮同步，不参与决策；错过的事件由定时轮次兜底。
//! 同步进行期间本地的写入来自引擎自己，这些事件被静音丢弃。

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 写入过程中的临时文件后缀
const PARTIAL_SUFFIX: &str = ".partial";

/// 静音状态：同步期间，以及结束后的一小段余量内
#[derive(Debug, Default)]
struct Mute {
    paused: bool,
    until: Option<Instant>,
}

impl Mute {
    fn blocks(&self, now: Instant) -> bool {
        self.paused || self.until.is_some_and(|t| now < t)
    }
}

/// 在监听线程里过滤事件并转发
struct Forwarder {
    tx: mpsc::UnboundedSender<PathBuf>,
    mute: Arc<Mutex<Mute>>,
}

impl Forwarder {
    fn forward(&self, event: notify::Event) {
        if !is_relevant(&event.kind) {
            return;
        }
        let muted = self
            .mute
            .lock()
            .map(|m| m.blocks(Instant::now()))
            .unwrap_or(false);
        if muted {
            return;
        }
        for path in event.paths {
            if is_partial(&path) {
                continue;
            }
            let _ = self.tx.send(path);
        }
    }
}

/// 本地目录监听器，drop 时停止监听
pub struct LocalWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<PathBuf>,
    mute: Arc<Mutex<Mute>>,
}

impl LocalWatcher {
    pub fn new(root: &Path) -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mute = Arc::new(Mutex::new(Mute::default()));
        let forwarder = Forwarder {
            tx,
            mute: mute.clone(),
        };
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => forwarder.forward(event),
            Err(e) => warn!("监听本地目录出错: {}", e),
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        debug!("开始监听本地目录: {:?}", root);

        Ok(Self {
            _watcher: watcher,
            rx,
            mute,
        })
    }

    /// 同步开始：之后的事件都是引擎自己的写入
    pub fn pause(&self) {
        if let Ok(mut mute) = self.mute.lock() {
            mute.paused = true;
        }
    }

    /// 同步结束：继续静音 `settle` 以吸收迟到的事件，并丢弃已排队的事件
    ///
    /// 返回丢弃的事件数。
    pub fn resume(&mut self, settle: Duration) -> usize {
        if let Ok(mut mute) = self.mute.lock() {
            mute.paused = false;
            mute.until = Some(Instant::now() + settle);
        }
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// 等待一批变化
    ///
    /// 收到第一个事件后继续收集，直到 `quiet` 时间内没有新事件。
    /// 监听器已停止时返回 None。
    pub async fn next_batch(&mut self, quiet: Duration) -> Option<Vec<PathBuf>> {
        let first = self.rx.recv().await?;
        let mut batch = vec![first];
        loop {
            match tokio::time::timeout(quiet, self.rx.recv()).await {
                Ok(Some(path)) => batch.push(path),
                Ok(None) | Err(_) => break,
            }
        }
        batch.sort();
        batch.dedup();
        Some(batch)
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
}
