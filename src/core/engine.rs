//! 同步轮次编排
//!
//! 一轮：扫描本地与拉取远端变更（并发）→ 协调 → 安全检查 → 分发执行 → 提交游标。
//! 同一驱动器同时最多一轮；游标只在本轮全部决策都已落库后才推进。

use crate::config::SyncSettings;
use crate::core::conflict::ConflictLog;
use crate::core::decision::{Action, Decision, DecisionKind};
use crate::core::delta::DeltaProcessor;
use crate::core::dispatch::{DispatchOutcome, Dispatcher};
use crate::core::filter::FilterRules;
use crate::core::plan::Plan;
use crate::core::reconciler::{reconcile, ReconcileInput};
use crate::core::safety::{SafetyChecker, Violation};
use crate::core::scanner::LocalScanner;
use crate::core::state::StateStore;
use crate::core::transfer::{DriveTransfer, RetryPolicy};
use crate::db::{PassProgress, SqlitePool, SyncLogRow, SyncStatus};
use crate::error::{Result, SyncError};
use crate::remote::RemoteDrive;
use crate::storage::LocalFs;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 轮次模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    /// 从已保存的游标读取远端变更
    Incremental,
    /// 忽略游标，全量枚举远端
    FullRescan,
}

impl PassMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassMode::Incremental => "incremental",
            PassMode::FullRescan => "full_rescan",
        }
    }
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub pass_id: String,
    pub drive_id: String,
    pub mode: PassMode,
    pub start_time: i64,
    pub end_time: i64,
    pub status: SyncStatus,
    pub dry_run: bool,
    pub local_entries: u32,
    pub remote_changes: u32,
    /// 每个类别的决策数，合计等于决策总数
    pub counts: BTreeMap<DecisionKind, u32>,
    /// 本轮暂缓处理或被安全检查拦截的决策数
    pub held: u32,
    pub applied: u32,
    pub failed: u32,
    pub bytes_transferred: u64,
    pub cursor_advanced: bool,
    pub violations: Vec<String>,
    pub conflicts: u32,
    pub errors: Vec<String>,
    /// 本轮的全部决策
    #[serde(skip)]
    pub decisions: Vec<Decision>,
}

impl SyncReport {
    fn new(pass_id: &str, drive_id: &str, mode: PassMode, start_time: i64, status: SyncStatus) -> Self {
        Self {
            pass_id: pass_id.to_string(),
            drive_id: drive_id.to_string(),
            mode,
            start_time,
            end_time: chrono::Utc::now().timestamp(),
            status,
            dry_run: false,
            local_entries: 0,
            remote_changes: 0,
            counts: BTreeMap::new(),
            held: 0,
            applied: 0,
            failed: 0,
            bytes_transferred: 0,
            cursor_advanced: false,
            violations: Vec::new(),
            conflicts: 0,
            errors: Vec::new(),
            decisions: Vec::new(),
        }
    }

    /// 非 NoOp 的决策数
    pub fn pending_work(&self) -> u32 {
        self.counts
            .iter()
            .filter(|(kind, _)| **kind != DecisionKind::NoOp)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn count(&self, kind: DecisionKind) -> u32 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}

/// 单个驱动器的同步引擎
pub struct SyncEngine {
    drive_id: String,
    store: StateStore,
    conflict_log: ConflictLog,
    remote: Arc<dyn RemoteDrive>,
    local: Arc<LocalFs>,
    rules: Arc<FilterRules>,
    settings: SyncSettings,
    policy: RetryPolicy,
    safety: SafetyChecker,
    pass_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        drive_id: &str,
        local_root: impl Into<PathBuf>,
        db: Arc<SqlitePool>,
        remote: Arc<dyn RemoteDrive>,
        rules: FilterRules,
        settings: SyncSettings,
    ) -> Self {
        Self {
            drive_id: drive_id.to_string(),
            store: StateStore::new(db.clone(), drive_id, settings.tombstone_retention()),
            conflict_log: ConflictLog::new(db),
            remote,
            local: Arc::new(LocalFs::new(local_root)),
            rules: Arc::new(rules),
            policy: RetryPolicy::from_settings(&settings),
            safety: SafetyChecker::new(settings.safety()),
            settings,
            pass_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn drive_id(&self) -> &str {
        &self.drive_id
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn conflict_log(&self) -> &ConflictLog {
        &self.conflict_log
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// 更新同步设置，下一轮生效
    pub fn set_settings(&mut self, settings: SyncSettings) {
        self.policy = RetryPolicy::from_settings(&settings);
        self.safety = SafetyChecker::new(settings.safety());
        self.settings = settings;
    }

    /// 本轮是否正在运行
    pub fn is_busy(&self) -> bool {
        self.pass_lock.try_lock().is_err()
    }

    /// 取消当前及之后的轮次
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 运行一轮同步
    ///
    /// 已有一轮在运行时立即返回 `PassInProgress`。状态库写入失败返回错误，
    /// 其余失败体现在报告中。
    pub async fn run_pass(
        &self,
        mode: PassMode,
        progress_tx: Option<mpsc::Sender<PassProgress>>,
    ) -> Result<SyncReport> {
        let _guard = self
            .pass_lock
            .try_lock()
            .map_err(|_| SyncError::PassInProgress(self.drive_id.clone()))?;

        let start_time = chrono::Utc::now().timestamp();
        let pass_id = uuid::Uuid::new_v4().to_string();
        let safety = &self.safety;

        info!("[{}] 开始同步 ({})", self.drive_id, mode.as_str());

        self.send_progress(
            &progress_tx,
            PassProgress::new(&self.drive_id, SyncStatus::Scanning, "正在读取状态库...", start_time),
        )
        .await;

        let records = self.store.list_active().await?;
        let tombstones = self.store.tombstones(start_time).await?;
        let cursor = match mode {
            PassMode::Incremental => self.store.get_cursor().await?,
            PassMode::FullRescan => None,
        };

        if self.is_cancelled() {
            return Ok(self.create_cancelled_report(&pass_id, mode, start_time));
        }

        self.send_progress(
            &progress_tx,
            PassProgress::new(
                &self.drive_id,
                SyncStatus::Scanning,
                "正在扫描本地文件并读取远端变更...",
                start_time,
            ),
        )
        .await;

        // 扫描和拉取都只读状态库快照，可以并发
        let scanner = LocalScanner::new(self.rules.clone(), self.settings.hash_workers)
            .with_cancel(self.cancel.clone());
        let delta = DeltaProcessor::new(self.remote.clone(), self.rules.clone(), self.policy.clone())
            .with_cancel(self.cancel.clone());
        let (scan, changes) = tokio::join!(
            scanner.scan(self.local.root(), &records, &tombstones),
            delta.pull(cursor.as_deref(), &records)
        );

        let scan = match scan {
            Ok(s) => s,
            Err(e) => return self.abort_pass(&pass_id, mode, start_time, "本地扫描失败", e).await,
        };
        let changes = match changes {
            Ok(c) => c,
            Err(e) => return self.abort_pass(&pass_id, mode, start_time, "读取远端变更失败", e).await,
        };

        debug!(
            "[{}] 扫描完成: 本地 {} 个条目（计算指纹 {} 个），远端 {} 个变更（{} 页）",
            self.drive_id,
            scan.entries.len(),
            scan.hashed,
            changes.entries.len(),
            changes.pages
        );

        let mut progress = PassProgress::new(&self.drive_id, SyncStatus::Comparing, "正在比较差异...", start_time);
        progress.local_entries = scan.entries.len() as u32;
        progress.remote_changes = changes.entries.len() as u32;
        self.send_progress(&progress_tx, progress.clone()).await;

        let mut decisions = reconcile(&ReconcileInput {
            records: &records,
            tombstones: &tombstones,
            local: &scan,
            remote: &changes,
            strategy: self.settings.conflict_strategy,
            now: start_time,
        });

        // 安全检查
        let tracked = records.iter().filter(|r| r.synced.is_some()).count();
        let mut violations: Vec<Violation> = Vec::new();
        if let Some(v) = safety.check(&decisions, tracked) {
            violations.push(v);
        }
        if decisions.iter().any(|d| d.download_bytes() > 0) {
            match self.local.available_space() {
                Ok(available) => {
                    if let Some(v) = safety.check_free_space(&decisions, available) {
                        violations.push(v);
                    }
                }
                Err(e) => warn!("[{}] 无法获取本地可用空间: {}", self.drive_id, e),
            }
        }
        for violation in &violations {
            warn!("[{}] 安全检查拦截: {}", self.drive_id, violation);
            for decision in decisions.iter_mut() {
                if violation.category().covers(&decision.action) {
                    decision.action = Action::Defer {
                        reason: violation.to_string(),
                    };
                }
            }
        }

        let mut report = SyncReport::new(&pass_id, &self.drive_id, mode, start_time, SyncStatus::Completed);
        report.local_entries = scan.entries.len() as u32;
        report.remote_changes = changes.entries.len() as u32;
        report.violations = violations.iter().map(|v| v.to_string()).collect();
        for decision in &decisions {
            *report.counts.entry(decision.kind()).or_default() += 1;
        }
        let held: Vec<&Decision> = decisions
            .iter()
            .filter(|d| matches!(d.action, Action::Defer { .. }))
            .collect();
        report.held = held.len() as u32;
        let skipped_conflicts: Vec<_> = held.iter().filter_map(|d| d.conflict.clone()).collect();

        if self.settings.dry_run {
            info!(
                "[{}] 演练完成: {} 个决策，其中 {} 个需要执行",
                self.drive_id,
                decisions.len(),
                report.pending_work()
            );
            report.dry_run = true;
            report.decisions = decisions;
            report.end_time = chrono::Utc::now().timestamp();
            return Ok(report);
        }

        if self.is_cancelled() {
            return Ok(self.create_cancelled_report(&pass_id, mode, start_time));
        }

        // 分发执行
        let plan = Plan::build(decisions.clone());
        progress.status = SyncStatus::Syncing;
        progress.phase = format!("准备执行 {} 个操作...", plan.io_count());
        progress.decisions = plan.io_count() as u32;
        self.send_progress(&progress_tx, progress.clone()).await;

        let transfer = Arc::new(DriveTransfer::new(
            self.remote.clone(),
            self.local.clone(),
            self.policy.clone(),
            self.cancel.clone(),
        ));
        let dispatcher = Dispatcher::new(
            self.store.clone(),
            self.remote.clone(),
            self.local.clone(),
            transfer,
            self.rules.clone(),
            &self.settings,
            &self.cancel,
            start_time,
        )
        .with_policy(self.policy.clone());
        dispatcher.seed_folders(&records, &changes).await;

        let outcome = match dispatcher.run(plan, progress_tx.clone(), start_time).await {
            Ok(o) => o,
            Err(e) => {
                error!("[{}] 本轮中止: {}", self.drive_id, e);
                let status = if matches!(e, SyncError::Cancelled) {
                    SyncStatus::Cancelled
                } else {
                    SyncStatus::Failed
                };
                self.log_sync_result(&pass_id, mode, start_time, status, &report, &DispatchOutcome::default(), Some(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        // 两阶段提交：记录都已落库，再推进游标
        let cursor_ready = outcome.failed == 0
            && !outcome.cancelled
            && violations.is_empty()
            && held.is_empty()
            && changes.unresolved == 0;
        let mut cursor_advanced = false;
        if cursor_ready {
            if let Some(token) = &changes.new_cursor {
                self.store.set_cursor(token).await?;
                cursor_advanced = true;
            }
        } else {
            debug!(
                "[{}] 游标不推进: 失败 {}，暂缓 {}，拦截 {}，未解析 {}",
                self.drive_id,
                outcome.failed,
                held.len(),
                violations.len(),
                changes.unresolved
            );
        }

        self.store.purge_expired_tombstones(start_time).await?;

        for info in outcome.conflicts.iter().chain(&skipped_conflicts) {
            if let Err(e) = self.conflict_log.record(info).await {
                warn!("记录冲突失败: {}", e);
            }
        }

        report.status = if outcome.cancelled {
            SyncStatus::Cancelled
        } else if cursor_ready {
            SyncStatus::Completed
        } else {
            SyncStatus::Partial
        };
        report.applied = outcome.applied;
        report.failed = outcome.failed;
        report.bytes_transferred = outcome.bytes_transferred;
        report.cursor_advanced = cursor_advanced;
        report.conflicts = (outcome.conflicts.len() + skipped_conflicts.len()) as u32;
        report.errors = outcome.errors.clone();
        report.errors.extend(report.violations.iter().cloned());
        report.end_time = chrono::Utc::now().timestamp();
        report.decisions = decisions;

        let error_message = (!report.errors.is_empty()).then(|| report.errors.join("; "));
        self.log_sync_result(&pass_id, mode, start_time, report.status, &report, &outcome, error_message)
            .await;

        let mut done = PassProgress::new(&self.drive_id, report.status, "同步完成", start_time);
        done.local_entries = report.local_entries;
        done.remote_changes = report.remote_changes;
        done.decisions = report.decisions.len() as u32;
        done.completed = outcome.applied;
        done.failed = outcome.failed;
        done.bytes_transferred = outcome.bytes_transferred;
        self.send_progress(&progress_tx, done).await;

        info!(
            "[{}] 同步完成: 执行 {}，失败 {}，暂缓 {}，传输 {} 字节，游标{}",
            self.drive_id,
            outcome.applied,
            outcome.failed,
            report.held,
            outcome.bytes_transferred,
            if cursor_advanced { "已推进" } else { "未推进" }
        );

        Ok(report)
    }

    /// 最近的轮次记录
    pub async fn history(&self, limit: i64) -> Result<Vec<SyncLogRow>> {
        let rows = sqlx::query_as::<_, SyncLogRow>(
            "SELECT * FROM sync_logs ORDER BY start_time DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.store.db())
        .await?;
        Ok(rows)
    }

    /// 扫描或拉取失败：状态库错误向上返回，其余记为失败的一轮
    async fn abort_pass(
        &self,
        pass_id: &str,
        mode: PassMode,
        start_time: i64,
        context: &str,
        e: SyncError,
    ) -> Result<SyncReport> {
        match e {
            SyncError::Cancelled => Ok(self.create_cancelled_report(pass_id, mode, start_time)),
            e if e.is_fatal() => Err(e),
            e => {
                error!("[{}] {}: {}", self.drive_id, context, e);
                let report = self.create_failed_report(pass_id, mode, start_time, vec![format!("{}: {}", context, e)]);
                self.log_sync_result(
                    pass_id,
                    mode,
                    start_time,
                    SyncStatus::Failed,
                    &report,
                    &DispatchOutcome::default(),
                    Some(report.errors.join("; ")),
                )
                .await;
                Ok(report)
            }
        }
    }

    /// 发送进度更新
    async fn send_progress(&self, tx: &Option<mpsc::Sender<PassProgress>>, progress: PassProgress) {
        if let Some(tx) = tx {
            let _ = tx.send(progress).await;
        }
    }

    /// 创建失败报告
    fn create_failed_report(&self, pass_id: &str, mode: PassMode, start_time: i64, errors: Vec<String>) -> SyncReport {
        let mut report = SyncReport::new(pass_id, &self.drive_id, mode, start_time, SyncStatus::Failed);
        report.errors = errors;
        report
    }

    /// 创建取消报告
    fn create_cancelled_report(&self, pass_id: &str, mode: PassMode, start_time: i64) -> SyncReport {
        let mut report = SyncReport::new(pass_id, &self.drive_id, mode, start_time, SyncStatus::Cancelled);
        report.errors = vec!["同步已取消".to_string()];
        report
    }

    /// 记录本轮结果到数据库
    #[allow(clippy::too_many_arguments)]
    async fn log_sync_result(
        &self,
        pass_id: &str,
        mode: PassMode,
        start_time: i64,
        status: SyncStatus,
        report: &SyncReport,
        outcome: &DispatchOutcome,
        error_message: Option<String>,
    ) {
        let end_time = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"INSERT INTO sync_logs
               (pass_id, mode, start_time, end_time, status, decisions, applied, failed,
                bytes_transferred, cursor_advanced, error_message)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(pass_id)
        .bind(mode.as_str())
        .bind(start_time)
        .bind(end_time)
        .bind(status.as_str())
        .bind(report.counts.values().sum::<u32>() as i64)
        .bind(outcome.applied as i64)
        .bind(outcome.failed as i64)
        .bind(outcome.bytes_transferred as i64)
        .bind(report.cursor_advanced)
        .bind(error_message)
        .execute(self.store.db())
        .await;

        if let Err(e) = result {
            warn!("记录同步日志失败: {}", e);
        }
    }
}
