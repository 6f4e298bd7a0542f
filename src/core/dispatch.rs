//! 决策分发
//!
//! 按计划逐阶段把决策交给有界工作池执行：修改本地的决策走下载池，
//! 修改远端的走上传池，下载内容的指纹校验走哈希池。
//! 每个决策成功后立即写入状态库；失败的条目记下错误，留待下一轮。

use crate::config::SyncSettings;
use crate::core::conflict::ConflictInfo;
use crate::core::decision::{Action, Decision, Side};
use crate::core::delta::RemoteChanges;
use crate::core::filter::FilterRules;
use crate::core::fingerprint::fingerprint_bytes;
use crate::core::path;
use crate::core::plan::Plan;
use crate::core::scanner::LocalEntry;
use crate::core::state::{ItemRecord, StateStore};
use crate::core::transfer::{with_retry, RetryPolicy, Transfer};
use crate::db::{PassProgress, SyncStatus};
use crate::error::{RemoteError, Result, SyncError};
use crate::remote::RemoteDrive;
use crate::storage::LocalFs;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 传输统计
#[derive(Debug, Default)]
struct TransferStats {
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_transferred: AtomicU64,
}

/// 分发结果
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub applied: u32,
    pub failed: u32,
    pub bytes_transferred: u64,
    pub errors: Vec<String>,
    /// 实际按冲突处理的条目
    pub conflicts: Vec<ConflictInfo>,
    pub cancelled: bool,
}

struct DispatchContext {
    store: StateStore,
    remote: Arc<dyn RemoteDrive>,
    local: Arc<LocalFs>,
    transfer: Arc<dyn Transfer>,
    rules: Arc<FilterRules>,
    policy: RetryPolicy,
    now: i64,
    cancel: CancellationToken,
    /// 外部取消或致命错误时停止派发
    halt: CancellationToken,
    upload_pool: Arc<Semaphore>,
    download_pool: Arc<Semaphore>,
    hash_pool: Arc<Semaphore>,
    stats: TransferStats,
    errors: RwLock<Vec<String>>,
    conflicts: RwLock<Vec<ConflictInfo>>,
    /// 路径 -> 远端目录 ID
    folder_ids: RwLock<HashMap<String, String>>,
    /// 本轮已完成的本地目录移动（旧路径, 新路径）
    local_moves: RwLock<Vec<(String, String)>>,
    failed_paths: RwLock<HashSet<String>>,
    fatal: Mutex<Option<SyncError>>,
}

/// 决策分发器，每轮一个
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StateStore,
        remote: Arc<dyn RemoteDrive>,
        local: Arc<LocalFs>,
        transfer: Arc<dyn Transfer>,
        rules: Arc<FilterRules>,
        settings: &SyncSettings,
        cancel: &CancellationToken,
        now: i64,
    ) -> Self {
        Self {
            ctx: Arc::new(DispatchContext {
                store,
                remote,
                local,
                transfer,
                rules,
                policy: RetryPolicy::from_settings(settings),
                now,
                cancel: cancel.clone(),
                halt: cancel.child_token(),
                upload_pool: Arc::new(Semaphore::new(settings.upload_workers.max(1))),
                download_pool: Arc::new(Semaphore::new(settings.download_workers.max(1))),
                hash_pool: Arc::new(Semaphore::new(settings.hash_workers.max(1))),
                stats: TransferStats::default(),
                errors: RwLock::new(Vec::new()),
                conflicts: RwLock::new(Vec::new()),
                folder_ids: RwLock::new(HashMap::new()),
                local_moves: RwLock::new(Vec::new()),
                failed_paths: RwLock::new(HashSet::new()),
                fatal: Mutex::new(None),
            }),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.policy = policy;
        }
        self
    }

    /// 建立路径到远端目录 ID 的索引：先取记录，再用本轮远端变更覆盖
    pub async fn seed_folders(&self, records: &[ItemRecord], changes: &RemoteChanges) {
        let mut ids = self.ctx.folder_ids.write().await;
        for record in records.iter().filter(|r| r.is_folder && r.synced.is_some()) {
            if let Some(id) = &record.remote_id {
                ids.insert(record.path.clone(), id.clone());
            }
        }
        for entry in changes.entries.iter().filter(|e| e.is_folder) {
            if entry.deleted {
                ids.remove(&entry.path);
            } else {
                ids.insert(entry.path.clone(), entry.id.clone());
            }
        }
    }

    /// 执行计划
    ///
    /// 阶段之间严格串行；状态库写入失败时中止并返回错误。
    pub async fn run(
        &self,
        plan: Plan,
        progress: Option<mpsc::Sender<PassProgress>>,
        start_time: i64,
    ) -> Result<DispatchOutcome> {
        let total = plan.io_count() as u64;
        let ticker = self.spawn_progress(progress, total, start_time);

        let Plan {
            clearing,
            stages,
            deletes,
            state_only,
        } = plan;

        for stage in clearing.into_iter().chain(stages).chain(deletes) {
            if self.ctx.halt.is_cancelled() {
                break;
            }
            self.run_stage(stage).await;
        }

        if !self.ctx.halt.is_cancelled() {
            for decision in state_only {
                self.ctx.execute(decision).await;
                if self.ctx.halt.is_cancelled() {
                    break;
                }
            }
        }

        if let Some(handle) = ticker {
            handle.abort();
        }

        if let Some(e) = self.ctx.fatal.lock().await.take() {
            return Err(e);
        }

        let stats = &self.ctx.stats;
        Ok(DispatchOutcome {
            applied: stats.completed.load(Ordering::Relaxed) as u32,
            failed: stats.failed.load(Ordering::Relaxed) as u32,
            bytes_transferred: stats.bytes_transferred.load(Ordering::Relaxed),
            errors: self.ctx.errors.read().await.clone(),
            conflicts: self.ctx.conflicts.read().await.clone(),
            cancelled: self.ctx.cancel.is_cancelled(),
        })
    }

    async fn run_stage(&self, stage: Vec<Decision>) {
        // 本地移动串行执行，后面的移动能看到前面目录移动后的路径
        let (serial, parallel): (Vec<Decision>, Vec<Decision>) = stage.into_iter().partition(|d| {
            matches!(
                d.action,
                Action::Move {
                    side: Side::Local,
                    ..
                }
            )
        });

        for decision in serial {
            if self.ctx.halt.is_cancelled() {
                return;
            }
            self.ctx.execute(decision).await;
        }

        let mut handles = Vec::new();
        for decision in parallel {
            if self.ctx.halt.is_cancelled() {
                break;
            }

            let pool = if decision.action.mutates_local() {
                self.ctx.download_pool.clone()
            } else {
                self.ctx.upload_pool.clone()
            };
            let Ok(permit) = pool.acquire_owned().await else {
                break;
            };
            let ctx = self.ctx.clone();

            let handle = tokio::spawn(async move {
                ctx.execute(decision).await;
                drop(permit);
            });
            handles.push(handle);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("同步任务异常退出: {}", e);
                self.ctx.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.ctx.errors.write().await.push(format!("task aborted: {}", e));
            }
        }
    }

    fn spawn_progress(
        &self,
        progress: Option<mpsc::Sender<PassProgress>>,
        total: u64,
        start_time: i64,
    ) -> Option<JoinHandle<()>> {
        let tx = progress?;
        let ctx = self.ctx.clone();

        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;

                let completed = ctx.stats.completed.load(Ordering::Relaxed);
                let failed = ctx.stats.failed.load(Ordering::Relaxed);
                let mut update = PassProgress::new(
                    ctx.store.drive_id(),
                    SyncStatus::Syncing,
                    format!("同步中 {}/{}", completed + failed, total),
                    start_time,
                );
                update.decisions = total as u32;
                update.completed = completed as u32;
                update.failed = failed as u32;
                update.bytes_transferred = ctx.stats.bytes_transferred.load(Ordering::Relaxed);

                if tx.send(update).await.is_err() || completed + failed >= total {
                    break;
                }
            }
        }))
    }
}

impl DispatchContext {
    async fn execute(&self, decision: Decision) {
        if self.halt.is_cancelled() {
            return;
        }

        if let Some(ancestor) = self.failed_ancestor(&decision.path).await {
            let reason = format!("parent folder {} was not synced", ancestor);
            self.fail(&decision, SyncError::transfer(&decision.path, reason)).await;
            return;
        }

        match self.apply(&decision).await {
            Ok(counted) => {
                if counted {
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(info) = &decision.conflict {
                    if matches!(decision.action, Action::Upload { .. } | Action::Download { .. }) {
                        self.conflicts.write().await.push(info.clone());
                    }
                }
            }
            Err(e) => self.fail(&decision, e).await,
        }
    }

    async fn failed_ancestor(&self, rel_path: &str) -> Option<String> {
        let failed = self.failed_paths.read().await;
        if failed.is_empty() {
            return None;
        }
        path::ancestors(rel_path)
            .find(|a| failed.contains(*a))
            .map(str::to_string)
    }

    async fn fail(&self, decision: &Decision, err: SyncError) {
        match err {
            SyncError::Cancelled => {
                debug!("已取消: {}", decision.path);
            }
            e if e.is_fatal() => {
                error!("[{}] 状态库写入失败，中止本轮: {}", self.store.drive_id(), e);
                self.fatal.lock().await.get_or_insert(e);
                self.halt.cancel();
            }
            e => {
                warn!("[{}] {} 未能同步: {}", self.store.drive_id(), decision.path, e);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.errors.write().await.push(e.to_string());
                self.failed_paths.write().await.insert(decision.path.clone());

                let recorded = self
                    .store
                    .record_failure(
                        decision.key.as_deref(),
                        &decision.path,
                        decision.is_folder,
                        &e.to_string(),
                        self.now,
                    )
                    .await;
                if let Err(store_err) = recorded {
                    error!("记录失败状态出错: {}", store_err);
                    self.fatal.lock().await.get_or_insert(store_err);
                    self.halt.cancel();
                }
            }
        }
    }

    /// 执行单个决策；返回值表示是否计入已执行数
    async fn apply(&self, decision: &Decision) -> Result<bool> {
        let rel = decision.path.as_str();

        let bytes = match &decision.action {
            Action::NoOp | Action::Defer { .. } => return Ok(false),
            Action::Refresh => {
                if let Some(record) = self.refreshed_record(decision) {
                    self.commit(decision, &record).await?;
                }
                return Ok(true);
            }
            Action::Forget => {
                self.forget(decision).await?;
                return Ok(true);
            }
            Action::Upload {
                existing_id,
                move_from,
            } => self.upload(decision, existing_id.as_deref(), move_from.as_deref()).await?,
            Action::Download {
                remote_id,
                move_from,
            } => self.download(decision, remote_id, move_from.as_deref()).await?,
            Action::DeleteLocal => {
                self.delete_local(decision).await?;
                0
            }
            Action::DeleteRemote { remote_id } => {
                let outcome = with_retry(&self.policy, "delete", &self.halt, || {
                    self.remote.delete(remote_id)
                })
                .await;
                match outcome {
                    Ok(()) => {}
                    Err(SyncError::Remote(RemoteError::NotFound(_))) => {
                        debug!("远端条目已不存在: {}", rel);
                    }
                    Err(e) => return Err(e),
                }
                self.forget(decision).await?;
                0
            }
            Action::CreateLocalFolder { remote_id } => {
                let meta = self.local.create_dir(rel).await?;
                self.folder_ids
                    .write()
                    .await
                    .insert(rel.to_string(), remote_id.clone());
                let (parent, version, remote_mtime) = remote_meta(decision);
                let record = ItemRecord::converged(
                    remote_id,
                    parent.as_deref(),
                    rel,
                    true,
                    None,
                    0,
                    meta.mtime,
                    version,
                    remote_mtime,
                    self.now,
                );
                self.commit(decision, &record).await?;
                0
            }
            Action::CreateRemoteFolder => {
                let parent_id = self.parent_id(rel).await?;
                let name = path::file_name(rel);
                let item = with_retry(&self.policy, "create_folder", &self.halt, || {
                    self.remote.create_folder(&parent_id, name)
                })
                .await?;
                self.folder_ids
                    .write()
                    .await
                    .insert(rel.to_string(), item.id.clone());
                let local_mtime = self.local.stat(rel).await?.map_or(0, |m| m.mtime);
                let record = ItemRecord::converged(
                    &item.id,
                    item.parent_id.as_deref(),
                    rel,
                    true,
                    None,
                    0,
                    local_mtime,
                    item.version.clone(),
                    item.mtime,
                    self.now,
                );
                self.commit(decision, &record).await?;
                0
            }
            Action::Move {
                side,
                from,
                remote_id,
            } => {
                self.move_item(decision, *side, from, remote_id).await?;
                0
            }
            Action::ConflictDuplicate {
                remote_id,
                local_path,
                renamed_to,
            } => self.duplicate(decision, remote_id, local_path, renamed_to).await?,
        };

        self.stats.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        debug!("{:?} 完成: {}", decision.kind(), rel);
        Ok(true)
    }

    async fn commit(&self, decision: &Decision, record: &ItemRecord) -> Result<()> {
        self.store.commit_item(decision.key.as_deref(), record).await
    }

    /// 删除后给记录打墓碑；从未同步过的记录直接删除
    async fn forget(&self, decision: &Decision) -> Result<()> {
        let Some(key) = decision.key.as_deref() else {
            return Ok(());
        };
        let tracked = decision
            .record
            .as_ref()
            .is_some_and(|r| r.synced.is_some() && !r.is_path_keyed());
        if tracked {
            self.store.mark_tombstone(key, self.now).await?;
        } else {
            self.store.delete(key).await?;
        }
        Ok(())
    }

    /// 经过本轮已完成的目录移动后，本地条目当前所在的路径
    async fn local_path(&self, rel_path: &str) -> String {
        let moves = self.local_moves.read().await;
        let mut current = rel_path.to_string();
        for (old, new) in moves.iter() {
            if let Some(rebased) = path::rebase(&current, old, new) {
                current = rebased;
            }
        }
        current
    }

    async fn parent_id(&self, rel_path: &str) -> Result<String> {
        let parent = path::parent(rel_path);
        if parent.is_empty() {
            return Ok(self.remote.root_id().to_string());
        }
        self.folder_ids
            .read()
            .await
            .get(parent)
            .cloned()
            .ok_or_else(|| SyncError::transfer(rel_path, format!("remote folder {} is unknown", parent)))
    }

    /// 执行前确认本地条目与扫描时一致，避免覆盖扫描之后的修改
    async fn ensure_unchanged(&self, rel_path: &str, scanned: Option<&LocalEntry>) -> Result<()> {
        let current = self.local.stat(rel_path).await?;
        match (current, scanned) {
            (None, None) => Ok(()),
            (Some(meta), Some(entry))
                if meta.is_dir == entry.is_folder
                    && (entry.is_folder || (meta.size == entry.size && meta.mtime == entry.mtime)) =>
            {
                Ok(())
            }
            (None, Some(_)) => Err(SyncError::transfer(rel_path, "local item disappeared since scan")),
            _ => Err(SyncError::transfer(rel_path, "local item changed since scan")),
        }
    }

    /// 在哈希池中计算下载内容的指纹，远端提供哈希时校验
    async fn verify(&self, rel_path: &str, data: Vec<u8>, expected: Option<&str>) -> Result<(Vec<u8>, String)> {
        let _permit = self
            .hash_pool
            .acquire()
            .await
            .map_err(|e| SyncError::transfer(rel_path, e))?;
        let (data, fingerprint) = tokio::task::spawn_blocking(move || {
            let fingerprint = fingerprint_bytes(&data);
            (data, fingerprint)
        })
        .await
        .map_err(|e| SyncError::transfer(rel_path, e))?;

        if let Some(expected) = expected {
            if expected != fingerprint {
                return Err(SyncError::transfer(rel_path, "content hash mismatch after download"));
            }
        }
        Ok((data, fingerprint))
    }

    async fn upload(&self, decision: &Decision, existing_id: Option<&str>, move_from: Option<&str>) -> Result<u64> {
        let rel = decision.path.as_str();
        if let Some(from) = move_from {
            let from = self.local_path(from).await;
            self.local.rename(&from, rel).await?;
        }

        let parent_id = self.parent_id(rel).await?;
        let uploaded = self
            .transfer
            .upload(rel, &parent_id, path::file_name(rel), existing_id)
            .await?;

        let record = ItemRecord::converged(
            &uploaded.item.id,
            uploaded.item.parent_id.as_deref(),
            rel,
            false,
            Some(uploaded.fingerprint.clone()),
            uploaded.local.size,
            uploaded.local.mtime,
            uploaded.item.version.clone(),
            uploaded.item.mtime,
            self.now,
        );
        self.commit(decision, &record).await?;
        Ok(uploaded.local.size)
    }

    async fn download(&self, decision: &Decision, remote_id: &str, move_from: Option<&str>) -> Result<u64> {
        let rel = decision.path.as_str();
        let old_path = match move_from {
            Some(from) => {
                let from = self.local_path(from).await;
                self.ensure_unchanged(&from, decision.local.as_ref()).await?;
                self.ensure_unchanged(rel, None).await?;
                Some(from)
            }
            None => {
                self.ensure_unchanged(rel, decision.local.as_ref()).await?;
                None
            }
        };

        let expected = decision.remote.as_ref().and_then(|r| r.content_hash.clone());
        let data = self.transfer.fetch(remote_id, rel).await?;
        let (data, fingerprint) = self.verify(rel, data, expected.as_deref()).await?;
        let meta = self.local.write_atomic(rel, &data).await?;
        if let Some(old) = old_path.filter(|p| p != rel) {
            self.local.remove_file(&old).await?;
        }

        let (parent, version, remote_mtime) = remote_meta(decision);
        let record = ItemRecord::converged(
            remote_id,
            parent.as_deref(),
            rel,
            false,
            Some(fingerprint),
            meta.size,
            meta.mtime,
            version,
            remote_mtime,
            self.now,
        );
        self.commit(decision, &record).await?;
        Ok(meta.size)
    }

    async fn delete_local(&self, decision: &Decision) -> Result<()> {
        let rel = self.local_path(&decision.path).await;
        match &decision.local {
            // 本轮没有看到本地内容（被过滤或读取失败），不碰本地
            None => debug!("本地未扫描到，只更新记录: {}", rel),
            Some(_) if decision.is_folder => self.local.remove_dir(&rel, &self.rules).await?,
            Some(entry) => {
                self.ensure_unchanged(&rel, Some(entry)).await?;
                self.local.remove_file(&rel).await?;
            }
        }
        self.forget(decision).await
    }

    async fn move_item(&self, decision: &Decision, side: Side, from: &str, remote_id: &str) -> Result<()> {
        let rel = decision.path.as_str();
        let from = self.local_path(from).await;

        let (remote_id, parent, version, remote_mtime) = match side {
            Side::Local => {
                self.local.rename(&from, rel).await?;
                let (parent, version, remote_mtime) = remote_meta(decision);
                (remote_id.to_string(), parent, version, remote_mtime)
            }
            Side::Remote => {
                let parent_id = self.parent_id(rel).await?;
                let item = with_retry(&self.policy, "move", &self.halt, || {
                    self.remote.move_item(remote_id, &parent_id, path::file_name(rel))
                })
                .await?;
                (item.id, item.parent_id, item.version, item.mtime)
            }
        };

        if decision.is_folder {
            if side == Side::Local {
                self.local_moves.write().await.push((from.clone(), rel.to_string()));
            }
            let rewritten = self.store.rewrite_subtree(&from, rel).await?;
            let mut ids = self.folder_ids.write().await;
            let moved: Vec<(String, String)> = ids
                .iter()
                .filter_map(|(p, id)| path::rebase(p, &from, rel).map(|np| (np, id.clone())))
                .collect();
            ids.retain(|p, _| p != &from && !path::is_within(p, &from));
            ids.extend(moved);
            ids.insert(rel.to_string(), remote_id.clone());
            debug!("目录移动 {} -> {}，改写 {} 条子记录", from, rel, rewritten);
        }

        let meta = self
            .local
            .stat(rel)
            .await?
            .ok_or_else(|| SyncError::transfer(rel, "local item disappeared after move"))?;
        let fingerprint = if decision.is_folder {
            None
        } else {
            decision
                .local
                .as_ref()
                .and_then(|l| l.fingerprint.clone())
                .or_else(|| {
                    decision
                        .record
                        .as_ref()
                        .and_then(|r| r.synced.as_ref())
                        .and_then(|s| s.fingerprint.clone())
                })
        };

        let record = ItemRecord::converged(
            &remote_id,
            parent.as_deref(),
            rel,
            decision.is_folder,
            fingerprint,
            meta.size,
            meta.mtime,
            version,
            remote_mtime,
            self.now,
        );
        self.commit(decision, &record).await
    }

    /// 保留两端版本：远端版本写入规范路径，本地版本改名后作为新条目上传
    async fn duplicate(
        &self,
        decision: &Decision,
        remote_id: &str,
        local_path: &str,
        renamed_to: &str,
    ) -> Result<u64> {
        let rel = decision.path.as_str();
        let local_path = self.local_path(local_path).await;
        self.ensure_unchanged(&local_path, decision.local.as_ref()).await?;

        let expected = decision.remote.as_ref().and_then(|r| r.content_hash.clone());
        let data = self.transfer.fetch(remote_id, rel).await?;
        let (data, fingerprint) = self.verify(rel, data, expected.as_deref()).await?;
        let (parent, version, remote_mtime) = remote_meta(decision);

        let local_fingerprint = decision.local.as_ref().and_then(|l| l.fingerprint.as_deref());
        if local_fingerprint == Some(fingerprint.as_str()) {
            // 内容其实相同，不需要副本
            if local_path != rel {
                self.local.rename(&local_path, rel).await?;
            }
            let meta = self
                .local
                .stat(rel)
                .await?
                .ok_or_else(|| SyncError::transfer(rel, "local file disappeared"))?;
            let record = ItemRecord::converged(
                remote_id,
                parent.as_deref(),
                rel,
                false,
                Some(fingerprint),
                meta.size,
                meta.mtime,
                version,
                remote_mtime,
                self.now,
            );
            self.commit(decision, &record).await?;
            return Ok(0);
        }

        if local_path != rel {
            self.ensure_unchanged(rel, None).await?;
        }
        self.local.rename(&local_path, renamed_to).await?;
        let meta = self.local.write_atomic(rel, &data).await?;
        let record = ItemRecord::converged(
            remote_id,
            parent.as_deref(),
            rel,
            false,
            Some(fingerprint),
            meta.size,
            meta.mtime,
            version,
            remote_mtime,
            self.now,
        );
        self.commit(decision, &record).await?;

        let parent_id = self.parent_id(renamed_to).await?;
        let uploaded = self
            .transfer
            .upload(renamed_to, &parent_id, path::file_name(renamed_to), None)
            .await?;
        let copy = ItemRecord::converged(
            &uploaded.item.id,
            uploaded.item.parent_id.as_deref(),
            renamed_to,
            false,
            Some(uploaded.fingerprint.clone()),
            uploaded.local.size,
            uploaded.local.mtime,
            uploaded.item.version.clone(),
            uploaded.item.mtime,
            self.now,
        );
        self.store.commit_item(None, &copy).await?;

        info!("冲突已处理: {} (本地版本保存为 {})", rel, renamed_to);
        let conflict = decision.conflict.clone().unwrap_or_else(|| ConflictInfo {
            path: rel.to_string(),
            strategy: crate::core::conflict::ConflictStrategy::KeepBoth,
            renamed_to: Some(renamed_to.to_string()),
            local_fingerprint: decision.local.as_ref().and_then(|l| l.fingerprint.clone()),
            remote_fingerprint: expected,
            local_time: decision.local.as_ref().map_or(0, |l| l.mtime / 1_000_000_000),
            remote_time: remote_mtime,
        });
        self.conflicts.write().await.push(conflict);

        Ok(meta.size + uploaded.local.size)
    }

    /// 两端已一致时的新记录
    fn refreshed_record(&self, decision: &Decision) -> Option<ItemRecord> {
        let remote = decision.remote.as_ref().filter(|r| !r.deleted);
        let prev = decision.record.as_ref();
        let snap = prev.and_then(|r| r.synced.as_ref());
        let local = decision.local.as_ref();

        let remote_id = remote
            .map(|r| r.id.clone())
            .or_else(|| prev.and_then(|r| r.remote_id.clone()))?;
        let fingerprint = if decision.is_folder {
            None
        } else {
            local
                .and_then(|l| l.fingerprint.clone())
                .or_else(|| remote.and_then(|r| r.content_hash.clone()))
                .or_else(|| snap.and_then(|s| s.fingerprint.clone()))
        };
        let size = local
            .map(|l| l.size)
            .or_else(|| remote.map(|r| r.size))
            .or_else(|| snap.map(|s| s.size))
            .unwrap_or(0);
        let local_mtime = local
            .map(|l| l.mtime)
            .or_else(|| snap.map(|s| s.local_mtime))
            .unwrap_or(0);
        let (parent, version, remote_mtime) = remote_meta(decision);

        Some(ItemRecord::converged(
            &remote_id,
            parent.as_deref(),
            &decision.path,
            decision.is_folder,
            fingerprint,
            size,
            local_mtime,
            version,
            remote_mtime,
            self.now,
        ))
    }
}

/// 远端父目录、版本、修改时间：优先取本轮远端变更，其次取记录
fn remote_meta(decision: &Decision) -> (Option<String>, Option<String>, i64) {
    match (&decision.remote, &decision.record) {
        (Some(r), _) if !r.deleted => (r.parent_id.clone(), r.version.clone(), r.mtime),
        (_, Some(record)) => (
            record.parent_remote_id.clone(),
            record.remote_version.clone(),
            record.remote_mtime,
        ),
        _ => (None, None, 0),
    }
}
