//! 协调器
//!
//! 把状态库记录、本地扫描结果和远端变更合成为每个条目恰好一个决策。
//! 整个过程是纯函数：不做 IO，同样的输入总是得到同样的输出。
//!
//! 路径冲突时远端总是占用规范路径，本地版本改名；不比较时间戳。

use crate::core::conflict::{unique_conflict_name, ConflictInfo, ConflictStrategy};
use crate::core::decision::{decide, Action, Decision, Side, Signal, Verdict};
use crate::core::delta::{RemoteChanges, RemoteEntry};
use crate::core::path;
use crate::core::scanner::{FolderState, LocalEntry, LocalScan};
use crate::core::state::{ItemRecord, SyncedSnapshot, Tombstone};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// 一轮协调的全部输入
#[derive(Debug, Clone, Copy)]
pub struct ReconcileInput<'a> {
    /// 未打墓碑的记录
    pub records: &'a [ItemRecord],
    pub tombstones: &'a [Tombstone],
    pub local: &'a LocalScan,
    pub remote: &'a RemoteChanges,
    pub strategy: ConflictStrategy,
    pub now: i64,
}

/// 生成决策列表，按路径排序
pub fn reconcile(input: &ReconcileInput<'_>) -> Vec<Decision> {
    let mut reconciler = Reconciler::new(input);
    reconciler.run();
    let mut decisions = reconciler.decisions;
    rescue_orphans(&mut decisions);
    decisions.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.key.cmp(&b.key)));
    decisions
}

struct Reconciler<'a> {
    input: &'a ReconcileInput<'a>,
    synced: Vec<&'a ItemRecord>,
    synced_ids: HashSet<&'a str>,
    synced_paths: HashSet<&'a str>,
    pending_by_id: HashMap<&'a str, &'a ItemRecord>,
    pending_by_path: HashMap<&'a str, &'a ItemRecord>,
    remote_by_id: HashMap<&'a str, &'a RemoteEntry>,
    remote_paths: HashSet<&'a str>,
    stone_by_id: HashMap<&'a str, &'a Tombstone>,
    stone_by_path: HashMap<&'a str, &'a Tombstone>,
    missing: HashSet<&'a str>,
    /// 远端移动过的已跟踪目录（旧路径, 新路径），深的在前
    folder_moves: Vec<(&'a str, &'a str)>,
    /// 远端已删除的已跟踪目录
    deleted_folders: Vec<&'a str>,
    /// 记录键 -> 远端以新 ID 重建的同一条目
    reassigned: HashMap<&'a str, &'a RemoteEntry>,
    /// 记录键 -> 本地移动后的新路径
    local_moves: HashMap<&'a str, &'a str>,
    claimed_local: HashSet<&'a str>,
    claimed_remote: HashSet<&'a str>,
    consumed_pending: HashSet<&'a str>,
    /// 已跟踪条目在本轮的目标路径
    record_targets: HashSet<String>,
    /// 已跟踪条目本轮删除或遗忘后让出的路径
    released: HashMap<&'a str, &'a ItemRecord>,
    /// 本地换了类型但暂不处理的记录路径，其下的新条目一并等待
    kind_held: Vec<&'a str>,
    reserved: HashSet<String>,
    decisions: Vec<Decision>,
}

impl<'a> Reconciler<'a> {
    fn new(input: &'a ReconcileInput<'a>) -> Self {
        let synced: Vec<&ItemRecord> = input.records.iter().filter(|r| r.synced.is_some()).collect();
        let synced_ids = synced
            .iter()
            .filter_map(|r| r.remote_id.as_deref())
            .collect();
        let synced_paths = synced.iter().map(|r| r.path.as_str()).collect();

        let mut pending_by_id = HashMap::new();
        let mut pending_by_path = HashMap::new();
        for record in input.records.iter().filter(|r| r.synced.is_none()) {
            if let Some(id) = record.remote_id.as_deref() {
                pending_by_id.insert(id, record);
            }
            pending_by_path.insert(record.path.as_str(), record);
        }

        let remote_by_id: HashMap<&str, &RemoteEntry> = input
            .remote
            .entries
            .iter()
            .map(|e| (e.id.as_str(), e))
            .collect();
        let remote_paths = input
            .remote
            .entries
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.path.as_str())
            .collect();

        let mut folder_moves = Vec::new();
        let mut deleted_folders = Vec::new();
        for record in synced.iter().filter(|r| r.is_folder) {
            let Some(entry) = record.remote_id.as_deref().and_then(|id| remote_by_id.get(id)) else {
                continue;
            };
            if entry.deleted {
                deleted_folders.push(record.path.as_str());
            } else if entry.path != record.path {
                folder_moves.push((record.path.as_str(), entry.path.as_str()));
            }
        }
        folder_moves.sort_by_key(|(old, _)| std::cmp::Reverse(path::depth(old)));

        Self {
            input,
            synced,
            synced_ids,
            synced_paths,
            pending_by_id,
            pending_by_path,
            remote_by_id,
            remote_paths,
            stone_by_id: input
                .tombstones
                .iter()
                .filter_map(|t| t.remote_id.as_deref().map(|id| (id, t)))
                .collect(),
            stone_by_path: input.tombstones.iter().map(|t| (t.path.as_str(), t)).collect(),
            missing: input.local.missing.iter().map(|m| m.key.as_str()).collect(),
            folder_moves,
            deleted_folders,
            reassigned: HashMap::new(),
            local_moves: HashMap::new(),
            claimed_local: HashSet::new(),
            claimed_remote: HashSet::new(),
            consumed_pending: HashSet::new(),
            record_targets: HashSet::new(),
            released: HashMap::new(),
            kind_held: Vec::new(),
            reserved: HashSet::new(),
            decisions: Vec::new(),
        }
    }

    fn run(&mut self) {
        self.pair_recreated_items();
        self.detect_local_moves();

        let synced = self.synced.clone();
        for record in synced {
            let decision = self.record_decision(record);
            let gives_up = decision.path == record.path
                && matches!(
                    decision.action,
                    Action::DeleteLocal | Action::DeleteRemote { .. } | Action::Forget
                );
            if gives_up {
                self.released.insert(record.path.as_str(), record);
            } else {
                self.record_targets.insert(decision.path.clone());
            }
            self.decisions.push(decision);
        }

        self.untracked_remote();
        self.untracked_local();
        self.forget_stale_pending();
    }

    // ============ 身份与路径 ============

    /// 记录在远端的当前视图：同 ID 的变更，或被重建的同一条目
    fn remote_view(&self, record: &ItemRecord) -> Option<&'a RemoteEntry> {
        if let Some(&entry) = self.reassigned.get(record.key.as_str()) {
            return Some(entry);
        }
        record
            .remote_id
            .as_deref()
            .and_then(|id| self.remote_by_id.get(id))
            .copied()
    }

    /// 记录在远端的期望路径，考虑祖先目录的移动
    fn expected_path(&self, record: &ItemRecord) -> String {
        if let Some(entry) = self.remote_view(record).filter(|e| !e.deleted) {
            return entry.path.clone();
        }
        self.folder_moves
            .iter()
            .find_map(|(old, new)| {
                path::is_within(&record.path, old)
                    .then(|| path::rebase(&record.path, old, new))
                    .flatten()
            })
            .unwrap_or_else(|| record.path.clone())
    }

    fn ancestor_deleted(&self, rel_path: &str) -> bool {
        self.deleted_folders
            .iter()
            .any(|folder| path::is_within(rel_path, folder))
    }

    fn is_untracked_remote(&self, entry: &RemoteEntry) -> bool {
        !entry.deleted
            && !self.synced_ids.contains(entry.id.as_str())
            && !self.claimed_remote.contains(entry.id.as_str())
    }

    /// 远端删除后在同一路径以新 ID 重建同类条目时，视为同一条目
    fn pair_recreated_items(&mut self) {
        let mut untracked_at: HashMap<&'a str, &'a RemoteEntry> = HashMap::new();
        for entry in &self.input.remote.entries {
            if self.is_untracked_remote(entry) {
                untracked_at.insert(entry.path.as_str(), entry);
            }
        }

        for record in self.synced.clone() {
            let Some(old) = record
                .remote_id
                .as_deref()
                .and_then(|id| self.remote_by_id.get(id))
                .copied()
            else {
                continue;
            };
            if !old.deleted {
                continue;
            }
            if let Some(&entry) = untracked_at.get(record.path.as_str()) {
                if entry.is_folder == record.is_folder && !self.claimed_remote.contains(entry.id.as_str()) {
                    debug!("远端重建条目 {} -> {} ({})", old.id, entry.id, record.path);
                    self.claimed_remote.insert(entry.id.as_str());
                    self.reassigned.insert(record.key.as_str(), entry);
                }
            }
        }
    }

    fn remote_content_changed(entry: &RemoteEntry, snap: &SyncedSnapshot) -> bool {
        if entry.is_folder {
            return false;
        }
        match (entry.content_hash.as_deref(), snap.fingerprint.as_deref()) {
            (Some(hash), Some(fp)) => hash != fp,
            _ => entry.version != snap.remote_version || entry.size != snap.size,
        }
    }

    fn remote_moved(entry: &RemoteEntry, record: &ItemRecord) -> bool {
        entry.parent_id != record.parent_remote_id || entry.name != path::file_name(&record.path)
    }

    /// 本地移动检测
    ///
    /// 已跟踪文件在原路径消失、远端内容未变，且恰好有一个未跟踪的本地文件
    /// 具有相同指纹和大小时，视为同一文件被移动。
    fn detect_local_moves(&mut self) {
        let mut by_content: HashMap<(&'a str, u64), Vec<&'a str>> = HashMap::new();
        for entry in self.input.local.entries.values() {
            if entry.is_folder || self.synced_paths.contains(entry.path.as_str()) {
                continue;
            }
            if let Some(fp) = entry.fingerprint.as_deref() {
                by_content
                    .entry((fp, entry.size))
                    .or_default()
                    .push(entry.path.as_str());
            }
        }
        if by_content.is_empty() {
            return;
        }

        let mut claims: Vec<(&'a str, &'a str)> = Vec::new();
        for record in self.synced.clone() {
            if record.is_folder || !self.missing.contains(record.key.as_str()) {
                continue;
            }
            let Some(snap) = record.synced.as_ref() else {
                continue;
            };
            let Some(fp) = snap.fingerprint.as_deref() else {
                continue;
            };
            match self.remote_view(record) {
                Some(e) if e.deleted || Self::remote_content_changed(e, snap) => continue,
                None if self.ancestor_deleted(&record.path) => continue,
                _ => {}
            }
            if let Some([only]) = by_content.get(&(fp, snap.size)).map(Vec::as_slice) {
                claims.push((record.key.as_str(), *only));
            }
        }

        let mut claim_count: HashMap<&str, usize> = HashMap::new();
        for (_, target) in &claims {
            *claim_count.entry(*target).or_default() += 1;
        }
        for (key, target) in claims {
            if claim_count.get(target) == Some(&1) {
                self.local_moves.insert(key, target);
                self.claimed_local.insert(target);
            }
        }
    }

    // ============ 已跟踪条目 ============

    fn record_decision(&mut self, record: &'a ItemRecord) -> Decision {
        let Some(snap) = record.synced.as_ref() else {
            return Decision::new(&record.path, record.is_folder, Action::NoOp).with_record(record);
        };
        let remote = self.remote_view(record);
        let target = self.expected_path(record);

        if let Some(new_path) = self.local_moves.get(record.key.as_str()).copied() {
            return self.moved_locally(record, remote, new_path, target);
        }

        // 本地在原路径换成了另一种类型：原条目按本地删除处理，新条目另行上传
        let local = self.input.local.get(&record.path);
        let replaced = local.is_some_and(|l| l.is_folder != record.is_folder);
        let local = local.filter(|_| !replaced);
        let clash = remote.is_some_and(|e| !e.deleted && e.is_folder != record.is_folder);
        if clash {
            warn!("条目类型在文件和目录之间变化，暂不处理: {}", record.path);
            return Decision::new(
                &record.path,
                record.is_folder,
                Action::Defer {
                    reason: "kind changed between file and folder".into(),
                },
            )
            .with_record(record)
            .with_local(local)
            .with_remote(remote);
        }

        let local_signal = match local {
            Some(_) if record.is_folder => Signal::Unchanged,
            Some(l) if l.fingerprint != snap.fingerprint || l.size != snap.size => Signal::Changed,
            Some(_) => Signal::Unchanged,
            None if replaced || self.missing.contains(record.key.as_str()) => Signal::Deleted,
            // 被过滤或读取失败，视为未变
            None => Signal::Unchanged,
        };

        let (remote_signal, moved, content_changed) = match remote {
            Some(e) if e.deleted => (Signal::Deleted, false, false),
            Some(e) => {
                let content_changed = Self::remote_content_changed(e, snap);
                let moved = Self::remote_moved(e, record);
                let signal = if content_changed || moved {
                    Signal::Changed
                } else {
                    Signal::Unchanged
                };
                (signal, moved, content_changed)
            }
            None if self.ancestor_deleted(&record.path) => (Signal::Deleted, false, false),
            None => (Signal::Unchanged, false, false),
        };

        let live_remote = remote.filter(|e| !e.deleted);
        let same_content = match (local.and_then(|l| l.fingerprint.as_deref()), live_remote) {
            (Some(fp), Some(e)) if content_changed => e.content_hash.as_deref() == Some(fp),
            _ => false,
        };

        let verdict = decide(local_signal, remote_signal, same_content);
        if replaced && !matches!(verdict, Verdict::DeleteRemote | Verdict::Forget) {
            warn!("本地换了类型而远端也有修改，暂不处理: {}", record.path);
            self.kind_held.push(record.path.as_str());
            return Decision::new(
                &record.path,
                record.is_folder,
                Action::Defer {
                    reason: "kind changed locally while remote changed".into(),
                },
            )
            .with_record(record)
            .with_remote(remote);
        }

        let action = match verdict {
            Verdict::NoOp => {
                if moved {
                    // 两端内容一致，只剩远端的移动
                    Action::Move {
                        side: Side::Local,
                        from: record.path.clone(),
                        remote_id: remote.map(|e| e.id.clone()).unwrap_or_default(),
                    }
                } else if local_signal == Signal::Changed
                    || local.is_some_and(|l| !l.is_folder && l.mtime != snap.local_mtime)
                    || live_remote.is_some_and(|e| !e.is_folder && e.version != snap.remote_version)
                    || self.reassigned.contains_key(record.key.as_str())
                {
                    Action::Refresh
                } else {
                    Action::NoOp
                }
            }
            Verdict::Upload => {
                // 远端已删除时作为新条目上传
                let remote_gone = remote_signal == Signal::Deleted;
                if remote_gone && record.is_folder {
                    Action::CreateRemoteFolder
                } else {
                    Action::Upload {
                        existing_id: if remote_gone {
                            None
                        } else {
                            live_remote
                                .map(|e| e.id.clone())
                                .or_else(|| record.remote_id.clone())
                        },
                        move_from: None,
                    }
                }
            }
            Verdict::Download => {
                let Some(e) = live_remote else {
                    return Decision::new(&record.path, record.is_folder, Action::NoOp).with_record(record);
                };
                let local_present = local.is_some();
                if record.is_folder {
                    if local_present && moved {
                        Action::Move {
                            side: Side::Local,
                            from: record.path.clone(),
                            remote_id: e.id.clone(),
                        }
                    } else if local_present {
                        Action::Refresh
                    } else {
                        Action::CreateLocalFolder {
                            remote_id: e.id.clone(),
                        }
                    }
                } else if local_present && moved && !content_changed {
                    Action::Move {
                        side: Side::Local,
                        from: record.path.clone(),
                        remote_id: e.id.clone(),
                    }
                } else {
                    Action::Download {
                        remote_id: e.id.clone(),
                        move_from: (local_present && moved).then(|| record.path.clone()),
                    }
                }
            }
            Verdict::DeleteLocal => {
                return Decision::new(&record.path, record.is_folder, Action::DeleteLocal)
                    .with_record(record)
                    .with_local(local)
                    .with_remote(remote);
            }
            Verdict::DeleteRemote => match record.remote_id.clone() {
                Some(remote_id) => Action::DeleteRemote { remote_id },
                None => Action::Forget,
            },
            Verdict::Forget => Action::Forget,
            Verdict::Conflict => {
                let (Some(l), Some(e)) = (local, live_remote) else {
                    return Decision::new(&record.path, record.is_folder, Action::NoOp).with_record(record);
                };
                if !content_changed {
                    // 远端只是移动了：本地跟随移动后上传修改
                    Action::Upload {
                        existing_id: Some(e.id.clone()),
                        move_from: moved.then(|| record.path.clone()),
                    }
                } else {
                    return self
                        .resolve_conflict(l, e, &record.path)
                        .with_record(record)
                        .with_local(local)
                        .with_remote(remote);
                }
            }
        };

        Decision::new(target, record.is_folder, action)
            .with_record(record)
            .with_local(local)
            .with_remote(remote)
    }

    /// 本地移动过的文件
    fn moved_locally(
        &mut self,
        record: &'a ItemRecord,
        remote: Option<&'a RemoteEntry>,
        new_path: &'a str,
        target: String,
    ) -> Decision {
        let local = self.input.local.get(new_path);
        let remote_id = record.remote_id.clone().unwrap_or_default();
        let remote_moved = remote.is_some_and(|e| Self::remote_moved(e, record));

        let decision = if !remote_moved {
            Decision::new(
                new_path,
                false,
                Action::Move {
                    side: Side::Remote,
                    from: record.path.clone(),
                    remote_id,
                },
            )
        } else if target == new_path {
            // 两端移到了同一位置
            Decision::new(new_path, false, Action::Refresh)
        } else {
            // 两端移到不同位置，远端的位置获胜
            Decision::new(
                target,
                false,
                Action::Move {
                    side: Side::Local,
                    from: new_path.to_string(),
                    remote_id,
                },
            )
        };

        decision.with_record(record).with_local(local).with_remote(remote)
    }

    // ============ 冲突 ============

    fn is_taken(&self, candidate: &str) -> bool {
        self.input.local.entries.contains_key(candidate)
            || self.remote_paths.contains(candidate)
            || self.synced_paths.contains(candidate)
            || self.reserved.contains(candidate)
    }

    /// 按策略处理两端内容不同的冲突；`local_path` 是本地文件当前所在路径
    fn resolve_conflict(&mut self, local: &LocalEntry, remote: &RemoteEntry, local_path: &str) -> Decision {
        let strategy = self.input.strategy;
        let target = remote.path.clone();
        let mut info = ConflictInfo {
            path: target.clone(),
            strategy,
            renamed_to: None,
            local_fingerprint: local.fingerprint.clone(),
            remote_fingerprint: remote.content_hash.clone(),
            local_time: local.mtime / 1_000_000_000,
            remote_time: remote.mtime,
        };
        let move_from = (local_path != target).then(|| local_path.to_string());

        let action = match strategy {
            ConflictStrategy::KeepBoth => {
                let renamed = unique_conflict_name(&target, "local", info.local_time, |p| self.is_taken(p));
                self.reserved.insert(renamed.clone());
                info.renamed_to = Some(renamed.clone());
                Action::ConflictDuplicate {
                    remote_id: remote.id.clone(),
                    local_path: local_path.to_string(),
                    renamed_to: renamed,
                }
            }
            ConflictStrategy::KeepRemote => Action::Download {
                remote_id: remote.id.clone(),
                move_from,
            },
            ConflictStrategy::KeepLocal => Action::Upload {
                existing_id: Some(remote.id.clone()),
                move_from,
            },
            // 不推进游标，两端版本都保持原样
            ConflictStrategy::Skip => Action::Defer {
                reason: "conflict left unresolved".into(),
            },
        };

        debug!("冲突 {}: 策略 {}", target, strategy);
        Decision::new(target, false, action).with_conflict(Some(info))
    }

    // ============ 未跟踪条目 ============

    /// 可复用的记录键：未完成的记录，其次是墓碑（复活）
    fn reusable_key(
        &mut self,
        remote_id: Option<&str>,
        rel_path: &str,
        is_folder: bool,
    ) -> (Option<String>, Option<&'a ItemRecord>) {
        let pending = remote_id
            .and_then(|id| self.pending_by_id.get(id))
            .or_else(|| self.pending_by_path.get(rel_path))
            .copied()
            .filter(|r| !self.consumed_pending.contains(r.key.as_str()));
        if let Some(record) = pending {
            self.consumed_pending.insert(record.key.as_str());
            return (Some(record.key.clone()), Some(record));
        }

        let stone = remote_id
            .and_then(|id| self.stone_by_id.get(id))
            .or_else(|| self.stone_by_path.get(rel_path).filter(|t| t.is_folder == is_folder))
            .copied();
        (stone.map(|t| t.key.clone()), None)
    }

    fn untracked_remote(&mut self) {
        let entries: Vec<&'a RemoteEntry> = self
            .input
            .remote
            .entries
            .iter()
            .filter(|e| self.is_untracked_remote(e))
            .collect();

        for entry in entries {
            self.claimed_remote.insert(entry.id.as_str());
            let (key, pending) = self.reusable_key(Some(&entry.id), &entry.path, entry.is_folder);

            if self.input.local.is_shielded(&entry.path) {
                debug!("远端条目位于被跳过的本地目录中: {}", entry.path);
                self.push_untracked(Decision::new(&entry.path, entry.is_folder, Action::NoOp), key, pending);
                continue;
            }

            // 让出路径的记录在本地留下的同类条目本轮会被删除
            let released = self.released.get(entry.path.as_str()).copied();
            let local = self
                .input
                .local
                .get(&entry.path)
                .filter(|l| !self.claimed_local.contains(l.path.as_str()))
                .filter(|l| released.map_or(true, |r| r.is_folder != l.is_folder));

            let held = match released {
                Some(_) => false,
                None => self.synced_paths.contains(entry.path.as_str()),
            };
            let decision = if held || self.record_targets.contains(&entry.path) {
                // 该路径仍属于另一个已跟踪条目，等它让出后再处理
                Decision::new(
                    &entry.path,
                    entry.is_folder,
                    Action::Defer {
                        reason: "path still held by a tracked item".into(),
                    },
                )
            } else if let Some(l) = local {
                self.claimed_local.insert(l.path.as_str());
                if l.is_folder != entry.is_folder {
                    warn!("同一路径两端类型不同，暂不处理: {}", entry.path);
                    Decision::new(
                        &entry.path,
                        entry.is_folder,
                        Action::Defer {
                            reason: "file and folder at the same path".into(),
                        },
                    )
                } else if l.is_folder
                    || matches!((&l.fingerprint, &entry.content_hash), (Some(a), Some(b)) if a == b)
                {
                    Decision::new(&entry.path, entry.is_folder, Action::Refresh)
                } else {
                    self.resolve_conflict(l, entry, &entry.path)
                }
            } else if entry.is_folder {
                Decision::new(
                    &entry.path,
                    true,
                    Action::CreateLocalFolder {
                        remote_id: entry.id.clone(),
                    },
                )
            } else {
                Decision::new(
                    &entry.path,
                    false,
                    Action::Download {
                        remote_id: entry.id.clone(),
                        move_from: None,
                    },
                )
            };

            let decision = decision.with_local(local).with_remote(Some(entry));
            self.push_untracked(decision, key, pending);
        }
    }

    fn untracked_local(&mut self) {
        let entries: Vec<&'a LocalEntry> = self
            .input
            .local
            .entries
            .values()
            .filter(|l| {
                let untracked = match self.released.get(l.path.as_str()) {
                    Some(record) => record.is_folder != l.is_folder,
                    None => !self.synced_paths.contains(l.path.as_str()),
                };
                untracked && !self.claimed_local.contains(l.path.as_str())
            })
            .collect();

        for entry in entries {
            self.claimed_local.insert(entry.path.as_str());
            let resurrected = entry.folder_state == Some(FolderState::Resurrected);
            let (key, pending) = self.reusable_key(None, &entry.path, entry.is_folder);
            if resurrected {
                debug!("目录复活: {}", entry.path);
            }

            let remote_taken = match self.released.get(entry.path.as_str()) {
                Some(record) => self.remote_holds_other(&entry.path, record),
                None => self.remote_paths.contains(entry.path.as_str()),
            };
            let action = if self.record_targets.contains(&entry.path) || remote_taken {
                Action::Defer {
                    reason: "path is the target of another item".into(),
                }
            } else if self.kind_held.iter().any(|p| path::is_within(&entry.path, p)) {
                Action::Defer {
                    reason: "parent changed kind".into(),
                }
            } else if entry.is_folder {
                Action::CreateRemoteFolder
            } else {
                Action::Upload {
                    existing_id: None,
                    move_from: None,
                }
            };

            let decision = Decision::new(&entry.path, entry.is_folder, action).with_local(Some(entry));
            self.push_untracked(decision, key, pending);
        }
    }

    /// 远端在该路径上还有不属于该记录的条目
    fn remote_holds_other(&self, rel_path: &str, record: &ItemRecord) -> bool {
        self.input
            .remote
            .entries
            .iter()
            .any(|e| !e.deleted && e.path == rel_path && Some(e.id.as_str()) != record.remote_id.as_deref())
    }

    fn push_untracked(&mut self, decision: Decision, key: Option<String>, pending: Option<&ItemRecord>) {
        let decision = match pending {
            Some(record) => decision.with_record(record),
            None => decision.with_key(key),
        };
        self.decisions.push(decision);
    }

    /// 两端都已不存在的未完成记录
    fn forget_stale_pending(&mut self) {
        let stale: Vec<&'a ItemRecord> = self
            .input
            .records
            .iter()
            .filter(|r| r.synced.is_none() && !self.consumed_pending.contains(r.key.as_str()))
            .collect();
        for record in stale {
            self.decisions
                .push(Decision::new(&record.path, record.is_folder, Action::Forget).with_record(record));
        }
    }
}

/// 目录删除的子树里仍有另一端要放入的内容时，改为在删除一端重建目录
///
/// 由深到浅处理，这样内层目录的重建也会让外层目录被保留。
fn rescue_orphans(decisions: &mut [Decision]) {
    let mut order: Vec<usize> = (0..decisions.len())
        .filter(|&i| decisions[i].is_folder && decisions[i].action.is_delete())
        .collect();
    order.sort_by_key(|&i| std::cmp::Reverse(path::depth(&decisions[i].path)));

    for i in order {
        let folder = decisions[i].path.clone();
        let receives = |side: Side| {
            decisions
                .iter()
                .any(|d| path::is_within(&d.path, &folder) && d.action.places_on(side))
        };

        let replacement = match &decisions[i].action {
            Action::DeleteLocal if receives(Side::Remote) => Some(Action::CreateRemoteFolder),
            Action::DeleteRemote { remote_id } if receives(Side::Local) => Some(Action::CreateLocalFolder {
                remote_id: remote_id.clone(),
            }),
            _ => None,
        };
        if let Some(action) = replacement {
            debug!("目录 {} 的子树仍有内容，保留目录", folder);
            decisions[i].action = action;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decision::DecisionKind;
    use crate::core::scanner::MissingItem;

    const NOW: i64 = 1_700_000_000;

    fn snapshot_record(id: &str, parent: &str, rel: &str, is_folder: bool, fp: Option<&str>, size: u64) -> ItemRecord {
        let fp = fp.map(str::to_string);
        ItemRecord::converged(id, Some(parent), rel, is_folder, fp, size, 100, Some("v1".into()), 10, NOW)
    }

    fn file(id: &str, parent: &str, rel: &str, fp: &str, size: u64) -> ItemRecord {
        snapshot_record(id, parent, rel, false, Some(fp), size)
    }

    fn folder(id: &str, parent: &str, rel: &str) -> ItemRecord {
        snapshot_record(id, parent, rel, true, None, 0)
    }

    fn local_file(rel: &str, fp: &str, size: u64, mtime: i64) -> LocalEntry {
        LocalEntry {
            path: rel.into(),
            size,
            mtime,
            fingerprint: Some(fp.into()),
            is_folder: false,
            folder_state: None,
        }
    }

    fn local_folder(rel: &str, state: FolderState) -> LocalEntry {
        LocalEntry {
            path: rel.into(),
            size: 0,
            mtime: 0,
            fingerprint: None,
            is_folder: true,
            folder_state: Some(state),
        }
    }

    fn remote_file(id: &str, parent: &str, rel: &str, fp: &str, size: u64, version: &str) -> RemoteEntry {
        RemoteEntry {
            id: id.into(),
            parent_id: Some(parent.into()),
            name: path::file_name(rel).into(),
            path: rel.into(),
            is_folder: false,
            deleted: false,
            size,
            mtime: 20,
            content_hash: Some(fp.into()),
            version: Some(version.into()),
        }
    }

    fn remote_folder(id: &str, parent: &str, rel: &str) -> RemoteEntry {
        RemoteEntry {
            id: id.into(),
            parent_id: Some(parent.into()),
            name: path::file_name(rel).into(),
            path: rel.into(),
            is_folder: true,
            deleted: false,
            size: 0,
            mtime: 20,
            content_hash: None,
            version: None,
        }
    }

    fn deleted(mut entry: RemoteEntry) -> RemoteEntry {
        entry.deleted = true;
        entry
    }

    fn scan(entries: Vec<LocalEntry>, missing: &[&ItemRecord]) -> LocalScan {
        LocalScan {
            entries: entries.into_iter().map(|e| (e.path.clone(), e)).collect(),
            missing: missing
                .iter()
                .map(|r| MissingItem {
                    key: r.key.clone(),
                    path: r.path.clone(),
                    is_folder: r.is_folder,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn changes(entries: Vec<RemoteEntry>) -> RemoteChanges {
        RemoteChanges {
            entries,
            new_cursor: Some("c".into()),
            ..Default::default()
        }
    }

    fn run(records: &[ItemRecord], tombstones: &[Tombstone], local: &LocalScan, remote: &RemoteChanges) -> Vec<Decision> {
        reconcile(&ReconcileInput {
            records,
            tombstones,
            local,
            remote,
            strategy: ConflictStrategy::KeepBoth,
            now: NOW,
        })
    }

    fn find<'d>(decisions: &'d [Decision], rel: &str) -> &'d Decision {
        decisions
            .iter()
            .find(|d| d.path == rel)
            .unwrap_or_else(|| panic!("no decision for {}", rel))
    }

    #[test]
    fn test_unchanged_is_noop() {
        let records = vec![file("1", "root", "a.txt", "fa", 3)];
        let local = scan(vec![local_file("a.txt", "fa", 3, 100)], &[]);
        let decisions = run(&records, &[], &local, &changes(vec![]));
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, Action::NoOp);
    }

    #[test]
    fn test_local_edit_uploads_to_existing_id() {
        let records = vec![file("1", "root", "a.txt", "fa", 3)];
        let local = scan(vec![local_file("a.txt", "fb", 4, 200)], &[]);
        let decisions = run(&records, &[], &local, &changes(vec![]));
        assert_eq!(
            decisions[0].action,
            Action::Upload {
                existing_id: Some("1".into()),
                move_from: None
            }
        );
    }

    #[test]
    fn test_remote_edit_downloads() {
        let records = vec![file("1", "root", "a.txt", "fa", 3)];
        let local = scan(vec![local_file("a.txt", "fa", 3, 100)], &[]);
        let remote = changes(vec![remote_file("1", "root", "a.txt", "fb", 4, "v2")]);
        let decisions = run(&records, &[], &local, &remote);
        assert_eq!(
            decisions[0].action,
            Action::Download {
                remote_id: "1".into(),
                move_from: None
            }
        );
    }

    #[test]
    fn test_deletes_in_both_directions() {
        let a = file("1", "root", "a.txt", "fa", 3);
        let b = file("2", "root", "b.txt", "fb", 3);
        let local = scan(vec![local_file("b.txt", "fb", 3, 100)], &[&a]);
        let remote = changes(vec![deleted(remote_file("2", "root", "b.txt", "fb", 3, "v1"))]);
        let decisions = run(&[a, b], &[], &local, &remote);
        assert_eq!(
            find(&decisions, "a.txt").action,
            Action::DeleteRemote {
                remote_id: "1".into()
            }
        );
        assert_eq!(find(&decisions, "b.txt").action, Action::DeleteLocal);
    }

    #[test]
    fn test_remote_edit_beats_local_delete() {
        let a = file("1", "root", "a.txt", "fa", 3);
        let local = scan(vec![], &[&a]);
        let remote = changes(vec![remote_file("1", "root", "a.txt", "fz", 9, "v2")]);
        let decisions = run(&[a], &[], &local, &remote);
        assert_eq!(decisions[0].kind(), DecisionKind::Download);
    }

    #[test]
    fn test_both_changed_same_content_converges() {
        let records = vec![file("1", "root", "a.txt", "fa", 3)];
        let local = scan(vec![local_file("a.txt", "same", 5, 200)], &[]);
        let remote = changes(vec![remote_file("1", "root", "a.txt", "same", 5, "v2")]);
        let decisions = run(&records, &[], &local, &remote);
        assert_eq!(decisions[0].action, Action::Refresh);
        assert_eq!(decisions[0].kind(), DecisionKind::NoOp);
    }

    #[test]
    fn test_conflict_keeps_both() {
        let records = vec![file("1", "root", "docs/a.txt", "fa", 3)];
        let local = scan(vec![local_file("docs/a.txt", "local", 5, 1_700_000_000_000_000_000)], &[]);
        let remote = changes(vec![remote_file("1", "d", "docs/a.txt", "remote", 6, "v2")]);
        let mut records = records;
        records[0].parent_remote_id = Some("d".into());
        let decisions = run(&records, &[], &local, &remote);

        let d = &decisions[0];
        assert_eq!(d.path, "docs/a.txt");
        let Action::ConflictDuplicate { renamed_to, local_path, .. } = &d.action else {
            panic!("expected conflict duplicate, got {:?}", d.action);
        };
        assert_eq!(local_path, "docs/a.txt");
        assert!(renamed_to.starts_with("docs/a_conflict_local_"));
        assert!(renamed_to.ends_with(".txt"));
        assert_eq!(d.conflict.as_ref().unwrap().renamed_to.as_ref(), Some(renamed_to));
    }

    #[test]
    fn test_conflict_strategies() {
        let mut record = file("1", "root", "a.txt", "fa", 3);
        record.parent_remote_id = Some("root".into());
        let records = vec![record];
        let local = scan(vec![local_file("a.txt", "local", 5, 0)], &[]);
        let remote = changes(vec![remote_file("1", "root", "a.txt", "remote", 6, "v2")]);

        let with = |strategy| {
            reconcile(&ReconcileInput {
                records: &records,
                tombstones: &[],
                local: &local,
                remote: &remote,
                strategy,
                now: NOW,
            })
            .remove(0)
        };
        assert_eq!(with(ConflictStrategy::KeepRemote).kind(), DecisionKind::Download);
        assert_eq!(with(ConflictStrategy::KeepLocal).kind(), DecisionKind::Upload);
        let skipped = with(ConflictStrategy::Skip);
        assert!(matches!(skipped.action, Action::Defer { .. }));
        assert!(skipped.conflict.is_some());
    }

    #[test]
    fn test_remote_rename_is_single_move() {
        let records = vec![
            folder("d1", "root", "src"),
            folder("d2", "root", "dst"),
            file("1", "d1", "src/a.txt", "fa", 3),
        ];
        let local = scan(
            vec![
                local_folder("src", FolderState::Known),
                local_folder("dst", FolderState::Known),
                local_file("src/a.txt", "fa", 3, 100),
            ],
            &[],
        );
        let remote = changes(vec![remote_file("1", "d2", "dst/b.txt", "fa", 3, "v1")]);
        let decisions = run(&records, &[], &local, &remote);

        let moves: Vec<_> = decisions.iter().filter(|d| d.kind() == DecisionKind::Move).collect();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].path, "dst/b.txt");
        assert_eq!(
            moves[0].action,
            Action::Move {
                side: Side::Local,
                from: "src/a.txt".into(),
                remote_id: "1".into()
            }
        );
        assert!(decisions
            .iter()
            .all(|d| !matches!(d.kind(), DecisionKind::Upload | DecisionKind::Download | DecisionKind::DeleteLocal)));
    }

    #[test]
    fn test_folder_move_carries_children() {
        let records = vec![
            folder("d1", "root", "old"),
            file("1", "d1", "old/a.txt", "fa", 3),
            file("2", "d1", "old/b.txt", "fb", 3),
        ];
        let local = scan(
            vec![
                local_folder("old", FolderState::Known),
                local_file("old/a.txt", "fa", 3, 100),
                local_file("old/b.txt", "fb2", 4, 200),
            ],
            &[],
        );
        let remote = changes(vec![remote_folder("d1", "root", "new")]);
        let decisions = run(&records, &[], &local, &remote);

        assert_eq!(find(&decisions, "new").kind(), DecisionKind::Move);
        // 子条目没有自己的移动，路径随目录改变
        assert_eq!(find(&decisions, "new/a.txt").action, Action::NoOp);
        assert_eq!(find(&decisions, "new/b.txt").kind(), DecisionKind::Upload);
    }

    #[test]
    fn test_local_move_detected() {
        let a = file("1", "root", "a.txt", "fa", 3);
        let local = scan(vec![local_file("moved/a.txt", "fa", 3, 100), local_folder("moved", FolderState::New)], &[&a]);
        let decisions = run(&[a], &[], &local, &changes(vec![]));

        let d = find(&decisions, "moved/a.txt");
        assert_eq!(
            d.action,
            Action::Move {
                side: Side::Remote,
                from: "a.txt".into(),
                remote_id: "1".into()
            }
        );
        assert_eq!(d.key.as_deref(), Some("1"));
        assert_eq!(find(&decisions, "moved").action, Action::CreateRemoteFolder);
        assert_eq!(decisions.len(), 2);
    }

    #[test]
    fn test_ambiguous_local_move_is_not_detected() {
        let a = file("1", "root", "a.txt", "fa", 3);
        let local = scan(
            vec![local_file("x.txt", "fa", 3, 100), local_file("y.txt", "fa", 3, 100)],
            &[&a],
        );
        let decisions = run(&[a], &[], &local, &changes(vec![]));
        assert_eq!(find(&decisions, "a.txt").kind(), DecisionKind::DeleteRemote);
        assert_eq!(find(&decisions, "x.txt").kind(), DecisionKind::Upload);
        assert_eq!(find(&decisions, "y.txt").kind(), DecisionKind::Upload);
    }

    #[test]
    fn test_new_items_on_each_side() {
        let local = scan(
            vec![local_folder("up", FolderState::New), local_file("up/x.txt", "fx", 2, 1)],
            &[],
        );
        let remote = changes(vec![
            remote_folder("d", "root", "down"),
            remote_file("f", "d", "down/y.txt", "fy", 2, "v1"),
        ]);
        let decisions = run(&[], &[], &local, &remote);
        assert_eq!(find(&decisions, "up").action, Action::CreateRemoteFolder);
        assert_eq!(find(&decisions, "up/x.txt").kind(), DecisionKind::Upload);
        assert_eq!(
            find(&decisions, "down").action,
            Action::CreateLocalFolder { remote_id: "d".into() }
        );
        assert_eq!(find(&decisions, "down/y.txt").kind(), DecisionKind::Download);
        assert!(decisions.iter().all(|d| d.key.is_none()));
    }

    #[test]
    fn test_same_file_on_both_sides_is_adopted() {
        let local = scan(vec![local_file("a.txt", "fa", 3, 1)], &[]);
        let remote = changes(vec![remote_file("1", "root", "a.txt", "fa", 3, "v1")]);
        let decisions = run(&[], &[], &local, &remote);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, Action::Refresh);
    }

    #[test]
    fn test_tombstone_resurrection_reuses_identity() {
        let stone = Tombstone {
            key: "1".into(),
            remote_id: Some("1".into()),
            path: "a.txt".into(),
            is_folder: false,
            deleted_at: NOW - 10,
            retain_until: NOW + 100,
        };
        let remote = changes(vec![remote_file("1", "root", "a.txt", "fa", 3, "v1")]);
        let decisions = run(&[], &[stone.clone()], &scan(vec![], &[]), &remote);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].key.as_deref(), Some("1"));
        assert_eq!(decisions[0].kind(), DecisionKind::Download);

        // 本地也有同样内容时是一次无操作的复活
        let local = scan(vec![local_file("a.txt", "fa", 3, 1)], &[]);
        let decisions = run(&[], &[stone], &local, &remote);
        assert_eq!(decisions[0].action, Action::Refresh);
        assert_eq!(decisions[0].key.as_deref(), Some("1"));
    }

    #[test]
    fn test_orphan_rescue_keeps_folder_with_new_content() {
        let d = folder("d", "root", "docs");
        let f = file("1", "d", "docs/old.txt", "fo", 3);
        let local = scan(
            vec![
                local_folder("docs", FolderState::Known),
                local_file("docs/old.txt", "fo", 3, 100),
                local_file("docs/new.txt", "fn", 3, 100),
            ],
            &[],
        );
        let remote = changes(vec![
            deleted(remote_file("1", "d", "docs/old.txt", "fo", 3, "v1")),
            deleted(remote_folder("d", "root", "docs")),
        ]);
        let decisions = run(&[d, f], &[], &local, &remote);
        assert_eq!(find(&decisions, "docs").action, Action::CreateRemoteFolder);
        assert_eq!(find(&decisions, "docs/old.txt").action, Action::DeleteLocal);
        assert_eq!(find(&decisions, "docs/new.txt").kind(), DecisionKind::Upload);
    }

    #[test]
    fn test_descendants_of_deleted_folder_are_deleted() {
        let d = folder("d", "root", "docs");
        let f = file("1", "d", "docs/a.txt", "fa", 3);
        let local = scan(
            vec![local_folder("docs", FolderState::Known), local_file("docs/a.txt", "fa", 3, 100)],
            &[],
        );
        // 变更流只报告了目录本身
        let remote = changes(vec![deleted(remote_folder("d", "root", "docs"))]);
        let decisions = run(&[d, f], &[], &local, &remote);
        assert_eq!(find(&decisions, "docs").action, Action::DeleteLocal);
        assert_eq!(find(&decisions, "docs/a.txt").action, Action::DeleteLocal);
    }

    #[test]
    fn test_pending_record_reused_or_forgotten() {
        let mut pending = ItemRecord::converged("x", None, "new.txt", false, None, 0, 0, None, 0, NOW);
        pending.key = ItemRecord::key_for_path("new.txt");
        pending.remote_id = None;
        pending.synced = None;
        pending.last_error = Some("denied".into());

        let local = scan(vec![local_file("new.txt", "fn", 3, 1)], &[]);
        let decisions = run(&[pending.clone()], &[], &local, &changes(vec![]));
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].key.as_deref(), Some("path:new.txt"));
        assert_eq!(decisions[0].kind(), DecisionKind::Upload);

        let decisions = run(&[pending], &[], &scan(vec![], &[]), &changes(vec![]));
        assert_eq!(decisions[0].action, Action::Forget);
    }

    #[test]
    fn test_file_replaced_by_folder_locally() {
        let notes = file("1", "root", "notes", "fn", 3);
        let local = scan(
            vec![
                local_folder("notes", FolderState::New),
                local_file("notes/inner.txt", "fi", 4, 100),
            ],
            &[],
        );
        let decisions = run(&[notes], &[], &local, &changes(vec![]));

        let by_kind = |kind| decisions.iter().filter(|d| d.kind() == kind).count();
        assert_eq!(decisions.len(), 3);
        assert_eq!(by_kind(DecisionKind::DeleteRemote), 1);
        assert_eq!(by_kind(DecisionKind::CreateRemoteFolder), 1);
        assert_eq!(find(&decisions, "notes/inner.txt").kind(), DecisionKind::Upload);
        let old = decisions.iter().find(|d| d.kind() == DecisionKind::DeleteRemote).unwrap();
        assert_eq!(old.key.as_deref(), Some("1"));
        assert!(!old.is_folder);
        assert!(decisions.iter().all(|d| !matches!(d.action, Action::Defer { .. })));
    }

    #[test]
    fn test_folder_replaced_by_file_locally() {
        let d = folder("d", "root", "notes");
        let f = file("1", "d", "notes/a.txt", "fa", 3);
        let local = scan(vec![local_file("notes", "fn", 5, 100)], &[&f]);
        let decisions = run(&[d, f], &[], &local, &changes(vec![]));

        assert_eq!(find(&decisions, "notes/a.txt").kind(), DecisionKind::DeleteRemote);
        let upload = decisions
            .iter()
            .find(|d| d.path == "notes" && !d.is_folder)
            .unwrap();
        assert_eq!(
            upload.action,
            Action::Upload {
                existing_id: None,
                move_from: None
            }
        );
        let folder = decisions.iter().find(|d| d.path == "notes" && d.is_folder).unwrap();
        assert_eq!(folder.action, Action::DeleteRemote { remote_id: "d".into() });
    }

    #[test]
    fn test_file_replaced_by_folder_remotely() {
        let notes = file("1", "root", "notes", "fn", 3);
        let local = scan(vec![local_file("notes", "fn", 3, 100)], &[]);
        let remote = changes(vec![
            deleted(remote_file("1", "root", "notes", "fn", 3, "v1")),
            remote_folder("d", "root", "notes"),
        ]);
        let decisions = run(&[notes], &[], &local, &remote);

        let old = decisions.iter().find(|d| d.path == "notes" && !d.is_folder).unwrap();
        assert_eq!(old.action, Action::DeleteLocal);
        let new = decisions.iter().find(|d| d.path == "notes" && d.is_folder).unwrap();
        assert_eq!(new.action, Action::CreateLocalFolder { remote_id: "d".into() });
    }

    #[test]
    fn test_kind_change_with_remote_edit_waits() {
        let notes = file("1", "root", "notes", "fn", 3);
        let local = scan(
            vec![
                local_folder("notes", FolderState::New),
                local_file("notes/inner.txt", "fi", 4, 100),
            ],
            &[],
        );
        let remote = changes(vec![remote_file("1", "root", "notes", "fz", 9, "v2")]);
        let decisions = run(&[notes], &[], &local, &remote);

        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|d| matches!(d.action, Action::Defer { .. })));
    }

    #[test]
    fn test_one_decision_per_identity() {
        let records = vec![
            folder("d", "root", "docs"),
            file("1", "d", "docs/a.txt", "fa", 3),
            file("2", "d", "docs/b.txt", "fb", 3),
            file("3", "root", "c.txt", "fc", 3),
        ];
        let local = scan(
            vec![
                local_folder("docs", FolderState::Known),
                local_file("docs/a.txt", "fa2", 4, 5),
                local_file("docs/n.txt", "fn", 4, 5),
            ],
            &[&records[2], &records[3]],
        );
        let remote = changes(vec![
            remote_file("1", "d", "docs/a.txt", "fa3", 5, "v2"),
            remote_file("9", "root", "z.txt", "fz", 5, "v1"),
        ]);
        let decisions = run(&records, &[], &local, &remote);

        // 4 条记录 + 1 个本地新文件 + 1 个远端新文件
        assert_eq!(decisions.len(), 6);
        let keys: HashSet<_> = decisions.iter().filter_map(|d| d.key.clone()).collect();
        assert_eq!(keys.len(), 4);
    }
}
