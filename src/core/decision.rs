//! 决策类型与决策矩阵
//!
//! `decide` 是纯函数：只看两端各自相对上次同步快照的变化信号。
//! 路径、冲突命名、目录修正等都在 reconciler 中完成。

use crate::core::conflict::ConflictInfo;
use crate::core::delta::RemoteEntry;
use crate::core::scanner::LocalEntry;
use crate::core::state::ItemRecord;
use serde::Serialize;

/// 一端相对上次同步快照的变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Unchanged,
    Changed,
    Deleted,
    /// 上次同步时不存在
    New,
    /// 两次都不存在
    Absent,
}

/// 决策矩阵的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NoOp,
    Upload,
    Download,
    DeleteLocal,
    DeleteRemote,
    Conflict,
    /// 两端都已删除，只需要打墓碑
    Forget,
}

/// 决策矩阵
///
/// `same_content` 只在两端都有变化时有意义：内容相同即视为已收敛。
/// 删除与修改相遇时修改一方获胜，删除意图被放弃。
pub fn decide(local: Signal, remote: Signal, same_content: bool) -> Verdict {
    use Signal::*;

    match (local, remote) {
        (Changed | New, Changed | New) => {
            if same_content {
                Verdict::NoOp
            } else {
                Verdict::Conflict
            }
        }
        (Changed | New, _) => Verdict::Upload,
        (_, Changed | New) => Verdict::Download,
        (Unchanged, Deleted) => Verdict::DeleteLocal,
        (Deleted, Unchanged) => Verdict::DeleteRemote,
        (Deleted | Absent, Deleted | Absent) => Verdict::Forget,
        (Unchanged, Unchanged | Absent) | (Absent, Unchanged) => Verdict::NoOp,
    }
}

/// 操作作用的一端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

/// 单个条目的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    NoOp,
    /// 两端已一致，只更新快照
    Refresh,
    /// 本轮无法安全处理，留到下一轮；游标不推进
    Defer { reason: String },
    /// `move_from` 为本地文件当前所在路径（远端已移动时先在本地跟随移动）
    Upload {
        existing_id: Option<String>,
        move_from: Option<String>,
    },
    /// `move_from` 为本地旧路径，写入新路径后删除
    Download {
        remote_id: String,
        move_from: Option<String>,
    },
    DeleteLocal,
    DeleteRemote { remote_id: String },
    CreateLocalFolder { remote_id: String },
    CreateRemoteFolder,
    /// 在 `side` 一端把条目从 `from` 移到决策路径
    Move {
        side: Side,
        from: String,
        remote_id: String,
    },
    /// 远端版本占用原路径，本地版本改名为 `renamed_to` 后作为新条目上传
    ConflictDuplicate {
        remote_id: String,
        local_path: String,
        renamed_to: String,
    },
    Forget,
}

/// 按类别计数用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    NoOp,
    Upload,
    Download,
    DeleteLocal,
    DeleteRemote,
    CreateLocalFolder,
    CreateRemoteFolder,
    Move,
    ConflictDuplicate,
    Forget,
}

impl Action {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Action::NoOp | Action::Refresh | Action::Defer { .. } => DecisionKind::NoOp,
            Action::Upload { .. } => DecisionKind::Upload,
            Action::Download { .. } => DecisionKind::Download,
            Action::DeleteLocal => DecisionKind::DeleteLocal,
            Action::DeleteRemote { .. } => DecisionKind::DeleteRemote,
            Action::CreateLocalFolder { .. } => DecisionKind::CreateLocalFolder,
            Action::CreateRemoteFolder => DecisionKind::CreateRemoteFolder,
            Action::Move { .. } => DecisionKind::Move,
            Action::ConflictDuplicate { .. } => DecisionKind::ConflictDuplicate,
            Action::Forget => DecisionKind::Forget,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Action::DeleteLocal | Action::DeleteRemote { .. })
    }

    /// 只需要更新状态库、不做任何 IO 的动作
    pub fn is_state_only(&self) -> bool {
        matches!(
            self,
            Action::NoOp | Action::Refresh | Action::Defer { .. } | Action::Forget
        )
    }

    /// 在某一端放置内容（创建、写入、移动）的动作
    pub fn places_on(&self, side: Side) -> bool {
        match self {
            Action::Download { .. } | Action::CreateLocalFolder { .. } => side == Side::Local,
            Action::Upload { .. } | Action::CreateRemoteFolder => side == Side::Remote,
            Action::Move { side: s, .. } => *s == side,
            // 冲突副本在两端都会写入
            Action::ConflictDuplicate { .. } => true,
            _ => false,
        }
    }

    /// 修改本地文件系统的动作走下载池，其余走上传池
    pub fn mutates_local(&self) -> bool {
        matches!(
            self,
            Action::Download { .. }
                | Action::DeleteLocal
                | Action::CreateLocalFolder { .. }
                | Action::Move {
                    side: Side::Local,
                    ..
                }
                | Action::ConflictDuplicate { .. }
        )
    }
}

/// 单个条目的决策
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// 状态库中被替换的记录键；全新条目为 None
    pub key: Option<String>,
    /// 目标规范路径
    pub path: String,
    pub is_folder: bool,
    pub action: Action,
    /// 本轮开始时的记录
    pub record: Option<ItemRecord>,
    /// 扫描时的本地状态，执行前用它判断本地是否又被改动
    pub local: Option<LocalEntry>,
    pub remote: Option<RemoteEntry>,
    pub conflict: Option<ConflictInfo>,
}

impl Decision {
    pub fn new(path: impl Into<String>, is_folder: bool, action: Action) -> Self {
        Self {
            key: None,
            path: path.into(),
            is_folder,
            action,
            record: None,
            local: None,
            remote: None,
            conflict: None,
        }
    }

    pub fn kind(&self) -> DecisionKind {
        self.action.kind()
    }

    pub fn with_record(mut self, record: &ItemRecord) -> Self {
        self.key = Some(record.key.clone());
        self.record = Some(record.clone());
        self
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    pub fn with_local(mut self, local: Option<&LocalEntry>) -> Self {
        self.local = local.cloned();
        self
    }

    pub fn with_remote(mut self, remote: Option<&RemoteEntry>) -> Self {
        self.remote = remote.cloned();
        self
    }

    pub fn with_conflict(mut self, conflict: Option<ConflictInfo>) -> Self {
        self.conflict = conflict;
        self
    }

    /// 下载会写入本地的字节数，用于空间检查
    pub fn download_bytes(&self) -> u64 {
        match self.action {
            Action::Download { .. } | Action::ConflictDuplicate { .. } => {
                self.remote.as_ref().map_or(0, |r| r.size)
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Signal::*;

    #[test]
    fn test_matrix_rows() {
        assert_eq!(decide(Unchanged, Unchanged, false), Verdict::NoOp);
        assert_eq!(decide(Changed, Unchanged, false), Verdict::Upload);
        assert_eq!(decide(Unchanged, Changed, false), Verdict::Download);
        assert_eq!(decide(Deleted, Unchanged, false), Verdict::DeleteRemote);
        assert_eq!(decide(Unchanged, Deleted, false), Verdict::DeleteLocal);
        assert_eq!(decide(Changed, Changed, true), Verdict::NoOp);
        assert_eq!(decide(Changed, Changed, false), Verdict::Conflict);
        assert_eq!(decide(New, Absent, false), Verdict::Upload);
        assert_eq!(decide(Absent, New, false), Verdict::Download);
    }

    #[test]
    fn test_edit_beats_delete() {
        // 远端修改让本地删除失效，反之亦然
        assert_eq!(decide(Deleted, Changed, false), Verdict::Download);
        assert_eq!(decide(Changed, Deleted, false), Verdict::Upload);
        assert_eq!(decide(Deleted, Deleted, false), Verdict::Forget);
    }

    #[test]
    fn test_every_signal_pair_has_a_verdict() {
        let all = [Unchanged, Changed, Deleted, New, Absent];
        let mut seen = 0;
        for l in all {
            for r in all {
                decide(l, r, false);
                decide(l, r, true);
                seen += 1;
            }
        }
        assert_eq!(seen, 25);
    }

    #[test]
    fn test_placement_sides() {
        let up = Action::Upload {
            existing_id: None,
            move_from: None,
        };
        assert!(up.places_on(Side::Remote));
        assert!(!up.places_on(Side::Local));
        assert!(!up.mutates_local());

        let mv = Action::Move {
            side: Side::Local,
            from: "a".into(),
            remote_id: "1".into(),
        };
        assert!(mv.places_on(Side::Local));
        assert!(mv.mutates_local());
        assert_eq!(mv.kind(), DecisionKind::Move);
        assert_eq!(Action::Refresh.kind(), DecisionKind::NoOp);
    }
}
