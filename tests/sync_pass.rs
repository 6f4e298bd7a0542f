//! 端到端：真实本地目录 + 内存远端 + 内存状态库

use drivesync_lib::config::SyncSettings;
use drivesync_lib::core::filter::FilterRules;
use drivesync_lib::core::{DecisionKind, RetryPolicy};
use drivesync_lib::db::{open_memory_pool, SyncStatus};
use drivesync_lib::remote::MemoryDrive;
use drivesync_lib::{PassMode, SyncEngine, SyncReport};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    remote: Arc<MemoryDrive>,
    engine: SyncEngine,
}

impl Harness {
    async fn new() -> Self {
        Self::with_settings(SyncSettings::default()).await
    }

    async fn with_settings(settings: SyncSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryDrive::new("memory"));
        let pool = open_memory_pool().await.unwrap();
        let engine = SyncEngine::new(
            "drive-1",
            dir.path(),
            Arc::new(pool),
            remote.clone(),
            FilterRules::default(),
            settings,
        )
        .with_policy(RetryPolicy::none());
        Self { dir, remote, engine }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, rel: &str, data: &[u8]) {
        let full = self.root().join(rel);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, data).unwrap();
    }

    fn read(&self, rel: &str) -> Option<Vec<u8>> {
        fs::read(self.root().join(rel)).ok()
    }

    /// 本地所有文件的相对路径
    fn local_files(&self) -> Vec<String> {
        let mut files: Vec<String> = walkdir::WalkDir::new(self.root())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                e.path()
                    .strip_prefix(self.root())
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        files.sort();
        files
    }

    fn remote_files(&self) -> Vec<String> {
        self.remote
            .list_paths()
            .into_iter()
            .filter(|p| !p.ends_with('/'))
            .collect()
    }

    async fn pass(&self) -> SyncReport {
        self.engine.run_pass(PassMode::Incremental, None).await.unwrap()
    }

    /// 同步到没有剩余工作为止
    async fn converge(&self) -> SyncReport {
        let report = self.pass().await;
        assert_eq!(report.failed, 0, "errors: {:?}", report.errors);
        report
    }
}

fn assert_conserved(report: &SyncReport) {
    let total: u32 = report.counts.values().sum();
    assert_eq!(total as usize, report.decisions.len());
}

#[tokio::test]
async fn test_first_pass_merges_both_sides_and_second_pass_is_idle() {
    let h = Harness::new().await;
    h.remote.put("docs/a.txt", b"from remote");
    h.write("notes/b.txt", b"from local");

    let first = h.converge().await;
    assert_eq!(first.status, SyncStatus::Completed);
    assert!(first.cursor_advanced);
    assert_eq!(first.count(DecisionKind::Download), 1);
    assert_eq!(first.count(DecisionKind::Upload), 1);
    assert_conserved(&first);

    assert_eq!(h.read("docs/a.txt").as_deref(), Some(&b"from remote"[..]));
    assert_eq!(h.remote.read("notes/b.txt").as_deref(), Some(&b"from local"[..]));

    let second = h.converge().await;
    assert_eq!(second.pending_work(), 0, "counts: {:?}", second.counts);
    assert_conserved(&second);

    let third = h.converge().await;
    assert_eq!(third.pending_work(), 0);
    assert_eq!(h.local_files(), vec!["docs/a.txt", "notes/b.txt"]);
    assert_eq!(h.remote_files(), vec!["docs/a.txt", "notes/b.txt"]);

    let history = h.engine.history(10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|row| row.status == "completed"));
}

#[tokio::test]
async fn test_deep_tree_and_folder_delete() {
    let h = Harness::new().await;
    h.remote.put("a/b/c/d.txt", b"deep");
    h.converge().await;
    assert_eq!(h.read("a/b/c/d.txt").as_deref(), Some(&b"deep"[..]));

    h.write("old/one.txt", b"1");
    h.write("old/inner/two.txt", b"22");
    h.converge().await;
    assert!(h.remote_files().contains(&"old/inner/two.txt".to_string()));

    fs::remove_dir_all(h.root().join("old")).unwrap();
    let report = h.converge().await;
    assert_eq!(report.count(DecisionKind::DeleteRemote), 4);
    assert_eq!(h.remote_files(), vec!["a/b/c/d.txt"]);
    assert!(h.remote.id_of("old").is_none());

    assert_eq!(h.converge().await.pending_work(), 0);
}

#[tokio::test]
async fn test_remote_move_is_a_single_local_move() {
    let h = Harness::new().await;
    h.remote.put("docs/report.txt", b"quarterly numbers");
    h.converge().await;
    let id = h.remote.id_of("docs/report.txt").unwrap();

    assert!(h.remote.rename("docs/report.txt", "archive/report.txt"));
    let report = h.converge().await;
    assert_eq!(report.count(DecisionKind::Move), 1);
    assert_eq!(report.count(DecisionKind::Download), 0);
    assert_eq!(report.count(DecisionKind::CreateLocalFolder), 1);

    assert!(h.read("docs/report.txt").is_none());
    assert_eq!(h.read("archive/report.txt").as_deref(), Some(&b"quarterly numbers"[..]));
    assert_eq!(h.remote.id_of("archive/report.txt"), Some(id));
    assert_eq!(h.converge().await.pending_work(), 0);
}

#[tokio::test]
async fn test_local_move_keeps_remote_identity() {
    let h = Harness::new().await;
    h.write("photo.jpg", b"pretend this is a picture");
    h.converge().await;
    let id = h.remote.id_of("photo.jpg").unwrap();

    fs::create_dir_all(h.root().join("album")).unwrap();
    fs::rename(h.root().join("photo.jpg"), h.root().join("album/photo.jpg")).unwrap();

    let report = h.converge().await;
    assert_eq!(report.count(DecisionKind::Move), 1);
    assert_eq!(report.count(DecisionKind::Upload), 0);
    assert_eq!(report.count(DecisionKind::DeleteRemote), 0);
    assert_eq!(h.remote.id_of("album/photo.jpg"), Some(id));
    assert_eq!(h.remote_files(), vec!["album/photo.jpg"]);
    assert_eq!(h.converge().await.pending_work(), 0);
}

#[tokio::test]
async fn test_file_replaced_by_folder_converges() {
    let h = Harness::new().await;
    h.write("notes", b"plain file");
    h.converge().await;
    let old_id = h.remote.id_of("notes").unwrap();

    fs::remove_file(h.root().join("notes")).unwrap();
    h.write("notes/inner.txt", b"now a folder");

    let report = h.converge().await;
    assert_eq!(report.status, SyncStatus::Completed);
    assert!(report.cursor_advanced);
    assert_eq!(report.held, 0);
    assert_eq!(report.count(DecisionKind::DeleteRemote), 1);
    assert_eq!(report.count(DecisionKind::CreateRemoteFolder), 1);
    assert_eq!(report.count(DecisionKind::Upload), 1);

    assert_eq!(h.remote_files(), vec!["notes/inner.txt"]);
    assert_eq!(h.remote.read("notes/inner.txt").as_deref(), Some(&b"now a folder"[..]));
    assert_ne!(h.remote.id_of("notes"), Some(old_id));
    assert_eq!(h.converge().await.pending_work(), 0);
}

#[tokio::test]
async fn test_folder_replaced_by_file_converges() {
    let h = Harness::new().await;
    h.write("notes/a.txt", b"inside");
    h.converge().await;

    fs::remove_dir_all(h.root().join("notes")).unwrap();
    h.write("notes", b"flat now");

    let report = h.converge().await;
    assert!(report.cursor_advanced);
    assert_eq!(report.count(DecisionKind::DeleteRemote), 2);
    assert_eq!(report.count(DecisionKind::Upload), 1);
    assert_eq!(h.remote_files(), vec!["notes"]);
    assert_eq!(h.remote.read("notes").as_deref(), Some(&b"flat now"[..]));
    assert_eq!(h.converge().await.pending_work(), 0);
}

#[tokio::test]
async fn test_conflict_keeps_both_versions() {
    let h = Harness::new().await;
    h.remote.put("plan.md", b"base");
    h.converge().await;

    h.write("plan.md", b"local edit, longer");
    h.remote.put("plan.md", b"remote edit");

    let report = h.converge().await;
    assert_eq!(report.count(DecisionKind::ConflictDuplicate), 1);
    assert_eq!(report.conflicts, 1);

    // 远端版本占用原路径，本地版本改名后两端都保留
    assert_eq!(h.read("plan.md").as_deref(), Some(&b"remote edit"[..]));
    let local = h.local_files();
    assert_eq!(local.len(), 2);
    let copy = local.iter().find(|p| p.as_str() != "plan.md").unwrap();
    assert_eq!(h.read(copy).as_deref(), Some(&b"local edit, longer"[..]));
    assert_eq!(h.remote.read(copy).as_deref(), Some(&b"local edit, longer"[..]));

    let logged = h.engine.conflict_log().recent(10).await.unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(h.converge().await.pending_work(), 0);
}

#[tokio::test]
async fn test_mass_delete_is_held_until_allowed() {
    let settings = SyncSettings {
        max_delete_count: 2,
        max_delete_percent: 50.0,
        min_items_for_delete_check: 3,
        ..Default::default()
    };
    let mut h = Harness::with_settings(settings.clone()).await;
    for i in 0..5 {
        h.remote.put(&format!("f{}.txt", i), format!("file {}", i).as_bytes());
    }
    h.converge().await;
    assert_eq!(h.local_files().len(), 5);

    for i in 0..4 {
        assert!(h.remote.remove(&format!("f{}.txt", i)));
    }
    let held = h.pass().await;
    assert_eq!(held.status, SyncStatus::Partial);
    assert!(!held.cursor_advanced);
    assert_eq!(held.violations.len(), 1);
    assert_eq!(held.held, 4);
    assert_eq!(h.local_files().len(), 5);

    h.engine.set_settings(SyncSettings {
        allow_mass_delete: true,
        ..settings
    });
    let released = h.converge().await;
    assert_eq!(released.count(DecisionKind::DeleteLocal), 4);
    assert!(released.cursor_advanced);
    assert_eq!(h.local_files(), vec!["f4.txt"]);
}

#[tokio::test]
async fn test_item_recreated_after_delete_is_restored() {
    let h = Harness::new().await;
    h.remote.put("todo.txt", b"v1");
    h.converge().await;

    assert!(h.remote.remove("todo.txt"));
    let report = h.converge().await;
    assert_eq!(report.count(DecisionKind::DeleteLocal), 1);
    assert!(h.read("todo.txt").is_none());
    let now = chrono::Utc::now().timestamp();
    assert_eq!(h.engine.store().tombstones(now).await.unwrap().len(), 1);

    let new_id = h.remote.put("todo.txt", b"second life");
    let report = h.converge().await;
    assert_eq!(report.count(DecisionKind::Download), 1);
    assert_eq!(h.read("todo.txt").as_deref(), Some(&b"second life"[..]));
    assert!(h.engine.store().tombstones(now).await.unwrap().is_empty());

    let records = h.engine.store().list_active().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].remote_id.as_deref(), Some(new_id.as_str()));
}

#[tokio::test]
async fn test_invalid_cursor_falls_back_to_full_listing() {
    let h = Harness::new().await;
    h.remote.put("kept.txt", b"kept");
    h.converge().await;

    h.remote.put("later.txt", b"added before compaction");
    h.remote.compact();
    let report = h.converge().await;
    assert_eq!(report.status, SyncStatus::Completed);
    assert!(report.cursor_advanced);
    assert_eq!(report.count(DecisionKind::Download), 1);
    assert_eq!(report.count(DecisionKind::DeleteLocal), 0);
    assert_eq!(h.local_files(), vec!["kept.txt", "later.txt"]);
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let h = Harness::with_settings(SyncSettings {
        dry_run: true,
        ..Default::default()
    })
    .await;
    h.remote.put("a.txt", b"remote");
    h.write("b.txt", b"local");

    let report = h.pass().await;
    assert!(report.dry_run);
    assert_eq!(report.count(DecisionKind::Download), 1);
    assert_eq!(report.count(DecisionKind::Upload), 1);
    assert_conserved(&report);

    assert!(h.read("a.txt").is_none());
    assert!(h.remote.read("b.txt").is_none());
    assert!(h.engine.store().list_active().await.unwrap().is_empty());
    assert_eq!(h.engine.store().get_cursor().await.unwrap(), None);
    assert!(h.engine.history(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_item_holds_cursor_and_retries_next_pass() {
    let h = Harness::new().await;
    h.remote.put("good.txt", b"good");
    h.remote.put("bad.txt", b"bad");
    h.remote.fail_on("bad.txt");

    let report = h.pass().await;
    assert_eq!(report.status, SyncStatus::Partial);
    assert_eq!(report.failed, 1);
    assert!(!report.cursor_advanced);
    assert_eq!(h.read("good.txt").as_deref(), Some(&b"good"[..]));
    assert!(h.read("bad.txt").is_none());
    assert_eq!(h.engine.store().get_cursor().await.unwrap(), None);

    let failed = h.engine.store().list_failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].path, "bad.txt");

    h.remote.clear_failures();
    let report = h.converge().await;
    assert_eq!(report.status, SyncStatus::Completed);
    assert!(report.cursor_advanced);
    assert_eq!(h.read("bad.txt").as_deref(), Some(&b"bad"[..]));
    assert!(h.engine.store().list_failed().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_full_rescan_detects_remote_deletes() {
    let h = Harness::new().await;
    h.remote.put("a.txt", b"a");
    h.remote.put("b.txt", b"b");
    h.converge().await;

    h.remote.remove("b.txt");
    let report = h.engine.run_pass(PassMode::FullRescan, None).await.unwrap();
    assert_eq!(report.mode, PassMode::FullRescan);
    assert_eq!(report.count(DecisionKind::DeleteLocal), 1);
    assert_eq!(h.local_files(), vec!["a.txt"]);
}
