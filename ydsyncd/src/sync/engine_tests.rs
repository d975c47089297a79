use super::*;
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;

use crate::sync::conflict::{ConflictPolicy, conflict_path};
use crate::sync::digest::{mtime_secs, now_unix};
use crate::sync::history::HistoryMarker;
use crate::sync::memory_remote::MemoryRemote;
use crate::sync::task::TaskOutcome;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::{TempDir, tempdir};
use tokio::sync::broadcast::error::TryRecvError;

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    remote: Arc<MemoryRemote>,
    history: Arc<HistoryStore>,
    engine: Arc<SyncEngine>,
}

async fn memory_history() -> Arc<HistoryStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    Arc::new(HistoryStore::from_pool(pool).await.unwrap())
}

async fn harness_with(configure: impl FnOnce(&mut EngineConfig)) -> Harness {
    let dir = tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap().join("disk");
    std::fs::create_dir_all(&root).unwrap();

    let mut config = EngineConfig::new(&root);
    config.workers = 2;
    configure(&mut config);
    std::fs::create_dir_all(&config.work_dir).unwrap();

    let remote = Arc::new(MemoryRemote::new());
    remote.stage_downloads_in(config.work_dir.clone());
    let history = memory_history().await;
    let engine = SyncEngine::new(config, remote.clone(), Arc::clone(&history)).unwrap();
    Harness {
        _dir: dir,
        root,
        remote,
        history,
        engine,
    }
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

/// Waits until the engine settles and stays settled, letting watcher echoes
/// of our own writes play out.
async fn quiesce(engine: &SyncEngine) -> SyncState {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let state = engine.wait_settled().await;
            tokio::time::sleep(Duration::from_millis(400)).await;
            if engine.state() == state && engine.outstanding() == 0 {
                return state;
            }
        }
    })
    .await
    .expect("engine did not settle")
}

fn transfers(remote: &MemoryRemote) -> Vec<String> {
    remote
        .mutations()
        .into_iter()
        .filter(|call| {
            call.starts_with("upload") || call.starts_with("download") || call.starts_with("delete")
        })
        .collect()
}

fn drain(events: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_remote_file_is_downloaded_with_history() {
    let h = harness().await;
    h.remote
        .put_file("/docs/readme.txt", b"hello", 1_700_000_000);

    assert!(h.engine.connect().await.unwrap().is_online());
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);

    let local = h.root.join("docs/readme.txt");
    assert_eq!(std::fs::read(&local).unwrap(), b"hello");
    assert_eq!(h.history.get("/docs"), Some(HistoryMarker::Dir));
    let mtime = mtime_secs(&std::fs::metadata(&local).unwrap());
    assert_eq!(h.history.file_mtime("/docs/readme.txt"), Some(mtime));
    assert_eq!(transfers(&h.remote), vec!["download /docs/readme.txt"]);

    h.engine.shutdown(ShutdownMode::Fast).await;
    assert_eq!(h.engine.state(), SyncState::Exit);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_pass_changes_nothing() {
    let h = harness().await;
    h.remote
        .put_file("/docs/readme.txt", b"hello", 1_700_000_000);
    std::fs::create_dir_all(h.root.join("photos")).unwrap();
    std::fs::write(h.root.join("photos/cat.jpg"), b"meow").unwrap();

    h.engine.connect().await.unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);
    assert!(h.remote.get("/photos/cat.jpg").is_some());

    h.remote.clear_calls();
    let outcome = h.engine.full_sync().unwrap().outcome().await;
    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);
    assert_eq!(transfers(&h.remote), Vec::<String>::new());

    h.engine.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_content_is_recorded_without_transfer() {
    let h = harness().await;
    h.remote.put_file("/same.txt", b"same bytes", 1_000);
    let local = h.root.join("same.txt");
    std::fs::write(&local, b"same bytes").unwrap();
    let mtime = mtime_secs(&std::fs::metadata(&local).unwrap());

    h.engine.connect().await.unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);

    assert_eq!(transfers(&h.remote), Vec::<String>::new());
    assert_eq!(h.history.file_mtime("/same.txt"), Some(mtime));

    h.engine.shutdown(ShutdownMode::Fast).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn diverged_file_keeps_both_versions() {
    let h = harness().await;
    let local = h.root.join("notes.txt");
    std::fs::write(&local, b"local edit").unwrap();
    let local_mtime = mtime_secs(&std::fs::metadata(&local).unwrap());
    h.history.record_file("/notes.txt", 100);
    h.remote
        .put_file("/notes.txt", b"remote edit", now_unix() + 1_000);
    let mut events = h.engine.subscribe();

    h.engine.connect().await.unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);

    let kept = conflict_path("/notes.txt", local_mtime);
    let kept_local = h.root.join(kept.trim_start_matches('/'));
    assert_eq!(std::fs::read(&kept_local).unwrap(), b"local edit");
    assert_eq!(std::fs::read(&local).unwrap(), b"remote edit");
    assert_eq!(h.remote.get(&kept).unwrap().data, b"local edit");
    assert_eq!(h.remote.get("/notes.txt").unwrap().data, b"remote edit");
    assert!(drain(&mut events).contains(&StatusEvent::Conflict {
        path: "/notes.txt".into()
    }));

    h.engine.shutdown(ShutdownMode::Fast).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn report_policy_leaves_both_sides_alone() {
    let h = harness_with(|config| config.conflict_policy = ConflictPolicy::Report).await;
    let local = h.root.join("notes.txt");
    std::fs::write(&local, b"local edit").unwrap();
    h.history.record_file("/notes.txt", 100);
    h.remote
        .put_file("/notes.txt", b"remote edit", now_unix() + 1_000);

    h.engine.connect().await.unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);

    assert_eq!(std::fs::read(&local).unwrap(), b"local edit");
    assert_eq!(h.remote.get("/notes.txt").unwrap().data, b"remote edit");
    assert_eq!(transfers(&h.remote), Vec::<String>::new());

    h.engine.shutdown(ShutdownMode::Fast).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_download_ends_in_error_without_leftovers() {
    let h = harness().await;
    h.remote.put_file("/broken.bin", b"payload", 1_700_000_000);
    h.remote.fail_download("/broken.bin");

    h.engine.connect().await.unwrap();
    assert_eq!(h.engine.wait_settled().await, SyncState::Error);

    assert!(!h.root.join("broken.bin").exists());
    assert!(!h.history.contains("/broken.bin"));
    let work_dir = h.root.join(".ydsync");
    let leftovers: Vec<_> = std::fs::read_dir(&work_dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "partial"))
        .collect();
    assert!(leftovers.is_empty());

    h.engine.shutdown(ShutdownMode::Fast).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn locally_deleted_tree_is_removed_remotely() {
    let h = harness().await;
    h.remote.put_file("/old/gone.txt", b"bye", 1_700_000_000);
    h.history.record_dir("/old");
    h.history.record_file("/old/gone.txt", 1_700_000_000);

    h.engine.connect().await.unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);

    assert!(h.remote.get("/old").is_none());
    assert!(h.remote.get("/old/gone.txt").is_none());
    assert!(h.remote.mutations().contains(&"delete /old".to_string()));
    assert!(!h.history.contains("/old"));
    assert!(!h.history.contains("/old/gone.txt"));
    assert!(!h.root.join("old").exists());

    h.engine.shutdown(ShutdownMode::Fast).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deleted_directory_with_new_remote_file_is_not_removed_whole() {
    let h = harness().await;
    h.remote.put_file("/a/b.txt", b"old", 1_700_000_000);
    h.remote.put_file("/a/sub/c.txt", b"old too", 1_700_000_000);
    h.remote.put_file("/a/z.txt", b"fresh", 1_700_000_500);
    h.history.record_dir("/a");
    h.history.record_file("/a/b.txt", 1_700_000_000);
    h.history.record_dir("/a/sub");
    h.history.record_file("/a/sub/c.txt", 1_700_000_000);

    h.engine.connect().await.unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);

    let mut moved = transfers(&h.remote);
    moved.sort();
    assert_eq!(
        moved,
        vec!["delete /a/b.txt", "delete /a/sub", "download /a/z.txt"]
    );
    assert_eq!(h.remote.get("/a/z.txt").unwrap().data, b"fresh");
    assert!(h.remote.get("/a/b.txt").is_none());
    assert!(h.remote.get("/a/sub").is_none());

    let local = h.root.join("a/z.txt");
    assert_eq!(std::fs::read(&local).unwrap(), b"fresh");
    let mtime = mtime_secs(&std::fs::metadata(&local).unwrap());
    assert_eq!(h.history.file_mtime("/a/z.txt"), Some(mtime));
    assert_eq!(h.history.get("/a"), Some(HistoryMarker::Dir));
    assert!(!h.history.contains("/a/b.txt"));
    assert!(!h.history.contains("/a/sub"));

    h.remote.clear_calls();
    let outcome = h.engine.full_sync().unwrap().outcome().await;
    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);
    assert_eq!(transfers(&h.remote), Vec::<String>::new());

    h.engine.shutdown(ShutdownMode::Fast).await;
}

fn listings(remote: &MemoryRemote) -> Vec<String> {
    remote
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("list"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listing_spanning_several_pages_is_fully_reconciled() {
    let h = harness_with(|config| config.page_size = 2).await;
    for n in 1..=4 {
        h.remote
            .put_file(&format!("/pages/{n}.txt"), format!("page {n}").as_bytes(), 1_700_000_000);
    }

    h.engine.connect().await.unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);

    // Four entries fill two pages exactly; an empty third page ends the listing.
    assert_eq!(listings(&h.remote), vec!["list 0", "list 2", "list 4"]);
    let mut moved = transfers(&h.remote);
    moved.sort();
    assert_eq!(
        moved,
        vec![
            "download /pages/1.txt",
            "download /pages/2.txt",
            "download /pages/3.txt",
            "download /pages/4.txt",
        ]
    );
    for n in 1..=4 {
        let local = h.root.join(format!("pages/{n}.txt"));
        assert_eq!(std::fs::read(local).unwrap(), format!("page {n}").as_bytes());
    }

    h.remote.clear_calls();
    h.remote.put_file("/pages/5.txt", b"page 5", 1_700_000_000);
    let outcome = h.engine.full_sync().unwrap().outcome().await;
    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);
    assert_eq!(listings(&h.remote), vec!["list 0", "list 2", "list 4"]);
    assert_eq!(transfers(&h.remote), vec!["download /pages/5.txt"]);

    h.remote.clear_calls();
    let outcome = h.engine.full_sync().unwrap().outcome().await;
    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);
    assert_eq!(transfers(&h.remote), Vec::<String>::new());

    h.engine.shutdown(ShutdownMode::Fast).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_modes_travel_with_content() {
    let h = harness().await;
    let script = h.root.join("run.sh");
    std::fs::write(&script, b"#!/bin/sh").unwrap();
    std::fs::set_permissions(&script, Permissions::from_mode(0o751)).unwrap();
    h.remote.put_file("/bin/tool", b"binary", 1_700_000_000);
    h.remote.set_mode("/bin/tool", 0o700).await.unwrap();

    h.engine.connect().await.unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);

    assert_eq!(h.remote.get("/run.sh").unwrap().mode, Some(0o751));
    assert!(h.remote.calls().contains(&"setmode /run.sh 751".to_string()));
    let mode = std::fs::metadata(h.root.join("bin/tool"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o7777, 0o700);

    h.engine.shutdown(ShutdownMode::Fast).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn offline_start_reconnects_when_remote_returns() {
    let h = harness().await;
    h.remote.put_file("/a.txt", b"a", 1_700_000_000);
    h.remote.set_offline(true);

    assert_eq!(h.engine.connect().await.unwrap(), SyncState::NoNet);
    assert_eq!(h.engine.status_line(), format!("{}: no_net (offline)", h.root.display()));

    h.remote.set_offline(false);
    let mut state = h.engine.watch_state();
    tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|state| state.is_settled()),
    )
    .await
    .expect("engine did not reconnect")
    .unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);
    assert_eq!(std::fs::read(h.root.join("a.txt")).unwrap(), b"a");

    h.engine.shutdown(ShutdownMode::Fast).await;
}

#[tokio::test]
async fn missing_root_is_a_fault() {
    let dir = tempdir().unwrap();
    let config = EngineConfig::new(dir.path().join("not-there"));
    let remote = Arc::new(MemoryRemote::new());
    let engine = SyncEngine::new(config, remote.clone(), memory_history().await).unwrap();

    assert_eq!(engine.connect().await.unwrap(), SyncState::Fault);
    assert_eq!(engine.connect().await.unwrap(), SyncState::Fault);
    assert!(remote.calls().is_empty());

    engine.shutdown(ShutdownMode::Fast).await;
    assert_eq!(engine.state(), SyncState::Exit);
    assert!(matches!(
        engine.connect().await,
        Err(EngineError::ShutDown)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_changes_are_pushed_while_watching() {
    let h = harness().await;
    h.engine.connect().await.unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);

    std::fs::create_dir_all(h.root.join("new")).unwrap();
    // Give the recursive watch time to cover the new directory.
    tokio::time::sleep(Duration::from_millis(300)).await;
    std::fs::write(h.root.join("new/file.txt"), b"fresh").unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while h.remote.get("/new/file.txt").is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("local file was not uploaded");
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);
    assert_eq!(h.remote.get("/new/file.txt").unwrap().data, b"fresh");

    h.engine.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn excluded_paths_are_never_uploaded() {
    let h = harness().await;
    std::fs::create_dir_all(h.root.join("skip")).unwrap();
    std::fs::write(h.root.join("skip/secret.txt"), b"x").unwrap();
    std::fs::write(h.root.join("keep.txt"), b"y").unwrap();
    h.engine.add_exclusion("skip");
    assert!(h.engine.exclusions().contains(&h.root.join("skip")));

    h.engine.connect().await.unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);

    assert!(h.remote.get("/keep.txt").is_some());
    assert!(h.remote.get("/skip").is_none());
    assert!(h.remote.get("/skip/secret.txt").is_none());
    assert!(h.remote.get("/.ydsync").is_none());

    h.engine.shutdown(ShutdownMode::Fast).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_copy_is_brought_down_and_trash_is_emptied() {
    let h = harness().await;
    h.remote.put_file("/a.txt", b"original", 1_700_000_000);
    h.engine.connect().await.unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);

    let outcome = h.engine.copy("a.txt", "/b.txt").unwrap().outcome().await;
    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);
    assert_eq!(std::fs::read(h.root.join("b.txt")).unwrap(), b"original");

    let outcome = h.engine.trash().unwrap().outcome().await;
    assert_eq!(outcome, TaskOutcome::Success);
    assert!(h.remote.calls().contains(&"trash".to_string()));

    h.engine.shutdown(ShutdownMode::Fast).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_and_reconnect() {
    let h = harness().await;
    assert_eq!(
        h.engine.status_line(),
        format!("{}: none (disconnected)", h.root.display())
    );
    h.engine.connect().await.unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);

    h.engine.disconnect().await;
    assert_eq!(h.engine.state(), SyncState::None);

    h.remote.put_file("/later.txt", b"later", 1_700_000_000);
    h.engine.connect().await.unwrap();
    assert_eq!(quiesce(&h.engine).await, SyncState::Idle);
    assert_eq!(std::fs::read(h.root.join("later.txt")).unwrap(), b"later");

    h.engine.shutdown(ShutdownMode::Fast).await;
    assert!(h.engine.full_sync().is_err());
}
