//! End-to-end behavior against the real filesystem and native backend

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use vigil_watcher::{
    ChangeEvent, ChangeKind, Result, Subscription, TargetStatus, WatchError, Watcher, WatcherConfig,
};

fn config() -> WatcherConfig {
    WatcherConfig {
        debounce_interval: Duration::from_millis(300),
        polling_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

fn workspace() -> Result<(TempDir, PathBuf)> {
    let temp_dir = TempDir::new()?;
    let root = temp_dir.path().canonicalize()?;
    Ok((temp_dir, root))
}

/// Collect everything delivered within `window`
fn drain_for(sub: &Subscription, window: Duration) -> Vec<ChangeEvent> {
    let deadline = Instant::now() + window;
    let mut events = Vec::new();
    while Instant::now() < deadline {
        match sub.try_recv() {
            Some(event) => events.push(event),
            None => thread::sleep(Duration::from_millis(10)),
        }
    }
    events
}

fn touching<'a>(events: &'a [ChangeEvent], path: &Path) -> Vec<&'a ChangeEvent> {
    events
        .iter()
        .filter(|e| match &e.kind {
            ChangeKind::Renamed { from, to } => from == path || to == path,
            _ => e.path == path,
        })
        .collect()
}

#[test]
fn test_create_then_writes_is_one_created() -> Result<()> {
    let (_guard, root) = workspace()?;
    let watcher = Watcher::new(config());
    let id = watcher.configure_target(&root, true, &[])?;
    let sub = watcher.subscribe();
    watcher.start()?;

    let file = root.join("a.txt");
    fs::write(&file, b"one")?;
    thread::sleep(Duration::from_millis(80));
    fs::write(&file, b"one two")?;
    thread::sleep(Duration::from_millis(80));
    fs::write(&file, b"one two three")?;

    let events = drain_for(&sub, Duration::from_millis(1500));
    let mine = touching(&events, &file);
    assert_eq!(mine.len(), 1, "{events:?}");
    assert_eq!(mine[0].kind, ChangeKind::Created);
    assert_eq!(mine[0].target, id);

    // Mirror already reflects the event
    assert_eq!(watcher.lookup(&file).map(|s| s.size), Some(13));
    watcher.stop()?;
    Ok(())
}

#[test]
fn test_rename_is_one_renamed() -> Result<()> {
    let (_guard, root) = workspace()?;
    let from = root.join("a.txt");
    let to = root.join("b.txt");
    fs::write(&from, b"payload")?;

    let watcher = Watcher::new(config());
    watcher.configure_target(&root, true, &[])?;
    let sub = watcher.subscribe();
    watcher.start()?;

    fs::rename(&from, &to)?;
    let events = drain_for(&sub, Duration::from_millis(1500));
    let mine: Vec<_> = events
        .iter()
        .filter(|e| e.path == from || e.path == to)
        .collect();
    assert_eq!(mine.len(), 1, "{events:?}");
    assert_eq!(
        mine[0].kind,
        ChangeKind::Renamed {
            from: from.clone(),
            to: to.clone()
        }
    );
    assert!(watcher.lookup(&from).is_none());
    assert!(watcher.lookup(&to).is_some());
    watcher.stop()?;
    Ok(())
}

#[test]
fn test_create_and_delete_in_one_window_is_silent() -> Result<()> {
    let (_guard, root) = workspace()?;
    let watcher = Watcher::new(config());
    watcher.configure_target(&root, true, &[])?;
    let sub = watcher.subscribe();
    watcher.start()?;

    let file = root.join("blip.tmp");
    fs::write(&file, b"x")?;
    fs::remove_file(&file)?;

    let events = drain_for(&sub, Duration::from_millis(1000));
    assert!(touching(&events, &file).is_empty(), "{events:?}");
    assert!(watcher.lookup(&file).is_none());
    watcher.stop()?;
    Ok(())
}

#[test]
fn test_delete_is_deleted() -> Result<()> {
    let (_guard, root) = workspace()?;
    let file = root.join("d.txt");
    fs::write(&file, b"d")?;

    let watcher = Watcher::new(config());
    watcher.configure_target(&root, true, &[])?;
    let sub = watcher.subscribe();
    watcher.start()?;

    fs::remove_file(&file)?;
    let events = drain_for(&sub, Duration::from_millis(1000));
    let mine = touching(&events, &file);
    assert_eq!(mine.len(), 1, "{events:?}");
    assert_eq!(mine[0].kind, ChangeKind::Deleted);
    watcher.stop()?;
    Ok(())
}

#[test]
fn test_new_directory_contents_are_reported() -> Result<()> {
    let (_guard, root) = workspace()?;
    let watcher = Watcher::new(config());
    watcher.configure_target(&root, true, &[])?;
    let sub = watcher.subscribe();
    watcher.start()?;

    let dir = root.join("fresh");
    fs::create_dir(&dir)?;
    fs::write(dir.join("early.txt"), b"e")?;

    let events = drain_for(&sub, Duration::from_millis(1200));
    assert_eq!(touching(&events, &dir).len(), 1, "{events:?}");
    let early = touching(&events, &dir.join("early.txt"));
    assert_eq!(early.len(), 1, "{events:?}");
    assert_eq!(early[0].kind, ChangeKind::Created);

    // The new directory is subscribed now
    let late = dir.join("late.txt");
    fs::write(&late, b"l")?;
    let events = drain_for(&sub, Duration::from_millis(1000));
    assert_eq!(touching(&events, &late).len(), 1, "{events:?}");
    watcher.stop()?;
    Ok(())
}

#[test]
fn test_excluded_paths_are_silent() -> Result<()> {
    let (_guard, root) = workspace()?;
    let watcher = Watcher::new(config());
    watcher.configure_target(&root, true, &["*.log".to_string()])?;
    let sub = watcher.subscribe();
    watcher.start()?;

    fs::write(root.join("noise.log"), b"n")?;
    fs::write(root.join("kept.txt"), b"k")?;

    let events = drain_for(&sub, Duration::from_millis(1000));
    assert!(touching(&events, &root.join("noise.log")).is_empty(), "{events:?}");
    assert_eq!(touching(&events, &root.join("kept.txt")).len(), 1);
    watcher.stop()?;
    Ok(())
}

#[test]
fn test_no_events_after_unregister() -> Result<()> {
    let (_guard, root) = workspace()?;
    let watcher = Watcher::new(config());
    let id = watcher.configure_target(&root, true, &[])?;
    let sub = watcher.subscribe();
    watcher.start()?;

    fs::write(root.join("pending.txt"), b"p")?;
    watcher.unregister(id)?;
    fs::write(root.join("after.txt"), b"a")?;

    let events = drain_for(&sub, Duration::from_millis(1000));
    assert!(events.is_empty(), "{events:?}");
    assert!(matches!(watcher.status(id), Err(WatchError::UnknownTarget(_))));
    watcher.stop()?;
    Ok(())
}

#[test]
fn test_overlapping_targets_publish_once() -> Result<()> {
    let (_guard, root) = workspace()?;
    let inner_root = root.join("inner");
    fs::create_dir(&inner_root)?;

    let watcher = Watcher::new(config());
    let outer = watcher.configure_target(&root, true, &[])?;
    let inner = watcher.configure_target(&inner_root, true, &[])?;
    let sub = watcher.subscribe();
    watcher.start()?;

    let file = inner_root.join("f.txt");
    fs::write(&file, b"f")?;
    let events = drain_for(&sub, Duration::from_millis(1200));
    let mine = touching(&events, &file);
    assert_eq!(mine.len(), 1, "{events:?}");
    assert_eq!(mine[0].target, inner);

    // Both mirrors saw it
    watcher.unregister(inner)?;
    assert!(watcher.lookup(&file).is_some());
    assert!(matches!(watcher.status(outer)?, TargetStatus::Active(_)));
    watcher.stop()?;
    Ok(())
}

#[test]
fn test_registration_errors() -> Result<()> {
    let (_guard, root) = workspace()?;
    let watcher = Watcher::new(config());

    let missing = watcher.configure_target(&root.join("missing"), true, &[]);
    assert!(matches!(missing, Err(WatchError::InvalidPath { .. })));

    watcher.configure_target(&root, true, &[])?;
    let duplicate = watcher.configure_target(&root, false, &[]);
    assert!(matches!(duplicate, Err(WatchError::DuplicateWatch { .. })));

    let sub = root.join("sub");
    fs::create_dir(&sub)?;
    let bad_glob = watcher.configure_target(&sub, true, &["a[".to_string()]);
    assert!(matches!(bad_glob, Err(WatchError::InvalidPattern { .. })));
    assert_eq!(watcher.targets().len(), 1);
    Ok(())
}

#[test]
fn test_saturated_consumer_drops_oldest() -> Result<()> {
    let (_guard, root) = workspace()?;
    let watcher = Watcher::new(config());
    watcher.configure_target(&root, true, &[])?;
    let slow = watcher.subscribe_with_capacity(10);
    let fast = watcher.subscribe_with_capacity(1000);
    watcher.start()?;

    for n in 0..30 {
        fs::write(root.join(format!("f{n:02}.txt")), b"x")?;
    }
    let seen = drain_for(&fast, Duration::from_millis(1500));
    assert!(seen.len() >= 30, "{seen:?}");

    let kept = slow.drain();
    assert_eq!(kept.len(), 10);
    assert_eq!(slow.dropped(), seen.len() as u64 - 10);
    assert_eq!(kept.last(), seen.last());
    watcher.stop()?;
    Ok(())
}

#[test]
fn test_hard_cap_bounds_latency_under_churn() -> Result<()> {
    let (_guard, root) = workspace()?;
    let file = root.join("busy.log");
    fs::write(&file, b"")?;

    let watcher = Watcher::new(config());
    watcher.configure_target(&root, true, &[])?;
    let sub = watcher.subscribe();
    watcher.start()?;

    let first_write = Instant::now();
    let mut first_event = None;
    while first_write.elapsed() < Duration::from_secs(6) {
        fs::write(&file, format!("{:?}", first_write.elapsed()))?;
        if first_event.is_none() && sub.try_recv().is_some() {
            first_event = Some(first_write.elapsed());
        }
        thread::sleep(Duration::from_millis(100));
    }

    let latency = first_event.unwrap_or_else(|| first_write.elapsed());
    assert!(latency <= Duration::from_millis(5500), "first event after {latency:?}");
    watcher.stop()?;
    Ok(())
}

#[test]
fn test_stop_flushes_pending_bursts() -> Result<()> {
    let (_guard, root) = workspace()?;
    let watcher = Watcher::new(WatcherConfig {
        debounce_interval: Duration::from_secs(2),
        ..config()
    });
    watcher.configure_target(&root, true, &[])?;
    let sub = watcher.subscribe();
    watcher.start()?;

    let file = root.join("late.txt");
    fs::write(&file, b"late")?;
    thread::sleep(Duration::from_millis(200));
    watcher.stop()?;

    let events = sub.drain();
    assert_eq!(touching(&events, &file).len(), 1, "{events:?}");
    Ok(())
}
