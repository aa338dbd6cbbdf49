
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::process::Command;

use grid_lite::worker::{ProcessTreeKiller, ProcfsTreeKiller};
use test_harness::assert_eventually;

/// Gone, or a zombie waiting to be reaped
fn is_dead(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rfind(')')
            .and_then(|i| stat[i + 1..].split_whitespace().next())
            .map_or(true, |state| state == "Z" || state == "X"),
        Err(_) => true,
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[tokio::test]
async fn test_kill_tree_reaches_background_children() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("child.pid");
    let mut shell = Command::new("sh")
        .arg("-c")
        .arg(format!("sleep 30 & echo $! > {}; wait", pidfile.display()))
        .spawn()
        .unwrap();
    let root = shell.id().unwrap();

    let path = pidfile.as_path();
    assert_eventually(
        || async move { read_pid(path).is_some() },
        Duration::from_secs(5),
        "background child never wrote its pid",
    )
    .await;
    let child = read_pid(&pidfile).unwrap();

    let tree = ProcfsTreeKiller::collect_tree(root).unwrap();
    assert_eq!(tree[0], root);
    assert!(tree.contains(&child));

    let signalled = ProcfsTreeKiller.kill_tree(root, Signal::SIGKILL).unwrap();
    assert!(signalled >= 2);

    let status = tokio::time::timeout(Duration::from_secs(5), shell.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    assert_eventually(
        || async move { is_dead(child) },
        Duration::from_secs(5),
        "background child survived the kill",
    )
    .await;
}

#[test]
fn test_kill_tree_of_missing_process_is_not_an_error() {
    // Far above any default pid_max
    let signalled = ProcfsTreeKiller
        .kill_tree(999_999_999, Signal::SIGKILL)
        .unwrap();
    assert_eq!(signalled, 0);
}
