//! End-to-end runs of `rsnap` against local destinations.

use assert_cmd::Command;
use predicates::prelude::*;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

const FIRST: &str = "2015-06-18-104259";
const SECOND: &str = "2015-06-18-104300";

fn rsnap() -> Command {
    Command::cargo_bin("rsnap").unwrap()
}

fn setup_source(tmp: &Path) -> std::path::PathBuf {
    let dir1 = tmp.join("src/dir1");
    std::fs::create_dir_all(dir1.join("bar")).unwrap();
    std::fs::write(dir1.join("0.txt"), "0").unwrap();
    std::fs::write(dir1.join("bar/1.txt"), "1").unwrap();
    dir1
}

fn push(source: &Path, dest: &Path, timestamp: &str) -> assert_cmd::assert::Assert {
    rsnap()
        .args(["push", source.to_str().unwrap(), "dir1", "--dest"])
        .arg(dest)
        .args(["--timestamp", timestamp, "--retention-window", "14"])
        .assert()
}

fn read_link(path: &Path) -> String {
    std::fs::read_link(path)
        .unwrap()
        .to_string_lossy()
        .into_owned()
}

#[test]
fn push_twice_then_get_target_and_remove() {
    let tmp = tempfile::tempdir().unwrap();
    let source = setup_source(tmp.path());
    let dest = tmp.path().join("dst");
    push(&source, &dest, FIRST)
        .success()
        .stdout(predicate::str::contains("1 of 1 destination(s) succeeded"));
    let first = dest.join(format!("snapshots/dir1-{FIRST}"));
    assert_eq!(std::fs::read_to_string(first.join("0.txt")).unwrap(), "0");
    assert_eq!(std::fs::read_to_string(first.join("bar/1.txt")).unwrap(), "1");
    assert_eq!(read_link(&dest.join("dir1")), format!("snapshots/dir1-{FIRST}"));
    assert_eq!(
        read_link(&dest.join("snapshots/dir1-latest")),
        format!("dir1-{FIRST}")
    );
    assert_eq!(
        std::fs::read_to_string(dest.join("snapshots/dir1-latest.target.txt")).unwrap(),
        format!("dir1-{FIRST}\n")
    );
    assert!(dest.join(format!("snapshots/dir1-{FIRST}.diff.txt")).exists());

    std::fs::write(source.join("bar/1.txt"), "changed").unwrap();
    push(&source, &dest, SECOND).success();
    let second = dest.join(format!("snapshots/dir1-{SECOND}"));
    assert_eq!(
        std::fs::read_to_string(second.join("bar/1.txt")).unwrap(),
        "changed"
    );
    assert_eq!(read_link(&dest.join("dir1")), format!("snapshots/dir1-{SECOND}"));
    assert_eq!(
        std::fs::read_to_string(dest.join("snapshots/dir1-latest.target.txt")).unwrap(),
        format!("dir1-{SECOND}\ndir1-{FIRST}\n")
    );
    let unchanged = std::fs::metadata(second.join("0.txt")).unwrap();
    assert!(unchanged.nlink() >= 2);
    assert_eq!(
        unchanged.ino(),
        std::fs::metadata(first.join("0.txt")).unwrap().ino()
    );

    rsnap()
        .args(["get-target", "snapshots/dir1-latest", "--absolute", "--dest"])
        .arg(&dest)
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "OK snapshots/dir1-{SECOND}"
        )));

    rsnap()
        .args(["remove", &format!("snapshots/dir1-{FIRST}"), "--dest"])
        .arg(&dest)
        .assert()
        .success();
    assert!(!first.exists());
    assert!(second.join("0.txt").exists());
}

#[test]
fn failing_destination_sets_exit_code() {
    let tmp = tempfile::tempdir().unwrap();
    let source = setup_source(tmp.path());
    let healthy = tmp.path().join("healthy");
    let blocked = tmp.path().join("blocked");
    std::fs::write(&blocked, "not a directory").unwrap();
    rsnap()
        .args(["push", source.to_str().unwrap(), "dir1", "--timestamp", FIRST])
        .arg("--dest")
        .arg(&blocked)
        .arg("--dest")
        .arg(&healthy)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("FAILED"))
        .stdout(predicate::str::contains("1 of 2 destination(s) succeeded"));
    assert!(healthy.join(format!("snapshots/dir1-{FIRST}/0.txt")).exists());
    assert_eq!(
        std::fs::read_to_string(&blocked).unwrap(),
        "not a directory"
    );
}

#[test]
fn existing_snapshot_is_not_overwritten() {
    let tmp = tempfile::tempdir().unwrap();
    let source = setup_source(tmp.path());
    let dest = tmp.path().join("dst");
    push(&source, &dest, FIRST).success();
    std::fs::write(source.join("0.txt"), "new").unwrap();
    push(&source, &dest, FIRST).code(1);
    assert_eq!(
        std::fs::read_to_string(dest.join(format!("snapshots/dir1-{FIRST}/0.txt"))).unwrap(),
        "0"
    );
    assert_eq!(
        std::fs::read_to_string(dest.join("snapshots/dir1-latest.target.txt")).unwrap(),
        format!("dir1-{FIRST}\n")
    );
}

#[test]
fn extra_symlinks_without_repo_symlink() {
    let tmp = tempfile::tempdir().unwrap();
    let source = setup_source(tmp.path());
    let dest = tmp.path().join("dst");
    rsnap()
        .args(["push", source.to_str().unwrap(), "/tmp/src/dir1/"])
        .arg("--dest")
        .arg(&dest)
        .args(["--timestamp", FIRST, "--no-repo-symlink", "--no-diff"])
        .args(["--symlinks", "stable", "releases/current"])
        .assert()
        .success();
    assert!(std::fs::symlink_metadata(dest.join("dir1")).is_err());
    assert!(!dest.join(format!("snapshots/dir1-{FIRST}.diff.txt")).exists());
    assert_eq!(read_link(&dest.join("stable")), format!("snapshots/dir1-{FIRST}"));
    assert_eq!(
        read_link(&dest.join("releases/current")),
        format!("../snapshots/dir1-{FIRST}")
    );
}

#[test]
fn one_dest_flag_takes_several_addresses() {
    let tmp = tempfile::tempdir().unwrap();
    let source = setup_source(tmp.path());
    let first = tmp.path().join("first");
    let second = tmp.path().join("second");
    rsnap()
        .args(["push", source.to_str().unwrap(), "dir1", "--dest"])
        .arg(&first)
        .arg(&second)
        .args(["--timestamp", FIRST])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 of 2 destination(s) succeeded"));
    for dest in [&first, &second] {
        assert_eq!(
            std::fs::read_to_string(dest.join(format!("snapshots/dir1-{FIRST}/0.txt"))).unwrap(),
            "0"
        );
        assert_eq!(read_link(&dest.join("dir1")), format!("snapshots/dir1-{FIRST}"));
    }
}
