//! Snapshot transactions
//!
//! One [`push`] creates a new snapshot on one destination and repoints its symlinks to it.
//! Before every forward step the inverse of that step is appended to a [`Log`]; when a step
//! fails the log is replayed backwards by [`unwind`], leaving the destination as it was.
//!
//! The steps, in order:
//! 1. refuse to overwrite an existing snapshot
//! 2. create the snapshot directory and push the content, hard-linking against `latest`
//! 3. store the transfer summary as `{snapshot}.diff.txt`
//! 4. for `latest` and every extra symlink: record the history, then repoint the symlink
//!
//! After a commit the retention sweeper runs; its failures are only logged.

use anyhow::{Context, anyhow};
use tracing::instrument;

use crate::engine::{EntryKind, TransferEngine, TransferSummary};
use crate::history;
use crate::location::{self, Location};
use crate::retention::{DIFF_SUFFIX, RetentionWindow, SweepReport, Sweeper};
use crate::timestamp::Timestamp;

pub const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
pub const DEFAULT_LATEST_POSTFIX: &str = "latest";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Started,
    ContentPushed,
    DiffRecorded,
    SymlinksUpdated,
    Committed,
    RolledBack,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            State::Started => "started",
            State::ContentPushed => "content pushed",
            State::DiffRecorded => "diff recorded",
            State::SymlinksUpdated => "symlinks updated",
            State::Committed => "committed",
            State::RolledBack => "rolled back",
        };
        write!(f, "{name}")
    }
}

/// Action undoing one completed (or partially completed) forward step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inverse {
    DeleteSnapshot(String),
    DeleteDiff(String),
    RestoreSymlink { path: String, target: String },
    RemoveSymlink(String),
    /// Puts back the history of the symlink at `path`.
    RestoreHistory { path: String, entries: Vec<String> },
    /// Removes the history of the symlink at the given path.
    RemoveHistory(String),
}

impl std::fmt::Display for Inverse {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Inverse::DeleteSnapshot(path) => write!(f, "delete snapshot {path:?}"),
            Inverse::DeleteDiff(path) => write!(f, "delete diff {path:?}"),
            Inverse::RestoreSymlink { path, target } => {
                write!(f, "restore symlink {path:?} -> {target:?}")
            }
            Inverse::RemoveSymlink(path) => write!(f, "remove symlink {path:?}"),
            Inverse::RestoreHistory { path, entries } => {
                write!(f, "restore history of {path:?} ({} entries)", entries.len())
            }
            Inverse::RemoveHistory(path) => write!(f, "remove history of {path:?}"),
        }
    }
}

impl Inverse {
    pub async fn apply(&self, engine: &dyn TransferEngine) -> crate::Result<()> {
        match self {
            Inverse::DeleteSnapshot(path) | Inverse::DeleteDiff(path) | Inverse::RemoveSymlink(path) => {
                engine.remove_all(std::slice::from_ref(path)).await
            }
            Inverse::RestoreSymlink { path, target } => engine.write_symlink(path, target).await,
            Inverse::RestoreHistory { path, entries } => history::write(engine, path, entries).await,
            Inverse::RemoveHistory(path) => engine.remove_all(&[history::sidecar_path(path)]).await,
        }
    }
}

/// Inverse actions of the steps taken so far, oldest first.
#[derive(Clone, Debug, Default)]
pub struct Log {
    steps: Vec<Inverse>,
}

impl Log {
    pub fn record(&mut self, inverse: Inverse) {
        tracing::debug!("recording inverse: {}", &inverse);
        self.steps.push(inverse);
    }

    pub fn steps(&self) -> &[Inverse] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Applies the inverses of `log` newest first. Failures are logged and counted, never raised.
#[instrument(skip_all, fields(destination = engine.location().address()))]
pub async fn unwind(engine: &dyn TransferEngine, log: Log) -> usize {
    let mut failures = 0;
    for inverse in log.steps.iter().rev() {
        tracing::info!("rollback: {}", inverse);
        if let Err(error) = inverse.apply(engine).await {
            tracing::warn!("rollback step \"{}\" failed: {:#}", inverse, &error);
            failures += 1;
        }
    }
    failures
}

/// Error type for snapshot transactions, keeps the state reached before the failure.
///
/// # Logging Convention
/// When logging this error, use `{:#}` or `{:?}` format to preserve the error chain:
/// ```ignore
/// tracing::error!("push failed: {:#}", &error);
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: crate::Error,
    pub state: State,
    /// Number of inverse steps that failed while rolling back
    pub unwind_failures: usize,
}

#[derive(Clone, Debug)]
pub struct Settings {
    /// Directory holding the snapshots, relative to the destination root
    pub snapshot_dir: String,
    /// Suffix of the symlink that always points at the newest snapshot
    pub latest_postfix: String,
    pub retention: RetentionWindow,
    /// Store the transfer summary next to each snapshot
    pub write_diff: bool,
    /// Time budget of the whole push; rollback is not limited by it
    pub timeout: Option<std::time::Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            snapshot_dir: DEFAULT_SNAPSHOT_DIR.to_string(),
            latest_postfix: DEFAULT_LATEST_POSTFIX.to_string(),
            retention: RetentionWindow::default(),
            write_diff: true,
            timeout: None,
        }
    }
}

/// Reduces a repo argument such as `/tmp/src/dir1/` to its last segment.
pub fn repo_name(repo: &str) -> String {
    location::basename(repo.trim_matches(location::SEP))
}

/// Names and paths of one snapshot, all relative to the destination root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub repo: String,
    pub snapshot_dir: String,
    pub timestamp: Timestamp,
}

impl Snapshot {
    pub fn new(repo: &str, snapshot_dir: &str, timestamp: Timestamp) -> Self {
        Self {
            repo: repo_name(repo),
            snapshot_dir: location::as_file(&[snapshot_dir.trim_start_matches(location::SEP)]),
            timestamp,
        }
    }

    pub fn name(&self) -> String {
        format!("{}-{}", self.repo, self.timestamp)
    }

    pub fn path(&self) -> String {
        location::join(&[self.snapshot_dir.as_str(), self.name().as_str()])
    }

    pub fn diff_path(&self) -> String {
        format!("{}{DIFF_SUFFIX}", self.path())
    }

    pub fn latest_path(&self, postfix: &str) -> String {
        let name = format!("{}-{postfix}", self.repo);
        location::join(&[self.snapshot_dir.as_str(), name.as_str()])
    }

    /// Target a symlink at `link` must have to point at this snapshot. Links inside the
    /// snapshot directory get the bare snapshot name.
    pub fn target_for(&self, link: &str) -> String {
        location::relative_path(&self.path(), &location::parent(link))
    }
}

/// Result of a committed push.
#[derive(Clone, Debug)]
pub struct PushOutcome {
    pub snapshot: String,
    pub summary: TransferSummary,
    /// Symlinks pointing at the new snapshot, `latest` first
    pub symlinks: Vec<String>,
    /// `None` when the retention sweep failed
    pub sweep: Option<SweepReport>,
}

impl std::fmt::Display for PushOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "snapshot: {}\nsymlinks: {}\n{}",
            self.snapshot,
            self.symlinks.join(", "),
            &self.summary
        )?;
        match &self.sweep {
            Some(report) => write!(f, "{report}"),
            None => writeln!(f, "retention sweep: failed"),
        }
    }
}

fn link_path(link: &str) -> String {
    location::as_file(&[link.trim_start_matches(location::SEP)])
}

struct Transaction<'a> {
    engine: &'a dyn TransferEngine,
    snapshot: Snapshot,
    deadline: Option<(tokio::time::Instant, std::time::Duration)>,
    log: Log,
    state: State,
}

impl Transaction<'_> {
    /// Runs one engine call, bounded by the push deadline.
    async fn step<T>(
        &self,
        action: impl std::future::Future<Output = crate::Result<T>>,
    ) -> crate::Result<T> {
        match self.deadline {
            Some((deadline, timeout)) => tokio::time::timeout_at(deadline, action)
                .await
                .map_err(|_| crate::Error::Timeout(timeout))?,
            None => action.await,
        }
    }

    async fn hardlink_base(&self, latest: &str) -> crate::Result<Option<String>> {
        if self.step(self.engine.symlink_target(latest)).await?.is_none() {
            tracing::info!("{:?} does not exist, pushing without a hard-link base", latest);
            return Ok(None);
        }
        let base = self
            .step(async {
                Ok::<_, crate::Error>(self.engine.resolve_symlink(latest, true, true).await)
            })
            .await?;
        if !self.step(self.engine.exists(&base)).await? {
            tracing::warn!(
                "{:?} points at missing {:?}, pushing without a hard-link base",
                latest,
                &base
            );
            return Ok(None);
        }
        Ok(Some(base))
    }

    async fn write_diff(&mut self, summary: &TransferSummary) -> crate::Result<()> {
        let diff_path = self.snapshot.diff_path();
        let staging = tempfile::Builder::new()
            .prefix("rsnap-diff-")
            .tempfile()
            .context("cannot create diff staging file")?;
        tokio::fs::write(staging.path(), summary.diff())
            .await
            .with_context(|| format!("failed writing {:?}", staging.path()))?;
        self.log.record(Inverse::DeleteDiff(diff_path.clone()));
        self.step(self.engine.push_file(staging.path(), &diff_path))
            .await
    }

    async fn update_symlink(&mut self, link: &str) -> crate::Result<()> {
        let target = self.snapshot.target_for(link);
        let existing = self.step(self.engine.entries(link)).await?;
        let previous = match existing.into_iter().next() {
            None => None,
            Some(entry) if entry.kind == EntryKind::Symlink => entry.symlink_target,
            Some(_) => {
                return Err(anyhow!("{link:?} exists and is not a symlink").into());
            }
        };
        let sidecar = self
            .step(async { Ok::<_, crate::Error>(history::load(self.engine, link).await) })
            .await?;
        let previous_entries = match sidecar {
            history::Sidecar::Entries(entries) => {
                self.log.record(Inverse::RestoreHistory {
                    path: link.to_string(),
                    entries: entries.clone(),
                });
                Some(entries)
            }
            history::Sidecar::Missing => {
                self.log.record(Inverse::RemoveHistory(link.to_string()));
                Some(vec![])
            }
            history::Sidecar::Unreadable => {
                tracing::warn!("leaving the unreadable history of {:?} untouched", link);
                None
            }
        };
        if let Some(entries) = previous_entries {
            self.step(history::record(self.engine, link, &entries, &target))
                .await?;
        }
        match previous {
            Some(previous) => self.log.record(Inverse::RestoreSymlink {
                path: link.to_string(),
                target: previous,
            }),
            None => self.log.record(Inverse::RemoveSymlink(link.to_string())),
        }
        self.step(self.engine.make_symlink(link, &target)).await
    }

    async fn run(
        &mut self,
        source: &Location,
        links: &[String],
        write_diff: bool,
    ) -> crate::Result<TransferSummary> {
        let snapshot_path = self.snapshot.path();
        if self.step(self.engine.exists(&snapshot_path)).await? {
            return Err(crate::Error::SnapshotExists(snapshot_path));
        }
        let base = self.hardlink_base(&links[0]).await?;
        self.log.record(Inverse::DeleteSnapshot(snapshot_path.clone()));
        self.step(self.engine.make_dir(&snapshot_path)).await?;
        let summary = self
            .step(self.engine.push(
                source,
                &location::as_dir(&[snapshot_path.as_str()]),
                base.as_deref(),
            ))
            .await?;
        self.state = State::ContentPushed;
        if write_diff {
            self.write_diff(&summary).await?;
        }
        self.state = State::DiffRecorded;
        for link in links {
            self.update_symlink(link).await?;
        }
        self.state = State::SymlinksUpdated;
        Ok(summary)
    }
}

/// Pushes `source` as a new snapshot of `repo` to the destination served by `engine`.
///
/// `latest` is always updated first, then `symlinks` in the given order (duplicates are
/// skipped). Symlink paths are relative to the destination root.
#[instrument(skip(engine, settings), fields(destination = engine.location().address()))]
pub async fn push(
    engine: &dyn TransferEngine,
    settings: &Settings,
    source: &Location,
    repo: &str,
    symlinks: &[String],
    now: Timestamp,
) -> Result<PushOutcome, Error> {
    let snapshot = Snapshot::new(repo, &settings.snapshot_dir, now);
    let mut links = vec![snapshot.latest_path(&settings.latest_postfix)];
    for link in symlinks.iter().map(|link| link_path(link)) {
        if !link.is_empty() && !links.contains(&link) {
            links.push(link);
        }
    }
    let mut transaction = Transaction {
        engine,
        snapshot: snapshot.clone(),
        deadline: settings
            .timeout
            .map(|timeout| (tokio::time::Instant::now() + timeout, timeout)),
        log: Log::default(),
        state: State::Started,
    };
    tracing::info!(
        "pushing {:?} as snapshot {:?}",
        source.address(),
        snapshot.path()
    );
    let summary = match transaction.run(source, &links, settings.write_diff).await {
        Ok(summary) => summary,
        Err(source) => {
            let state = transaction.state;
            tracing::error!(
                "push of {:?} failed ({}), rolling back: {:#}",
                snapshot.name(),
                state,
                &source
            );
            let unwind_failures = unwind(engine, std::mem::take(&mut transaction.log)).await;
            transaction.state = State::RolledBack;
            if unwind_failures > 0 {
                tracing::warn!(
                    "{:?} {} with {} failed rollback step(s)",
                    snapshot.name(),
                    transaction.state,
                    unwind_failures
                );
            } else {
                tracing::info!("{:?} {}", snapshot.name(), transaction.state);
            }
            return Err(Error {
                source,
                state,
                unwind_failures,
            });
        }
    };
    transaction.state = State::Committed;
    tracing::info!("snapshot {:?} {}", snapshot.name(), transaction.state);
    let sweeper = Sweeper {
        snapshot_dir: snapshot.snapshot_dir.clone(),
        link_dirs: links.iter().map(|link| location::parent(link)).collect(),
        window: settings.retention,
        now,
    };
    let sweep = match transaction
        .step(sweeper.sweep(engine, &snapshot.repo))
        .await
    {
        Ok(report) => Some(report),
        Err(error) => {
            tracing::warn!("retention sweep failed for {:?}: {:#}", snapshot.repo, &error);
            None
        }
    };
    Ok(PushOutcome {
        snapshot: snapshot.name(),
        summary,
        symlinks: links,
        sweep,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Settings as EngineSettings, local::LocalEngine};
    use crate::testutils::{self, FailingEngine, Fault};
    use std::os::unix::fs::MetadataExt;
    use tracing_test::traced_test;

    fn stamp(value: &str) -> Timestamp {
        Timestamp::parse(value).unwrap()
    }

    fn local_engine(root: &std::path::Path) -> LocalEngine {
        let location = Location::parse(root.to_str().unwrap()).unwrap();
        LocalEngine::new(location, &EngineSettings::default())
    }

    fn retained() -> Settings {
        Settings {
            retention: RetentionWindow::Disabled,
            ..Default::default()
        }
    }

    #[test]
    fn snapshot_paths() {
        let snapshot = Snapshot::new("/tmp/src/dir1/", "snapshots/", stamp("2015-06-18-104259"));
        assert_eq!(snapshot.repo, "dir1");
        assert_eq!(snapshot.name(), "dir1-2015-06-18-104259");
        assert_eq!(snapshot.path(), "snapshots/dir1-2015-06-18-104259");
        assert_eq!(
            snapshot.diff_path(),
            "snapshots/dir1-2015-06-18-104259.diff.txt"
        );
        assert_eq!(snapshot.latest_path("latest"), "snapshots/dir1-latest");
        assert_eq!(
            snapshot.target_for("snapshots/dir1-latest"),
            "dir1-2015-06-18-104259"
        );
        assert_eq!(
            snapshot.target_for("dir1"),
            "snapshots/dir1-2015-06-18-104259"
        );
        assert_eq!(
            snapshot.target_for("releases/stable/dir1"),
            "../../snapshots/dir1-2015-06-18-104259"
        );
    }

    #[tokio::test]
    async fn push_creates_snapshot_symlinks_and_history() {
        let tmp = tempfile::tempdir().unwrap();
        let source = testutils::setup_source(tmp.path()).await.unwrap();
        let root = tmp.path().join("dest");
        let engine = local_engine(&root);
        let outcome = push(
            &engine,
            &retained(),
            &source,
            "dir1",
            &["dir1".to_string()],
            stamp("2015-06-18-104259"),
        )
        .await
        .unwrap();
        assert_eq!(outcome.snapshot, "dir1-2015-06-18-104259");
        assert_eq!(outcome.symlinks, vec!["snapshots/dir1-latest", "dir1"]);
        assert_eq!(outcome.summary.files_copied, 3);
        let snapshot = root.join("snapshots/dir1-2015-06-18-104259");
        assert_eq!(std::fs::read_to_string(snapshot.join("0.txt")).unwrap(), "0");
        assert_eq!(
            std::fs::read_link(root.join("snapshots/dir1-latest")).unwrap(),
            std::path::PathBuf::from("dir1-2015-06-18-104259")
        );
        assert_eq!(
            std::fs::read_link(root.join("dir1")).unwrap(),
            std::path::PathBuf::from("snapshots/dir1-2015-06-18-104259")
        );
        assert_eq!(
            std::fs::read_to_string(root.join("snapshots/dir1-latest.target.txt")).unwrap(),
            "dir1-2015-06-18-104259\n"
        );
        let diff =
            std::fs::read_to_string(root.join("snapshots/dir1-2015-06-18-104259.diff.txt"))
                .unwrap();
        assert!(diff.contains("files copied: 3"));
    }

    #[tokio::test]
    async fn second_push_links_unchanged_files() {
        let tmp = tempfile::tempdir().unwrap();
        let source = testutils::setup_source(tmp.path()).await.unwrap();
        let root = tmp.path().join("dest");
        let engine = local_engine(&root);
        push(&engine, &retained(), &source, "dir1", &[], stamp("2015-06-18-104259"))
            .await
            .unwrap();
        std::fs::write(tmp.path().join("dir1/bar/1.txt"), "changed").unwrap();
        let outcome = push(&engine, &retained(), &source, "dir1", &[], stamp("2015-06-18-104300"))
            .await
            .unwrap();
        assert_eq!(outcome.summary.files_copied, 1);
        assert_eq!(outcome.summary.files_linked, 2);
        let unchanged = root.join("snapshots/dir1-2015-06-18-104300/0.txt");
        assert!(std::fs::metadata(unchanged).unwrap().nlink() >= 2);
        assert_eq!(
            history::read(&engine, "snapshots/dir1-latest").await,
            vec!["dir1-2015-06-18-104300", "dir1-2015-06-18-104259"]
        );
    }

    #[tokio::test]
    async fn failed_symlink_update_rolls_back_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let source = testutils::setup_source(tmp.path()).await.unwrap();
        let root = tmp.path().join("dest");
        let engine = local_engine(&root);
        push(&engine, &retained(), &source, "dir1", &[], stamp("2015-06-18-104259"))
            .await
            .unwrap();
        let failing = FailingEngine::new(local_engine(&root), Fault::Symlink("stable".to_string()));
        let error = push(
            &failing,
            &retained(),
            &source,
            "dir1",
            &["stable".to_string()],
            stamp("2015-06-18-104300"),
        )
        .await
        .unwrap_err();
        assert_eq!(error.state, State::DiffRecorded);
        assert_eq!(error.unwind_failures, 0);
        assert!(!root.join("snapshots/dir1-2015-06-18-104300").exists());
        assert!(!root.join("snapshots/dir1-2015-06-18-104300.diff.txt").exists());
        assert_eq!(
            std::fs::read_link(root.join("snapshots/dir1-latest")).unwrap(),
            std::path::PathBuf::from("dir1-2015-06-18-104259")
        );
        assert!(std::fs::symlink_metadata(root.join("stable")).is_err());
        assert!(!root.join("stable.target.txt").exists());
        assert_eq!(
            history::read(&engine, "snapshots/dir1-latest").await,
            vec!["dir1-2015-06-18-104259"]
        );
    }

    #[tokio::test]
    async fn failed_push_removes_partial_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let source = testutils::setup_source(tmp.path()).await.unwrap();
        let root = tmp.path().join("dest");
        let failing = FailingEngine::new(local_engine(&root), Fault::Push);
        let error = push(&failing, &retained(), &source, "dir1", &[], stamp("2015-06-18-104259"))
            .await
            .unwrap_err();
        assert_eq!(error.state, State::Started);
        assert!(matches!(error.source, crate::Error::Transport(_)));
        assert!(!root.join("snapshots/dir1-2015-06-18-104259").exists());
        assert!(std::fs::symlink_metadata(root.join("snapshots/dir1-latest")).is_err());
    }

    #[tokio::test]
    async fn timeout_rolls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let source = testutils::setup_source(tmp.path()).await.unwrap();
        let root = tmp.path().join("dest");
        let failing = FailingEngine::new(
            local_engine(&root),
            Fault::SlowPush(std::time::Duration::from_secs(30)),
        );
        let settings = Settings {
            timeout: Some(std::time::Duration::from_millis(200)),
            ..retained()
        };
        let error = push(&failing, &settings, &source, "dir1", &[], stamp("2015-06-18-104259"))
            .await
            .unwrap_err();
        assert!(matches!(error.source, crate::Error::Timeout(_)));
        assert!(!root.join("snapshots/dir1-2015-06-18-104259").exists());
    }

    #[tokio::test]
    async fn existing_snapshot_is_never_touched() {
        let tmp = tempfile::tempdir().unwrap();
        let source = testutils::setup_source(tmp.path()).await.unwrap();
        let root = tmp.path().join("dest");
        let engine = local_engine(&root);
        let now = stamp("2015-06-18-104259");
        push(&engine, &retained(), &source, "dir1", &[], now)
            .await
            .unwrap();
        let error = push(&engine, &retained(), &source, "dir1", &[], now)
            .await
            .unwrap_err();
        assert!(matches!(error.source, crate::Error::SnapshotExists(_)));
        assert!(root.join("snapshots/dir1-2015-06-18-104259/0.txt").exists());
        assert_eq!(
            history::read(&engine, "snapshots/dir1-latest").await,
            vec!["dir1-2015-06-18-104259"]
        );
    }

    #[tokio::test]
    async fn refuses_to_replace_a_directory_with_a_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let source = testutils::setup_source(tmp.path()).await.unwrap();
        let root = tmp.path().join("dest");
        std::fs::create_dir_all(root.join("dir1/keep")).unwrap();
        let engine = local_engine(&root);
        let error = push(
            &engine,
            &retained(),
            &source,
            "dir1",
            &["dir1".to_string()],
            stamp("2015-06-18-104259"),
        )
        .await
        .unwrap_err();
        assert_eq!(error.state, State::DiffRecorded);
        assert!(root.join("dir1/keep").is_dir());
        assert!(!root.join("snapshots/dir1-2015-06-18-104259").exists());
        assert!(std::fs::symlink_metadata(root.join("snapshots/dir1-latest")).is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn sweep_failure_does_not_fail_the_push() {
        let tmp = tempfile::tempdir().unwrap();
        let source = testutils::setup_source(tmp.path()).await.unwrap();
        let root = tmp.path().join("dest");
        std::fs::create_dir_all(root.join("snapshots/dir1-2015-01-01-000000")).unwrap();
        let failing = FailingEngine::new(local_engine(&root), Fault::RemoveAll);
        let settings = Settings {
            retention: RetentionWindow::Immediate,
            ..Default::default()
        };
        let outcome = push(&failing, &settings, &source, "dir1", &[], stamp("2015-06-18-104259"))
            .await
            .unwrap();
        assert!(outcome.sweep.is_none());
        assert!(root.join("snapshots/dir1-2015-01-01-000000").exists());
        assert!(logs_contain("retention sweep failed"));
    }

    #[tokio::test]
    async fn committed_push_sweeps_old_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let source = testutils::setup_source(tmp.path()).await.unwrap();
        let root = tmp.path().join("dest");
        std::fs::create_dir_all(root.join("snapshots/dir1-2015-01-01-000000")).unwrap();
        std::fs::write(root.join("snapshots/dir1-2015-01-01-000000.diff.txt"), "x").unwrap();
        let engine = local_engine(&root);
        let settings = Settings {
            retention: RetentionWindow::Days(14),
            ..Default::default()
        };
        let outcome = push(&engine, &settings, &source, "dir1", &[], stamp("2015-06-18-104259"))
            .await
            .unwrap();
        let sweep = outcome.sweep.unwrap();
        assert_eq!(sweep.removed, vec!["dir1-2015-01-01-000000"]);
        assert_eq!(sweep.too_new, vec!["dir1-2015-06-18-104259"]);
        assert!(!root.join("snapshots/dir1-2015-01-01-000000").exists());
        assert!(!root.join("snapshots/dir1-2015-01-01-000000.diff.txt").exists());
    }

    #[tokio::test]
    async fn sweep_keeps_snapshots_behind_nested_extra_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let source = testutils::setup_source(tmp.path()).await.unwrap();
        let root = tmp.path().join("dest");
        let engine = local_engine(&root);
        let settings = Settings {
            retention: RetentionWindow::Days(14),
            ..Default::default()
        };
        push(
            &engine,
            &settings,
            &source,
            "dir1",
            &["releases/v1".to_string()],
            stamp("2015-06-01-000000"),
        )
        .await
        .unwrap();
        let outcome = push(
            &engine,
            &settings,
            &source,
            "dir1",
            &["releases/v2".to_string()],
            stamp("2015-06-18-104259"),
        )
        .await
        .unwrap();
        let sweep = outcome.sweep.unwrap();
        assert!(sweep.removed.is_empty());
        assert_eq!(sweep.referenced, vec!["dir1-2015-06-01-000000"]);
        assert!(root.join("releases/v1/0.txt").exists());
        assert!(root.join("releases/v2/0.txt").exists());
    }

    #[tokio::test]
    async fn unreadable_history_survives_push_and_rollback() {
        let tmp = tempfile::tempdir().unwrap();
        let source = testutils::setup_source(tmp.path()).await.unwrap();
        let root = tmp.path().join("dest");
        let engine = local_engine(&root);
        push(&engine, &retained(), &source, "dir1", &[], stamp("2015-06-18-104259"))
            .await
            .unwrap();
        let sidecar = root.join("snapshots/dir1-latest.target.txt");
        let garbled = b"dir1-2015-06-18-104259\n\xff old entry\n".to_vec();
        std::fs::write(&sidecar, &garbled).unwrap();
        let failing = FailingEngine::new(local_engine(&root), Fault::Symlink("stable".to_string()));
        let error = push(
            &failing,
            &retained(),
            &source,
            "dir1",
            &["stable".to_string()],
            stamp("2015-06-18-104300"),
        )
        .await
        .unwrap_err();
        assert_eq!(error.state, State::DiffRecorded);
        assert_eq!(error.unwind_failures, 0);
        assert_eq!(std::fs::read(&sidecar).unwrap(), garbled);
        push(&engine, &retained(), &source, "dir1", &[], stamp("2015-06-18-104301"))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_link(root.join("snapshots/dir1-latest")).unwrap(),
            std::path::PathBuf::from("dir1-2015-06-18-104301")
        );
        assert_eq!(std::fs::read(&sidecar).unwrap(), garbled);
    }

    #[tokio::test]
    async fn unwind_counts_failed_steps() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("snapshots/one")).unwrap();
        std::os::unix::fs::symlink("one", root.join("snapshots/latest")).unwrap();
        let failing = FailingEngine::new(local_engine(root), Fault::RemoveAll);
        let mut log = Log::default();
        log.record(Inverse::DeleteSnapshot("snapshots/one".to_string()));
        log.record(Inverse::RestoreSymlink {
            path: "snapshots/latest".to_string(),
            target: "two".to_string(),
        });
        assert_eq!(log.steps().len(), 2);
        assert_eq!(unwind(&failing, log).await, 1);
        assert_eq!(
            std::fs::read_link(root.join("snapshots/latest")).unwrap(),
            std::path::PathBuf::from("two")
        );
        assert!(root.join("snapshots/one").exists());
    }
}
