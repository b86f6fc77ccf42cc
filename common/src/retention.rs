//! Retention sweeper
//!
//! Snapshots of a repo are removed once they are older than the retention window and no
//! symlink (at the destination root, in the snapshot directory or in one of the extra link
//! directories) points at them. The clock is
//! the [`Timestamp`] handed in by the caller.

use anyhow::Context;
use tracing::instrument;

use crate::engine::TransferEngine;
use crate::error::Result;
use crate::location;
use crate::timestamp::{self, Timestamp};

pub const DIFF_SUFFIX: &str = ".diff.txt";

pub const DEFAULT_DAYS: u32 = 61;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetentionWindow {
    /// Every unreferenced snapshot dated before now is removed.
    Immediate,
    /// Nothing is ever removed.
    Disabled,
    /// Unreferenced snapshots dated more than this many days ago are removed.
    Days(u32),
}

impl Default for RetentionWindow {
    fn default() -> Self {
        RetentionWindow::Days(DEFAULT_DAYS)
    }
}

impl std::fmt::Display for RetentionWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RetentionWindow::Immediate => write!(f, "None"),
            RetentionWindow::Disabled => write!(f, "0"),
            RetentionWindow::Days(days) => write!(f, "{days}"),
        }
    }
}

impl std::str::FromStr for RetentionWindow {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        if value.eq_ignore_ascii_case("none") {
            return Ok(RetentionWindow::Immediate);
        }
        let days = value
            .parse::<u32>()
            .with_context(|| format!("retention window {value:?} is neither a day count nor None"))?;
        Ok(match days {
            0 => RetentionWindow::Disabled,
            days => RetentionWindow::Days(days),
        })
    }
}

impl RetentionWindow {
    /// Snapshots dated before the returned instant may be removed; `None` means none may.
    pub fn cutoff(&self, now: Timestamp) -> Option<chrono::NaiveDateTime> {
        match self {
            RetentionWindow::Immediate => Some(now.datetime()),
            RetentionWindow::Disabled => None,
            RetentionWindow::Days(days) => {
                Some(Timestamp::from_datetime(now.days_before(*days)).midnight())
            }
        }
    }
}

/// Outcome of one sweep, all entries are snapshot names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<String>,
    pub referenced: Vec<String>,
    pub too_new: Vec<String>,
}

impl std::fmt::Display for SweepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "snapshots removed: {}\nsnapshots kept (referenced): {}\nsnapshots kept (too new): {}\n",
            self.removed.len(),
            self.referenced.len(),
            self.too_new.len()
        )
    }
}

fn is_reference(target: &str, snapshot: &str) -> bool {
    let target = target.trim_end_matches(location::SEP);
    target == snapshot
        || target
            .strip_suffix(snapshot)
            .is_some_and(|prefix| prefix.ends_with(location::SEP))
}

/// Sorts the snapshots of `repo` into removable, referenced and too new ones.
///
/// `snapshots` may contain unrelated names, only `{repo}-{timestamp}` entries are considered.
pub fn plan(
    repo: &str,
    snapshots: &[String],
    links: &[(String, String)],
    window: RetentionWindow,
    now: Timestamp,
) -> SweepReport {
    let mut report = SweepReport::default();
    let Some(cutoff) = window.cutoff(now) else {
        return report;
    };
    let pattern = format!(r"^{}-(?P<stamp>{})$", regex::escape(repo), timestamp::PATTERN);
    let Ok(re) = regex::Regex::new(&pattern) else {
        tracing::warn!("cannot build snapshot pattern for repo {:?}", repo);
        return report;
    };
    let mut snapshots = snapshots.to_vec();
    snapshots.sort();
    for snapshot in snapshots {
        let Some(captures) = re.captures(&snapshot) else {
            continue;
        };
        let stamp = match Timestamp::parse(&captures["stamp"]) {
            Ok(stamp) => stamp,
            Err(error) => {
                tracing::warn!("ignoring snapshot {:?}: {:#}", &snapshot, &error);
                continue;
            }
        };
        if stamp.midnight() >= cutoff {
            report.too_new.push(snapshot);
            continue;
        }
        let referrers = links
            .iter()
            .filter(|(_, target)| is_reference(target, &snapshot))
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>();
        if referrers.is_empty() {
            report.removed.push(snapshot);
        } else {
            tracing::info!(
                "keeping snapshot {:?}, referenced by {:?}",
                &snapshot,
                &referrers
            );
            report.referenced.push(snapshot);
        }
    }
    report
}

#[derive(Clone, Debug)]
pub struct Sweeper {
    pub snapshot_dir: String,
    /// Further directories whose symlinks count as references
    pub link_dirs: Vec<String>,
    pub window: RetentionWindow,
    pub now: Timestamp,
}

impl Sweeper {
    /// Removes the expired, unreferenced snapshots of `repo` and their diff records in one
    /// batch.
    #[instrument(skip(engine), fields(destination = engine.location().address()))]
    pub async fn sweep(&self, engine: &dyn TransferEngine, repo: &str) -> Result<SweepReport> {
        if self.window == RetentionWindow::Disabled {
            tracing::info!("skipping removal of old snapshots (retention window is 0)");
            return Ok(SweepReport::default());
        }
        tracing::info!(
            "removing unreferenced snapshots of {:?} (retention window: {})",
            repo,
            self.window
        );
        let snapshot_dir = location::as_dir(&[self.snapshot_dir.as_str()]);
        let snapshots = engine.list_dirs(&snapshot_dir).await?;
        let mut scanned = vec![String::new()];
        for dir in std::iter::once(&self.snapshot_dir).chain(&self.link_dirs) {
            let dir = location::as_file(&[dir.trim_start_matches(location::SEP)]);
            if !scanned.contains(&dir) {
                scanned.push(dir);
            }
        }
        let mut links = vec![];
        for dir in &scanned {
            let listed = if dir.is_empty() {
                String::new()
            } else {
                location::as_dir(&[dir.as_str()])
            };
            let found = engine.list_symlinks(&listed).await?;
            links.extend(
                found
                    .into_iter()
                    .map(|(name, target)| (location::join(&[dir.as_str(), name.as_str()]), target)),
            );
        }
        let report = plan(repo, &snapshots, &links, self.window, self.now);
        if !report.too_new.is_empty() {
            tracing::info!(
                "keeping snapshots newer than the retention window: {:?}",
                &report.too_new
            );
        }
        if report.removed.is_empty() {
            return Ok(report);
        }
        let paths = report
            .removed
            .iter()
            .flat_map(|snapshot| {
                let path = location::join(&[self.snapshot_dir.as_str(), snapshot.as_str()]);
                let diff = format!("{path}{DIFF_SUFFIX}");
                [path, diff]
            })
            .collect::<Vec<_>>();
        tracing::info!("removing old snapshots: {:?}", &paths);
        engine.remove_all(&paths).await?;
        Ok(report)
    }
}
