use anyhow::{Context, anyhow};
use async_trait::async_trait;
use std::sync::LazyLock;
use tracing::instrument;

use super::{Entry, EntryKind, Settings, TransferEngine, TransferSummary, is_contents};
use crate::error::Result;
use crate::location::{self, Location, Scheme};

/// Options passed to every rsync invocation.
const BASE_OPTIONS: [&str; 3] = ["-v", "--no-owner", "--no-group"];

/// Options used for content pushes. Itemizing twice makes rsync report files hard-linked
/// against `--link-dest` as well.
const PUSH_OPTIONS: [&str; 6] = [
    "--archive",
    "--force",
    "--ignore-errors",
    "--delete",
    "--itemize-changes",
    "--itemize-changes",
];

/// rsync exit code for a partial transfer, which is what listing a missing path yields.
const PARTIAL_TRANSFER: i32 = 23;

static LISTING: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^(?P<type>[-dlbcps])\S{9}\S*\s+[\d,.]+\s+\S+\s+\S+\s+(?P<name>.+)$")
        .unwrap()
});

// `YXcstpoguax` followed by the path; unchanged attributes are blanked out
static ITEMIZED: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^(?P<flags>[<>ch.*][\w.+? ]{10}) (?P<path>.+)$").unwrap());

/// Engine driving the `rsync` binary against a remote-shell or rsync-daemon destination.
#[derive(Debug)]
pub struct RsyncEngine {
    location: Location,
    settings: Settings,
}

fn parse_listing(output: &str) -> Vec<Entry> {
    output
        .lines()
        .filter_map(|line| {
            let captures = LISTING.captures(line.trim_end())?;
            let name = captures.name("name")?.as_str();
            let entry = match &captures["type"] {
                "d" => Entry::new(name, EntryKind::Dir),
                "-" => Entry::new(name, EntryKind::File),
                "l" => match name.split_once(" -> ") {
                    Some((name, target)) => Entry::symlink(name, target),
                    None => Entry::new(name, EntryKind::Symlink),
                },
                _ => Entry::new(name, EntryKind::Other),
            };
            (entry.name != ".").then_some(entry)
        })
        .collect()
}

fn parse_itemized(output: &str) -> TransferSummary {
    let mut summary = TransferSummary::default();
    for line in output.lines() {
        let Some(captures) = ITEMIZED.captures(line) else {
            continue;
        };
        let flags = &captures["flags"];
        if flags.starts_with('.') && flags[2..].trim().is_empty() {
            continue;
        }
        match &flags[..2] {
            ">f" | "<f" => summary.files_copied += 1,
            "hf" => {
                summary.files_linked += 1;
                continue;
            }
            "cL" => summary.symlinks_created += 1,
            "cd" => summary.directories_created += 1,
            _ => {}
        }
        summary.changes.push(line.to_string());
    }
    summary
}

fn push_args(source: &Location, dest: &str, hardlink_base: Option<&str>) -> Vec<String> {
    let mut args = PUSH_OPTIONS.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    if let Some(base) = hardlink_base {
        // a relative --link-dest is resolved against the destination directory
        let base = location::relative_path(&location::as_file(&[base]), &location::as_file(&[dest]));
        args.push(format!("--link-dest={base}"));
    }
    args.push(location::as_dir(&[source.url()]));
    args
}

/// Names to remove, grouped by the directory holding them.
fn group_by_parent(paths: &[String]) -> std::collections::BTreeMap<String, Vec<String>> {
    let mut by_dir = std::collections::BTreeMap::<String, Vec<String>>::new();
    for path in paths {
        let object = location::as_file(&[path.trim_start_matches(location::SEP)]);
        if object.is_empty() {
            continue;
        }
        let names = by_dir.entry(location::parent(&object)).or_default();
        let name = location::basename(&object);
        if !names.contains(&name) {
            names.push(name);
        }
    }
    by_dir
}

/// Filter merge file removing exactly `names` from a directory.
fn removal_filter(names: &[String]) -> String {
    let mut content = String::new();
    for name in names {
        content.push_str(&format!("+ /{name}\n"));
    }
    content.push_str("- *\n");
    content
}

fn scratch_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("rsnap-")
        .tempdir()
        .context("cannot create scratch directory")
}

fn dir_arg(path: &std::path::Path) -> String {
    location::as_dir(&[path.to_string_lossy()])
}

impl RsyncEngine {
    pub fn new(location: Location, settings: &Settings) -> Self {
        Self {
            location,
            settings: settings.clone(),
        }
    }

    /// Runs rsync with `args` after the common options, returning its output whatever the exit
    /// status.
    async fn run(&self, args: &[String]) -> anyhow::Result<std::process::Output> {
        let mut cmd = tokio::process::Command::new(&self.settings.rsync_binary);
        cmd.args(BASE_OPTIONS)
            .args(&self.settings.extra_options)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        tracing::debug!("running {:?}", &cmd);
        cmd.output().await.with_context(|| {
            format!(
                "failed to run {:?}",
                self.settings.rsync_binary.to_string_lossy()
            )
        })
    }

    /// Like `run`, failing on any non-zero exit status.
    async fn run_checked(&self, args: &[String]) -> anyhow::Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(anyhow!(
                "rsync {:?} failed with {}: {}",
                args,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Like `run`, returning `None` when the source does not exist.
    async fn run_optional(&self, args: &[String]) -> anyhow::Result<Option<String>> {
        let output = self.run(args).await?;
        if output.status.code() == Some(PARTIAL_TRANSFER) {
            tracing::debug!(
                "rsync {:?}: {}",
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }
        if !output.status.success() {
            return Err(anyhow!(
                "rsync {:?} failed with {}: {}",
                args,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).to_string()))
    }

    fn url(&self, path: &str) -> String {
        if is_contents(path) {
            self.location.url_dir(&[path])
        } else {
            self.location.url_file(&[path])
        }
    }
}

#[async_trait]
impl TransferEngine for RsyncEngine {
    fn location(&self) -> &Location {
        &self.location
    }

    async fn entries(&self, path: &str) -> Result<Vec<Entry>> {
        let args = vec!["--no-v".to_string(), "-l".to_string(), self.url(path)];
        let listing = self.run_optional(&args).await?;
        Ok(listing.as_deref().map(parse_listing).unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn push(
        &self,
        source: &Location,
        dest: &str,
        hardlink_base: Option<&str>,
    ) -> Result<TransferSummary> {
        let mut args = push_args(source, dest, hardlink_base);
        args.push(self.location.url_dir(&[dest]));
        tracing::info!("pushing {:?} to {:?}", source.address(), self.location.url_dir(&[dest]));
        let output = self.run_checked(&args).await?;
        let mut summary = parse_itemized(&output);
        summary.changes.sort();
        Ok(summary)
    }

    async fn push_file(&self, local: &std::path::Path, dest: &str) -> Result<()> {
        let args = vec![
            local.to_string_lossy().to_string(),
            self.location.url_file(&[dest]),
        ];
        self.run_checked(&args).await?;
        Ok(())
    }

    async fn fetch_file(&self, path: &str) -> Result<Option<String>> {
        let scratch = scratch_dir()?;
        let args = vec![self.location.url_file(&[path]), dir_arg(scratch.path())];
        if self.run_optional(&args).await?.is_none() {
            return Ok(None);
        }
        let local = scratch.path().join(location::basename(path));
        let contents = tokio::fs::read_to_string(&local)
            .await
            .with_context(|| format!("failed reading fetched file {local:?}"))?;
        Ok(Some(contents))
    }

    async fn write_symlink(&self, path: &str, target: &str) -> Result<()> {
        let object = location::as_file(&[path]);
        let scratch = scratch_dir()?;
        let link = scratch.path().join(location::basename(&object));
        tokio::fs::symlink(target, &link)
            .await
            .with_context(|| format!("failed creating symlink {link:?} -> {target:?}"))?;
        let args = vec![
            "-rl".to_string(),
            dir_arg(scratch.path()),
            self.location.url_dir(&[location::parent(&object).as_str()]),
        ];
        self.run_checked(&args).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_all(&self, paths: &[String]) -> Result<()> {
        let by_dir = group_by_parent(paths);
        if by_dir.is_empty() {
            return Ok(());
        }
        let scratch = scratch_dir()?;
        let empty = scratch.path().join("empty");
        tokio::fs::create_dir(&empty)
            .await
            .with_context(|| format!("cannot create directory {empty:?}"))?;
        for (index, (dir, names)) in by_dir.iter().enumerate() {
            // pushing into a missing directory would create it
            if !dir.is_empty() && !self.exists(dir).await? {
                tracing::debug!("{:?} does not exist, nothing to remove", dir);
                continue;
            }
            let filter = scratch.path().join(format!("filter-{index}"));
            tokio::fs::write(&filter, removal_filter(names))
                .await
                .with_context(|| format!("failed writing filter file {filter:?}"))?;
            tracing::debug!("removing {:?} from {:?}", names, dir);
            let args = vec![
                "--recursive".to_string(),
                "--delete".to_string(),
                format!("--filter=merge,p {}", filter.to_string_lossy()),
                dir_arg(&empty),
                self.location.url_dir(&[dir.as_str()]),
            ];
            if self.run_optional(&args).await?.is_none() {
                tracing::debug!("{:?} does not exist, nothing to remove", dir);
            }
        }
        Ok(())
    }

    /// rsync creates at most one missing directory per transfer, so the chain is pushed from
    /// the scheme root.
    async fn make_root(&self) -> Result<()> {
        let path = self.location.path();
        let root = match self.location.scheme() {
            Scheme::LocalPath if location::is_absolute(path) => "/".to_string(),
            Scheme::LocalPath => ".".to_string(),
            _ => self.location.root(),
        };
        let root = RsyncEngine::new(Location::parse(&root)?, &self.settings);
        root.make_dir(path.strip_prefix('~').unwrap_or(path)).await
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        let scratch = scratch_dir()?;
        let relative = path.trim_matches('/');
        if !relative.is_empty() {
            let tree = scratch.path().join(relative);
            tokio::fs::create_dir_all(&tree)
                .await
                .with_context(|| format!("cannot create directory {tree:?}"))?;
        }
        let args = vec![
            "-r".to_string(),
            dir_arg(scratch.path()),
            self.location.url_dir(&[""]),
        ];
        self.run_checked(&args).await?;
        Ok(())
    }
}
