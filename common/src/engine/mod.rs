//! Transfer engines
//!
//! A [`TransferEngine`] is the only way the snapshot code touches a destination. Paths passed
//! to an engine are relative to the engine's [`Location`]: a path that is empty or ends with
//! `/` names the contents of a directory, any other path names the object itself. Listing an
//! object that does not exist yields an empty list rather than an error.
//!
//! Two engines are provided:
//! - [`local::LocalEngine`] for local-path destinations, implemented with `tokio::fs`
//! - [`rsync::RsyncEngine`] for remote destinations, driving the `rsync` binary

use async_trait::async_trait;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::location::{self, Location, Scheme};

pub mod local;
pub mod rsync;

/// Symlink chains longer than this are treated as loops.
const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    pub symlink_target: Option<String>,
}

impl Entry {
    pub fn new(name: &str, kind: EntryKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            symlink_target: None,
        }
    }

    pub fn symlink(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EntryKind::Symlink,
            symlink_target: Some(target.to_string()),
        }
    }
}

/// What a content push did. `changes` holds one itemized line per changed entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub files_copied: usize,
    pub files_linked: usize,
    pub symlinks_created: usize,
    pub directories_created: usize,
    pub bytes_copied: u64,
    pub changes: Vec<String>,
}

impl TransferSummary {
    /// Text stored next to a snapshot as its diff record.
    #[must_use]
    pub fn diff(&self) -> String {
        let mut text = String::new();
        for change in &self.changes {
            text.push_str(change);
            text.push('\n');
        }
        text.push_str(&self.to_string());
        text
    }
}

impl std::ops::Add for TransferSummary {
    type Output = Self;
    fn add(mut self, other: Self) -> Self {
        self.changes.extend(other.changes);
        Self {
            files_copied: self.files_copied + other.files_copied,
            files_linked: self.files_linked + other.files_linked,
            symlinks_created: self.symlinks_created + other.symlinks_created,
            directories_created: self.directories_created + other.directories_created,
            bytes_copied: self.bytes_copied + other.bytes_copied,
            changes: self.changes,
        }
    }
}

impl std::fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files copied: {}\nfiles hard-linked: {}\nsymlinks created: {}\ndirectories created: {}\nbytes copied: {}\n",
            self.files_copied,
            self.files_linked,
            self.symlinks_created,
            self.directories_created,
            bytesize::ByteSize(self.bytes_copied)
        )
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    /// Extra options appended to every rsync invocation
    pub extra_options: Vec<String>,
    /// rsync executable to run
    pub rsync_binary: std::path::PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            extra_options: Vec::new(),
            rsync_binary: std::path::PathBuf::from("rsync"),
        }
    }
}

impl Settings {
    /// Splits a user-supplied option string. A leading `\` is dropped so values starting with
    /// `-` can be passed through the command line parser.
    #[must_use]
    pub fn with_extra_options(mut self, options: &str) -> Self {
        let options = options.strip_prefix('\\').unwrap_or(options);
        self.extra_options = options.split_whitespace().map(str::to_string).collect();
        self
    }
}

fn is_contents(path: &str) -> bool {
    path.is_empty() || path.ends_with(location::SEP)
}

#[async_trait]
pub trait TransferEngine: std::fmt::Debug + Send + Sync {
    fn location(&self) -> &Location;

    /// Lists a directory's contents (`path` empty or ending with `/`) or a single object.
    async fn entries(&self, path: &str) -> Result<Vec<Entry>>;

    /// Copies the contents of the `source` directory into `dest`. Files identical to the ones
    /// under `hardlink_base` are hard-linked instead of copied.
    async fn push(
        &self,
        source: &Location,
        dest: &str,
        hardlink_base: Option<&str>,
    ) -> Result<TransferSummary>;

    /// Uploads a single local file to `dest`.
    async fn push_file(&self, local: &std::path::Path, dest: &str) -> Result<()>;

    /// Downloads a small text file, `None` if it does not exist.
    async fn fetch_file(&self, path: &str) -> Result<Option<String>>;

    /// Creates or replaces the symlink at `path` without any validation.
    async fn write_symlink(&self, path: &str, target: &str) -> Result<()>;

    /// Recursively removes all `paths` in one batch. Missing paths are skipped.
    async fn remove_all(&self, paths: &[String]) -> Result<()>;

    /// Creates `path` and any missing parents.
    async fn make_dir(&self, path: &str) -> Result<()>;

    /// Creates the destination directory itself, including missing parents.
    async fn make_root(&self) -> Result<()> {
        self.make_dir("").await
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .entries(path)
            .await?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    async fn list_dirs(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .entries(path)
            .await?
            .into_iter()
            .filter(|entry| entry.kind == EntryKind::Dir)
            .map(|entry| entry.name)
            .collect())
    }

    async fn list_symlinks(&self, path: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .entries(path)
            .await?
            .into_iter()
            .filter_map(|entry| {
                let target = entry.symlink_target?;
                Some((entry.name, target))
            })
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let object = location::as_file(&[path]);
        Ok(!self.entries(&object).await?.is_empty())
    }

    /// Raw target of the symlink at `path`, `None` if `path` is not a symlink.
    async fn symlink_target(&self, path: &str) -> Result<Option<String>> {
        let object = location::as_file(&[path]);
        let name = location::basename(&object);
        Ok(self
            .list_symlinks(&object)
            .await?
            .into_iter()
            .find(|(link, _)| *link == name)
            .map(|(_, target)| target))
    }

    /// Creates or repoints the symlink at `path`, refusing dangling targets.
    #[instrument(skip(self))]
    async fn make_symlink(&self, path: &str, target: &str) -> Result<()> {
        let resolved = resolve_link(path, target);
        if !self.exists(&resolved).await? {
            return Err(Error::TargetMissing {
                symlink: path.to_string(),
                target: target.to_string(),
            });
        }
        tracing::info!("creating symlink {:?} -> {:?}", path, target);
        self.write_symlink(path, target).await
    }

    /// Follows the symlink chain starting at `path`.
    ///
    /// Stops after one hop unless `recursive`, and at the first object that is not a symlink
    /// or cannot be listed. A `path` that is not a symlink is returned unchanged; otherwise the
    /// result is relative to the engine root if `absolute`, or to the directory holding `path`.
    #[instrument(skip(self))]
    async fn resolve_symlink(&self, path: &str, recursive: bool, absolute: bool) -> String {
        let mut current = location::as_file(&[path]);
        let mut hops = 0;
        loop {
            let target = match self.symlink_target(&current).await {
                Ok(Some(target)) => target,
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!("cannot read symlink {:?}: {:#}", current, &error);
                    break;
                }
            };
            current = resolve_link(&current, &target);
            hops += 1;
            if !recursive {
                break;
            }
            if hops >= MAX_SYMLINK_HOPS {
                tracing::warn!("too many levels of symlinks resolving {:?}", path);
                break;
            }
        }
        if hops == 0 {
            return path.to_string();
        }
        if absolute {
            current
        } else {
            location::relative_path(&current, &location::parent(path))
        }
    }
}

/// Destination-relative path a symlink at `link` with `target` points to.
pub fn resolve_link(link: &str, target: &str) -> String {
    if location::is_absolute(target) {
        location::normalize(target)
    } else {
        location::normalize(&location::join(&[location::parent(link).as_str(), target]))
    }
}

/// Engine suitable for the destination's address scheme.
pub fn for_location(
    location: Location,
    settings: &Settings,
) -> std::sync::Arc<dyn TransferEngine> {
    match location.scheme() {
        Scheme::LocalPath => std::sync::Arc::new(local::LocalEngine::new(location, settings)),
        Scheme::RemoteShell | Scheme::RsyncModule | Scheme::RsyncUrl => {
            std::sync::Arc::new(rsync::RsyncEngine::new(location, settings))
        }
    }
}
