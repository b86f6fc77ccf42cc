use anyhow::{Context, anyhow};
use async_recursion::async_recursion;
use async_trait::async_trait;
use std::os::unix::fs::MetadataExt;
use tracing::instrument;

use super::{Entry, EntryKind, Settings, TransferEngine, TransferSummary, is_contents};
use crate::error::{Error, Result};
use crate::location::Location;

/// Upper bound on entries of one directory processed concurrently.
const MAX_WIDTH: usize = 64;

/// Engine operating directly on a directory of the local filesystem.
#[derive(Debug)]
pub struct LocalEngine {
    location: Location,
    root: std::path::PathBuf,
}

impl LocalEngine {
    pub fn new(location: Location, settings: &Settings) -> Self {
        if !settings.extra_options.is_empty() {
            tracing::warn!(
                "ignoring extra transfer options {:?} for local destination {:?}",
                &settings.extra_options,
                location.address()
            );
        }
        let root = std::path::PathBuf::from(location.path());
        Self { location, root }
    }

    fn resolve(&self, path: &str) -> std::path::PathBuf {
        let relative = path.trim_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

fn is_missing(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}

async fn metadata_if_exists(path: &std::path::Path) -> anyhow::Result<Option<std::fs::Metadata>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(error) if is_missing(&error) => Ok(None),
        Err(error) => Err(error).with_context(|| format!("failed reading metadata from {path:?}")),
    }
}

async fn entry_for(
    name: &str,
    path: &std::path::Path,
    metadata: &std::fs::Metadata,
) -> anyhow::Result<Entry> {
    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        let target = tokio::fs::read_link(path)
            .await
            .with_context(|| format!("failed reading symlink {path:?}"))?;
        return Ok(Entry::symlink(name, &target.to_string_lossy()));
    }
    let kind = if file_type.is_dir() {
        EntryKind::Dir
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };
    Ok(Entry::new(name, kind))
}

fn size_and_mode_equal(metadata1: &std::fs::Metadata, metadata2: &std::fs::Metadata) -> bool {
    metadata1.size() == metadata2.size() && metadata1.mode() == metadata2.mode()
}

/// Quick check deciding whether a file can be reused instead of copied.
fn metadata_equal(metadata1: &std::fs::Metadata, metadata2: &std::fs::Metadata) -> bool {
    if !size_and_mode_equal(metadata1, metadata2) {
        return false;
    }
    if metadata1.mtime() != metadata2.mtime() {
        return false;
    }
    // some filesystems do not support nanosecond precision, so we only compare nanoseconds if both files have them
    metadata1.mtime_nsec() == 0
        || metadata2.mtime_nsec() == 0
        || metadata1.mtime_nsec() == metadata2.mtime_nsec()
}

async fn contents_equal(path1: &std::path::Path, path2: &std::path::Path) -> anyhow::Result<bool> {
    use tokio::io::AsyncReadExt;
    let open = |path: &std::path::Path| {
        let path = path.to_owned();
        async move {
            tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("cannot open {path:?} for reading"))
        }
    };
    let mut reader1 = tokio::io::BufReader::new(open(path1).await?);
    let mut reader2 = tokio::io::BufReader::new(open(path2).await?);
    let mut buf1 = vec![0u8; 64 * 1024];
    let mut buf2 = vec![0u8; 64 * 1024];
    loop {
        let len = reader1
            .read(&mut buf1)
            .await
            .with_context(|| format!("failed reading {path1:?}"))?;
        if len == 0 {
            let rest = reader2
                .read(&mut buf2[..1])
                .await
                .with_context(|| format!("failed reading {path2:?}"))?;
            return Ok(rest == 0);
        }
        match reader2.read_exact(&mut buf2[..len]).await {
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(error) => {
                return Err(error).with_context(|| format!("failed reading {path2:?}"));
            }
        }
        if buf1[..len] != buf2[..len] {
            return Ok(false);
        }
    }
}

/// Whether `base` holds the same data as `src` and can be linked in its place.
async fn reusable(
    src: &std::path::Path,
    src_metadata: &std::fs::Metadata,
    base: &std::path::Path,
    base_metadata: &std::fs::Metadata,
) -> anyhow::Result<bool> {
    if !base_metadata.is_file() || !size_and_mode_equal(src_metadata, base_metadata) {
        return Ok(false);
    }
    if metadata_equal(src_metadata, base_metadata) {
        return Ok(true);
    }
    contents_equal(src, base).await
}

async fn set_times(path: &std::path::Path, metadata: &std::fs::Metadata) -> anyhow::Result<()> {
    let atime = filetime::FileTime::from_last_access_time(metadata);
    let mtime = filetime::FileTime::from_last_modification_time(metadata);
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || {
        filetime::set_symlink_file_times(&path, atime, mtime)
            .with_context(|| format!("failed setting timestamps for {:?}", &path))
    })
    .await?
}

#[async_recursion]
async fn rm(path: &std::path::Path) -> anyhow::Result<()> {
    tracing::debug!("remove: {:?}", path);
    let Some(metadata) = metadata_if_exists(path).await? else {
        return Ok(());
    };
    if !metadata.is_dir() {
        return tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("failed removing {:?}", &path));
    }
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("cannot open directory {path:?} for reading"))?;
    let mut join_set = tokio::task::JoinSet::new();
    let mut errors = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", &path))?
    {
        let entry_path = entry.path();
        join_set.spawn(async move { rm(&entry_path).await });
    }
    while let Some(res) = join_set.join_next().await {
        if let Err(error) = res? {
            errors.push(error);
        }
    }
    if !errors.is_empty() {
        return Err(anyhow!("{:?}", &errors));
    }
    tokio::fs::remove_dir(path)
        .await
        .with_context(|| format!("failed removing directory {:?}", &path))
}

async fn sync_file(
    src: &std::path::Path,
    src_metadata: &std::fs::Metadata,
    dst: &std::path::Path,
    base: Option<&std::path::Path>,
    rel: &str,
) -> anyhow::Result<TransferSummary> {
    if let Some(dst_metadata) = metadata_if_exists(dst).await? {
        if dst_metadata.is_file() && metadata_equal(src_metadata, &dst_metadata) {
            tracing::debug!("{:?} is up to date", dst);
            return Ok(TransferSummary::default());
        }
        rm(dst).await?;
    }
    if let Some(base) = base
        && let Some(base_metadata) = metadata_if_exists(base).await?
        && reusable(src, src_metadata, base, &base_metadata).await?
    {
        tokio::fs::hard_link(base, dst)
            .await
            .with_context(|| format!("failed to hard link {base:?} to {dst:?}"))?;
        return Ok(TransferSummary {
            files_linked: 1,
            ..Default::default()
        });
    }
    tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("failed copying {src:?} to {dst:?}"))?;
    set_times(dst, src_metadata).await?;
    Ok(TransferSummary {
        files_copied: 1,
        bytes_copied: src_metadata.size(),
        changes: vec![format!(">f+++++++++ {rel}")],
        ..Default::default()
    })
}

async fn sync_symlink(
    src: &std::path::Path,
    src_metadata: &std::fs::Metadata,
    dst: &std::path::Path,
    rel: &str,
) -> anyhow::Result<TransferSummary> {
    let target = tokio::fs::read_link(src)
        .await
        .with_context(|| format!("failed reading symlink {src:?}"))?;
    if let Some(dst_metadata) = metadata_if_exists(dst).await? {
        if dst_metadata.is_symlink()
            && tokio::fs::read_link(dst).await.ok().as_ref() == Some(&target)
        {
            return Ok(TransferSummary::default());
        }
        rm(dst).await?;
    }
    tokio::fs::symlink(&target, dst)
        .await
        .with_context(|| format!("failed creating symlink {dst:?} -> {target:?}"))?;
    set_times(dst, src_metadata).await?;
    Ok(TransferSummary {
        symlinks_created: 1,
        changes: vec![format!("cL+++++++++ {rel} -> {}", target.to_string_lossy())],
        ..Default::default()
    })
}

async fn sync_entry(
    src: std::path::PathBuf,
    dst: std::path::PathBuf,
    base: Option<std::path::PathBuf>,
    rel: String,
) -> anyhow::Result<TransferSummary> {
    let src_metadata = tokio::fs::symlink_metadata(&src)
        .await
        .with_context(|| format!("failed reading metadata from {src:?}"))?;
    let file_type = src_metadata.file_type();
    if file_type.is_dir() {
        sync_dir(src, dst, base, rel).await
    } else if file_type.is_symlink() {
        sync_symlink(&src, &src_metadata, &dst, &rel).await
    } else if file_type.is_file() {
        sync_file(&src, &src_metadata, &dst, base.as_deref(), &rel).await
    } else {
        tracing::warn!("skipping special file {:?}", &src);
        Ok(TransferSummary::default())
    }
}

/// Makes `dst` a copy of the directory `src`, deleting entries `src` does not have.
#[async_recursion]
async fn sync_dir(
    src: std::path::PathBuf,
    dst: std::path::PathBuf,
    base: Option<std::path::PathBuf>,
    rel: String,
) -> anyhow::Result<TransferSummary> {
    let src_metadata = tokio::fs::metadata(&src)
        .await
        .with_context(|| format!("failed reading metadata from {src:?}"))?;
    let mut summary = TransferSummary::default();
    let dst_metadata = metadata_if_exists(&dst).await?;
    if !dst_metadata.as_ref().is_some_and(std::fs::Metadata::is_dir) {
        if dst_metadata.is_some() {
            rm(&dst).await?;
        }
        tokio::fs::create_dir(&dst)
            .await
            .with_context(|| format!("cannot create directory {dst:?}"))?;
        summary.directories_created += 1;
        if !rel.is_empty() {
            summary.changes.push(format!("cd+++++++++ {rel}/"));
        }
    }
    let mut entries = tokio::fs::read_dir(&src)
        .await
        .with_context(|| format!("cannot open directory {src:?} for reading"))?;
    let mut names = std::collections::HashSet::new();
    let mut join_set = tokio::task::JoinSet::new();
    let mut errors = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", &src))?
    {
        if join_set.len() >= MAX_WIDTH
            && let Some(res) = join_set.join_next().await
        {
            match res? {
                Ok(entry_summary) => summary = summary + entry_summary,
                Err(error) => errors.push(error),
            }
        }
        let name = entry.file_name();
        let entry_rel = if rel.is_empty() {
            name.to_string_lossy().to_string()
        } else {
            format!("{rel}/{}", name.to_string_lossy())
        };
        let entry_dst = dst.join(&name);
        let entry_base = base.as_ref().map(|base| base.join(&name));
        names.insert(name);
        join_set.spawn(sync_entry(entry.path(), entry_dst, entry_base, entry_rel));
    }
    while let Some(res) = join_set.join_next().await {
        match res? {
            Ok(entry_summary) => summary = summary + entry_summary,
            Err(error) => errors.push(error),
        }
    }
    let mut existing = tokio::fs::read_dir(&dst)
        .await
        .with_context(|| format!("cannot open directory {dst:?} for reading"))?;
    while let Some(entry) = existing
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", &dst))?
    {
        if names.contains(&entry.file_name()) {
            continue;
        }
        if let Err(error) = rm(&entry.path()).await {
            errors.push(error);
        } else {
            summary.changes.push(format!(
                "*deleting   {}",
                crate::location::join(&[rel.as_str(), &entry.file_name().to_string_lossy()])
            ));
        }
    }
    if !errors.is_empty() {
        return Err(anyhow!("{:?}", &errors));
    }
    tokio::fs::set_permissions(&dst, src_metadata.permissions())
        .await
        .with_context(|| format!("cannot set permissions for {dst:?}"))?;
    set_times(&dst, &src_metadata).await?;
    Ok(summary)
}

/// Sibling path used to stage a file before it is renamed into place.
fn staging_path(path: &std::path::Path) -> std::path::PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

async fn create_parent(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("cannot create directory {parent:?}"))?;
    }
    Ok(())
}

#[async_trait]
impl TransferEngine for LocalEngine {
    fn location(&self) -> &Location {
        &self.location
    }

    async fn entries(&self, path: &str) -> Result<Vec<Entry>> {
        let target = self.resolve(path);
        if !is_contents(path) {
            let Some(metadata) = metadata_if_exists(&target).await? else {
                return Ok(vec![]);
            };
            let name = crate::location::basename(path);
            return Ok(vec![entry_for(&name, &target, &metadata).await?]);
        }
        let mut dir = match tokio::fs::read_dir(&target).await {
            Ok(dir) => dir,
            Err(error) if is_missing(&error) => return Ok(vec![]),
            Err(error) => {
                return Err(anyhow::Error::from(error)
                    .context(format!("cannot open directory {target:?} for reading"))
                    .into());
            }
        };
        let mut entries = vec![];
        while let Some(entry) = dir
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", &target))?
        {
            let metadata = entry
                .metadata()
                .await
                .with_context(|| format!("failed reading metadata from {:?}", entry.path()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push(entry_for(&name, &entry.path(), &metadata).await?);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    #[instrument(skip(self))]
    async fn push(
        &self,
        source: &Location,
        dest: &str,
        hardlink_base: Option<&str>,
    ) -> Result<TransferSummary> {
        if source.scheme().is_remote() {
            return Err(Error::UnsupportedSource(source.address().to_string()));
        }
        let src = std::path::PathBuf::from(source.path());
        let dst = self.resolve(dest);
        let base = hardlink_base.map(|base| self.resolve(base));
        tracing::info!("pushing {:?} to {:?} (hard-link base: {:?})", &src, &dst, &base);
        create_parent(&dst).await?;
        let mut summary = sync_dir(src, dst.clone(), base, String::new())
            .await
            .with_context(|| format!("failed pushing {:?} to {:?}", source.address(), &dst))?;
        summary.changes.sort();
        Ok(summary)
    }

    async fn push_file(&self, local: &std::path::Path, dest: &str) -> Result<()> {
        let dst = self.resolve(dest);
        create_parent(&dst).await?;
        let staging = staging_path(&dst);
        tokio::fs::copy(local, &staging)
            .await
            .with_context(|| format!("failed copying {local:?} to {staging:?}"))?;
        tokio::fs::rename(&staging, &dst)
            .await
            .with_context(|| format!("failed moving {staging:?} to {dst:?}"))?;
        Ok(())
    }

    async fn fetch_file(&self, path: &str) -> Result<Option<String>> {
        let target = self.resolve(path);
        match tokio::fs::read_to_string(&target).await {
            Ok(contents) => Ok(Some(contents)),
            Err(error) if is_missing(&error) => Ok(None),
            Err(error) => Err(anyhow::Error::from(error)
                .context(format!("failed reading {target:?}"))
                .into()),
        }
    }

    async fn write_symlink(&self, path: &str, target: &str) -> Result<()> {
        let link = self.resolve(path);
        create_parent(&link).await?;
        let staging = staging_path(&link);
        rm(&staging).await?;
        tokio::fs::symlink(target, &staging)
            .await
            .with_context(|| format!("failed creating symlink {staging:?} -> {target:?}"))?;
        tokio::fs::rename(&staging, &link)
            .await
            .with_context(|| format!("failed moving symlink {staging:?} to {link:?}"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_all(&self, paths: &[String]) -> Result<()> {
        let mut join_set = tokio::task::JoinSet::new();
        for path in paths {
            let target = self.resolve(path);
            join_set.spawn(async move { rm(&target).await });
        }
        let mut errors = vec![];
        while let Some(res) = join_set.join_next().await {
            if let Err(error) = res.map_err(anyhow::Error::from)? {
                errors.push(error);
            }
        }
        if !errors.is_empty() {
            return Err(anyhow!("{:?}", &errors).into());
        }
        Ok(())
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        let target = self.resolve(path);
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("cannot create directory {target:?}"))?;
        Ok(())
    }
}
