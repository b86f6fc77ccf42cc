use async_trait::async_trait;

use crate::engine::{Entry, TransferEngine, TransferSummary, local::LocalEngine};
use crate::error::{Error, Result};
use crate::location::{self, Location};

/// Creates `dir1` below `tmp_dir` and returns its location.
pub async fn setup_source(tmp_dir: &std::path::Path) -> anyhow::Result<Location> {
    // dir1
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    // |- baz
    //    |- 2.txt
    //    |- 3.txt -> ../bar/1.txt
    let dir1 = tmp_dir.join("dir1");
    tokio::fs::create_dir(&dir1).await?;
    tokio::fs::write(dir1.join("0.txt"), "0").await?;
    tokio::fs::create_dir(dir1.join("bar")).await?;
    tokio::fs::write(dir1.join("bar/1.txt"), "1").await?;
    tokio::fs::create_dir(dir1.join("baz")).await?;
    tokio::fs::write(dir1.join("baz/2.txt"), "2").await?;
    tokio::fs::symlink("../bar/1.txt", dir1.join("baz/3.txt")).await?;
    Ok(Location::parse(&dir1.to_string_lossy())?)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Content pushes fail
    Push,
    /// Content pushes hang for the given time before going through
    SlowPush(std::time::Duration),
    /// Writing the symlink at this path fails
    Symlink(String),
    /// Every removal fails
    RemoveAll,
}

/// Local engine with one injected failure.
#[derive(Debug)]
pub struct FailingEngine {
    inner: LocalEngine,
    fault: Fault,
}

impl FailingEngine {
    pub fn new(inner: LocalEngine, fault: Fault) -> Self {
        Self { inner, fault }
    }

    fn injected(&self, operation: &str) -> Error {
        Error::Transport(anyhow::anyhow!(
            "injected {} failure on {:?}",
            operation,
            self.inner.location().address()
        ))
    }
}

#[async_trait]
impl TransferEngine for FailingEngine {
    fn location(&self) -> &Location {
        self.inner.location()
    }

    async fn entries(&self, path: &str) -> Result<Vec<Entry>> {
        self.inner.entries(path).await
    }

    async fn push(
        &self,
        source: &Location,
        dest: &str,
        hardlink_base: Option<&str>,
    ) -> Result<TransferSummary> {
        match &self.fault {
            Fault::Push => return Err(self.injected("push")),
            Fault::SlowPush(delay) => tokio::time::sleep(*delay).await,
            _ => {}
        }
        self.inner.push(source, dest, hardlink_base).await
    }

    async fn push_file(&self, local: &std::path::Path, dest: &str) -> Result<()> {
        self.inner.push_file(local, dest).await
    }

    async fn fetch_file(&self, path: &str) -> Result<Option<String>> {
        self.inner.fetch_file(path).await
    }

    async fn write_symlink(&self, path: &str, target: &str) -> Result<()> {
        if let Fault::Symlink(failing) = &self.fault
            && location::as_file(&[path]) == location::as_file(&[failing.as_str()])
        {
            return Err(self.injected("symlink"));
        }
        self.inner.write_symlink(path, target).await
    }

    async fn remove_all(&self, paths: &[String]) -> Result<()> {
        if self.fault == Fault::RemoveAll {
            return Err(self.injected("remove"));
        }
        self.inner.remove_all(paths).await
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        self.inner.make_dir(path).await
    }
}
