//! Symlink target history
//!
//! Every managed symlink has a sidecar text file named after it with a `.target.txt` suffix.
//! The file holds one target per line, newest first. Reading is best-effort: a missing or
//! unreadable sidecar is an empty history. An unreadable sidecar is never overwritten.

use anyhow::Context;

use crate::engine::TransferEngine;
use crate::error::Result;
use crate::location;

pub const SUFFIX: &str = ".target.txt";

pub fn sidecar_path(symlink: &str) -> String {
    format!("{}{SUFFIX}", location::as_file(&[symlink]))
}

pub fn parse(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn render(entries: &[String]) -> String {
    let mut text = entries.join("\n");
    text.push('\n');
    text
}

/// State of a symlink's sidecar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sidecar {
    Missing,
    Entries(Vec<String>),
    /// The sidecar exists but could not be fetched or decoded
    Unreadable,
}

pub async fn load(engine: &dyn TransferEngine, symlink: &str) -> Sidecar {
    let sidecar = sidecar_path(symlink);
    match engine.fetch_file(&sidecar).await {
        Ok(Some(text)) => Sidecar::Entries(parse(&text)),
        Ok(None) => Sidecar::Missing,
        Err(error) => {
            tracing::warn!("cannot read history {:?}: {:#}", &sidecar, &error);
            Sidecar::Unreadable
        }
    }
}

pub async fn read(engine: &dyn TransferEngine, symlink: &str) -> Vec<String> {
    match load(engine, symlink).await {
        Sidecar::Entries(entries) => entries,
        Sidecar::Missing | Sidecar::Unreadable => vec![],
    }
}

/// Replaces the whole history of `symlink`.
pub async fn write(engine: &dyn TransferEngine, symlink: &str, entries: &[String]) -> Result<()> {
    let staging = tempfile::Builder::new()
        .prefix("rsnap-history-")
        .tempfile()
        .context("cannot create history staging file")?;
    tokio::fs::write(staging.path(), render(entries))
        .await
        .with_context(|| format!("failed writing {:?}", staging.path()))?;
    engine.push_file(staging.path(), &sidecar_path(symlink)).await
}

/// Prepends `target` to the history of `symlink`.
pub async fn record(
    engine: &dyn TransferEngine,
    symlink: &str,
    previous: &[String],
    target: &str,
) -> Result<()> {
    let mut entries = Vec::with_capacity(previous.len() + 1);
    entries.push(target.to_string());
    entries.extend_from_slice(previous);
    write(engine, symlink, &entries).await
}
