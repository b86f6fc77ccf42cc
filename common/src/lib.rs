//! Snapshot transactions over rsync-reachable destinations
//!
//! A push copies a source tree into `{snapshot_dir}/{repo}-{timestamp}` on every destination,
//! hard-linking unchanged files against the previous snapshot, and then repoints a set of
//! symlinks at it. Each destination runs one [`transaction`]: if any step fails, the steps
//! already taken are undone in reverse order so the destination is left as it was found.
//!
//! # Modules
//!
//! - [`location`]: destination address parsing and path arithmetic
//! - [`engine`]: the transfer backends (`rsync` binary and a local filesystem engine)
//! - [`history`]: symlink target history sidecars
//! - [`retention`]: deletion of old unreferenced snapshots
//! - [`transaction`]: the push state machine and its rollback log
//! - [`mirror`]: the same operation fanned out over many destinations
//!
//! # Logging
//!
//! Everything logs through `tracing`. Binaries call [`run`], which installs a stderr
//! subscriber honoring `RUST_LOG` and falling back to the verbosity of [`OutputConfig`].

pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod location;
pub mod mirror;
pub mod retention;
pub mod timestamp;
pub mod transaction;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig};
pub use error::{Error, Result};

fn init_tracing(output: &OutputConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.log_level()));
    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("failed to initialize logging: {error}");
    }
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    Ok(builder.build()?)
}

/// Sets up logging and the tokio runtime, then drives `func` to completion.
///
/// Returns `None` if `func` failed; the error has been logged by then (unless quiet).
pub fn run<Summary, Fut>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    init_tracing(&output);
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                tracing::error!("failed to start runtime: {:#}", &error);
            }
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", &error);
            }
            None
        }
    }
}
