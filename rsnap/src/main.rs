use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::instrument;

use common::location::Location;
use common::mirror::{self, Mirror, Report};
use common::retention::RetentionWindow;
use common::timestamp::Timestamp;
use common::transaction;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rsnap",
    version,
    about = "Push hard-linked, timestamped snapshots to one or more rsync destinations",
    long_about = "`rsnap` copies a directory into `<snapshot-dir>/<name>-<timestamp>` on every destination,
hard-linking files that did not change since the previous snapshot, and then repoints the
`<name>-latest` symlink (plus any extra symlinks) at it. A destination where any step fails is
rolled back to the state it was found in.

EXAMPLE:
    # Snapshot /srv/data to two destinations, keeping unreferenced snapshots for 14 days
    rsnap push /srv/data data --dest backup1:/backups rsync://backup2/vol/backups \\
        --retention-window 14 --summary"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, global = true, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

#[derive(clap::Args, Debug, Clone)]
struct Destinations {
    /// Destination address(es); the flag takes several values and may be repeated
    ///
    /// Accepted forms: `/local/path`, `[user@]host:path` (remote shell),
    /// `[user@]host::module/path` (rsync daemon) and `rsync://[user@]host[:port]/module/path`.
    #[arg(
        long = "dest",
        value_name = "ADDRESS",
        required = true,
        num_args = 1..,
        action = clap::ArgAction::Append
    )]
    dest: Vec<String>,

    /// Extra options passed to every rsync invocation, e.g. "\--bwlimit=1000 --compress"
    ///
    /// A leading backslash is stripped so the value may start with a dash.
    #[arg(long, value_name = "OPTIONS", allow_hyphen_values = true, help_heading = "Transfer")]
    extra_transfer_options: Option<String>,

    /// rsync executable to use for remote destinations
    #[arg(long, value_name = "PATH", default_value = "rsync", help_heading = "Transfer")]
    rsync_binary: std::path::PathBuf,

    /// Time limit for all the work on one destination, e.g. "30s", "2h"
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Transfer")]
    timeout: Option<std::time::Duration>,

    /// Number of destinations served at the same time, defaults to all of them
    #[arg(long, value_name = "N", help_heading = "Transfer")]
    max_parallel: Option<usize>,
}

impl Destinations {
    fn engine_settings(&self) -> common::engine::Settings {
        let settings = common::engine::Settings {
            rsync_binary: self.rsync_binary.clone(),
            ..Default::default()
        };
        match &self.extra_transfer_options {
            Some(options) => settings.with_extra_options(options),
            None => settings,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Push a directory as a new snapshot to every destination
    Push {
        /// Directory to snapshot
        source: String,

        /// Name of the mirrored repository; only its last path segment is used
        mirror_name: String,

        #[command(flatten)]
        destinations: Destinations,

        /// Snapshot timestamp (YYYY-MM-DD-HHMMSS), defaults to now
        #[arg(long, value_name = "TIMESTAMP")]
        timestamp: Option<Timestamp>,

        /// Directory holding the snapshots, relative to each destination
        #[arg(long, value_name = "DIR", default_value = transaction::DEFAULT_SNAPSHOT_DIR)]
        snapshot_dir: String,

        /// Suffix of the symlink pointing at the newest snapshot
        #[arg(long, value_name = "POSTFIX", default_value = transaction::DEFAULT_LATEST_POSTFIX)]
        latest_postfix: String,

        /// Days an unreferenced snapshot is kept: a number, 0 to never delete, or None to
        /// delete every unreferenced snapshot
        #[arg(long, value_name = "DAYS", default_value = "61")]
        retention_window: RetentionWindow,

        /// Extra symlinks (relative to each destination) to point at the new snapshot
        #[arg(long, value_name = "PATH", num_args = 1.., action = clap::ArgAction::Append)]
        symlinks: Vec<String>,

        /// Do not store the transfer summary next to the snapshot
        #[arg(long)]
        no_diff: bool,

        /// Do not maintain the `<mirror_name>` symlink at the destination root
        #[arg(long)]
        no_repo_symlink: bool,

        /// Create the destination directory if it does not exist
        #[arg(long)]
        init_directory_structure: bool,
    },
    /// Remove paths (relative to each destination) on every destination
    Remove {
        /// Path(s) to remove
        #[arg(required = true)]
        paths: Vec<String>,

        #[command(flatten)]
        destinations: Destinations,
    },
    /// Print where a symlink points on every destination
    GetTarget {
        /// Symlink path, relative to each destination
        path: String,

        #[command(flatten)]
        destinations: Destinations,

        /// Follow the whole symlink chain
        #[arg(long)]
        recursive: bool,

        /// Print the target relative to the destination root instead of the symlink's directory
        #[arg(long)]
        absolute: bool,
    },
}

fn mirror_for(
    destinations: &Destinations,
    settings: mirror::Settings,
    timestamp: Timestamp,
) -> Result<Mirror> {
    let settings = mirror::Settings {
        transaction: transaction::Settings {
            timeout: destinations.timeout,
            ..settings.transaction
        },
        max_parallel: destinations.max_parallel,
        ..settings
    };
    Ok(Mirror::from_addresses(
        &destinations.dest,
        &destinations.engine_settings(),
        settings,
        timestamp,
    )?)
}

/// Prints the per-destination report and turns any failure into an error.
fn conclude<T: std::fmt::Display>(report: &Report<T>) -> Result<()> {
    println!("{report}");
    if report.is_success() {
        return Ok(());
    }
    Err(anyhow!(
        "{} of {} destination(s) failed",
        report.failures(),
        report.outcomes.len()
    ))
}

#[instrument]
async fn async_main(args: Args) -> Result<String> {
    match args.command {
        Command::Push {
            source,
            mirror_name,
            destinations,
            timestamp,
            snapshot_dir,
            latest_postfix,
            retention_window,
            symlinks,
            no_diff,
            no_repo_symlink,
            init_directory_structure,
        } => {
            let source = Location::parse(&source)?;
            let settings = mirror::Settings {
                transaction: transaction::Settings {
                    snapshot_dir,
                    latest_postfix,
                    retention: retention_window,
                    write_diff: !no_diff,
                    timeout: None,
                },
                repo_symlink: !no_repo_symlink,
                init_directory_structure,
                max_parallel: None,
            };
            let timestamp = timestamp.unwrap_or_else(Timestamp::now);
            let mirror = mirror_for(&destinations, settings, timestamp)?;
            let report = mirror.push(&source, &mirror_name, &symlinks).await;
            conclude(&report)?;
            let total = report
                .outcomes
                .into_iter()
                .filter_map(|outcome| outcome.result.ok())
                .fold(common::engine::TransferSummary::default(), |total, outcome| {
                    total + outcome.summary
                });
            Ok(total.to_string())
        }
        Command::Remove {
            paths,
            destinations,
        } => {
            let mirror = mirror_for(&destinations, mirror::Settings::default(), Timestamp::now())?;
            let report = mirror.remove(&paths).await;
            conclude(&report)?;
            Ok(format!(
                "removed {} path(s) on {} destination(s)",
                paths.len(),
                report.outcomes.len()
            ))
        }
        Command::GetTarget {
            path,
            destinations,
            recursive,
            absolute,
        } => {
            let mirror = mirror_for(&destinations, mirror::Settings::default(), Timestamp::now())?;
            let report = mirror
                .resolve_symlink_target(&path, recursive, absolute)
                .await;
            conclude(&report)?;
            Ok(format!(
                "resolved {:?} on {} destination(s)",
                path,
                report.outcomes.len()
            ))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
