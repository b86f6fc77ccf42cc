//! Mirror facade
//!
//! Runs the same operation against every destination concurrently and collects one outcome
//! per destination. Destinations never affect each other: a failure on one is reported and
//! the others carry on.

use anyhow::anyhow;
use std::sync::Arc;
use tracing::instrument;

use crate::engine::{self, TransferEngine};
use crate::location::Location;
use crate::timestamp::Timestamp;
use crate::transaction::{self, PushOutcome};

#[derive(Clone, Debug)]
pub struct Settings {
    pub transaction: transaction::Settings,
    /// Maintain `{root}/{repo}` next to the `latest` symlink
    pub repo_symlink: bool,
    /// Create the destination directory before anything else
    pub init_directory_structure: bool,
    /// Destinations served at the same time (`None` = all of them)
    pub max_parallel: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transaction: transaction::Settings::default(),
            repo_symlink: true,
            init_directory_structure: false,
            max_parallel: None,
        }
    }
}

#[derive(Debug)]
pub struct DestinationOutcome<T> {
    pub address: String,
    pub result: anyhow::Result<T>,
}

/// Per-destination outcomes, in the order the destinations were given.
#[derive(Debug)]
pub struct Report<T> {
    pub outcomes: Vec<DestinationOutcome<T>>,
}

impl<T> Report<T> {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result.is_err())
            .count()
    }
}

impl<T: std::fmt::Display> std::fmt::Display for Report<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for outcome in &self.outcomes {
            match &outcome.result {
                Ok(value) => {
                    let value = value.to_string();
                    if value.contains('\n') {
                        write!(f, "{}: OK\n{}", outcome.address, value)?;
                        if !value.ends_with('\n') {
                            writeln!(f)?;
                        }
                    } else {
                        writeln!(f, "{}: OK {}", outcome.address, value)?;
                    }
                }
                Err(error) => writeln!(f, "{}: FAILED {:#}", outcome.address, error)?,
            }
        }
        write!(
            f,
            "{} of {} destination(s) succeeded",
            self.outcomes.len() - self.failures(),
            self.outcomes.len()
        )
    }
}

#[derive(Debug)]
pub struct Mirror {
    engines: Vec<Arc<dyn TransferEngine>>,
    settings: Settings,
    timestamp: Timestamp,
}

impl Mirror {
    /// `timestamp` names the snapshots of every push and is the clock of retention sweeps.
    pub fn new(
        engines: Vec<Arc<dyn TransferEngine>>,
        settings: Settings,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            engines,
            settings,
            timestamp,
        }
    }

    /// Parses every address, failing on the first invalid one.
    pub fn from_addresses(
        addresses: &[String],
        engine_settings: &engine::Settings,
        settings: Settings,
        timestamp: Timestamp,
    ) -> crate::Result<Self> {
        let engines = addresses
            .iter()
            .map(|address| {
                let location = Location::parse(address)?;
                Ok(engine::for_location(location, engine_settings))
            })
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Self::new(engines, settings, timestamp))
    }

    async fn fan_out<T, F, Fut>(&self, operation: F) -> Report<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn TransferEngine>) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let max_parallel = self
            .settings
            .max_parallel
            .unwrap_or(self.engines.len())
            .max(1);
        let mut results = (0..self.engines.len())
            .map(|_| None)
            .collect::<Vec<Option<anyhow::Result<T>>>>();
        let mut join_set = tokio::task::JoinSet::new();
        let mut collect = |joined: Result<(usize, anyhow::Result<T>), tokio::task::JoinError>| {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(error) => tracing::error!("destination task failed: {:#}", &error),
            }
        };
        for (index, engine) in self.engines.iter().enumerate() {
            if join_set.len() >= max_parallel
                && let Some(joined) = join_set.join_next().await
            {
                collect(joined);
            }
            let task = operation(engine.clone());
            join_set.spawn(async move { (index, task.await) });
        }
        while let Some(joined) = join_set.join_next().await {
            collect(joined);
        }
        let outcomes = self
            .engines
            .iter()
            .zip(results)
            .map(|(engine, result)| {
                let address = engine.location().address().to_string();
                let result = result
                    .unwrap_or_else(|| Err(anyhow!("destination task did not complete")));
                if let Err(error) = &result {
                    tracing::error!("{}: {:#}", &address, error);
                }
                DestinationOutcome { address, result }
            })
            .collect();
        Report { outcomes }
    }

    /// Runs `operation` under the configured timeout.
    async fn bounded<T>(
        timeout: Option<std::time::Duration>,
        operation: impl std::future::Future<Output = crate::Result<T>>,
    ) -> anyhow::Result<T> {
        let result = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, operation)
                .await
                .map_err(|_| crate::Error::Timeout(timeout))?,
            None => operation.await,
        };
        Ok(result?)
    }

    /// Pushes `source` as a new snapshot of `repo` to every destination.
    #[instrument(skip(self), fields(timestamp = %self.timestamp))]
    pub async fn push(
        &self,
        source: &Location,
        repo: &str,
        symlinks: &[String],
    ) -> Report<PushOutcome> {
        let repo = transaction::repo_name(repo);
        let mut links = vec![];
        if self.settings.repo_symlink {
            links.push(repo.clone());
        }
        links.extend(symlinks.iter().cloned());
        let links = Arc::new(links);
        let timestamp = self.timestamp;
        self.fan_out(|engine| {
            let settings = self.settings.clone();
            let source = source.clone();
            let repo = repo.clone();
            let links = links.clone();
            async move {
                if settings.init_directory_structure {
                    Self::bounded(settings.transaction.timeout, engine.make_root()).await?;
                }
                let outcome = transaction::push(
                    engine.as_ref(),
                    &settings.transaction,
                    &source,
                    &repo,
                    &links,
                    timestamp,
                )
                .await?;
                Ok(outcome)
            }
        })
        .await
    }

    /// Removes `paths` (relative to each destination) in one batch per destination.
    #[instrument(skip(self))]
    pub async fn remove(&self, paths: &[String]) -> Report<String> {
        let paths = Arc::new(paths.to_vec());
        let timeout = self.settings.transaction.timeout;
        self.fan_out(|engine| {
            let paths = paths.clone();
            async move {
                Self::bounded(timeout, engine.remove_all(&paths)).await?;
                Ok(format!("removed {} path(s)", paths.len()))
            }
        })
        .await
    }

    /// Resolves the symlink at `path` on every destination.
    #[instrument(skip(self))]
    pub async fn resolve_symlink_target(
        &self,
        path: &str,
        recursive: bool,
        absolute: bool,
    ) -> Report<String> {
        let timeout = self.settings.transaction.timeout;
        self.fan_out(|engine| {
            let path = path.to_string();
            async move {
                Self::bounded(timeout, async {
                    Ok::<_, crate::Error>(engine.resolve_symlink(&path, recursive, absolute).await)
                })
                .await
            }
        })
        .await
    }
}
