/// Failures reported by the location model and the transfer engines.
///
/// Every engine call funnels its failures into this type so the transaction code can treat
/// them uniformly: any `Err` fails the current step and triggers an unwind.
///
/// # Logging Convention
/// Log with `{:#}` to keep the `anyhow` chain carried by [`Error::Transport`]:
/// ```ignore
/// tracing::error!("push failed: {:#}", &error);
/// ```
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("symlink target {target:?} does not exist (symlink {symlink:?})")]
    TargetMissing { symlink: String, target: String },
    #[error("{0:#}")]
    Transport(#[source] anyhow::Error),
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("snapshot {0:?} already exists")]
    SnapshotExists(String),
    #[error("source {0:?} cannot be pushed by this engine")]
    UnsupportedSource(String),
}

impl Error {
    pub fn invalid_address(address: &str, reason: impl Into<String>) -> Self {
        Error::InvalidAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Error::Transport(error)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
