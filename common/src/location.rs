//! Destination and source addresses
//!
//! A [`Location`] is parsed from one of the four address forms understood by rsync:
//!
//! - `rsync://[USER@]HOST[:PORT]/MODULE[/PATH]` ([`Scheme::RsyncUrl`])
//! - `[USER@]HOST::MODULE[/PATH]` ([`Scheme::RsyncModule`])
//! - `[USER@]HOST:[PATH]` ([`Scheme::RemoteShell`])
//! - `PATH` ([`Scheme::LocalPath`])
//!
//! The free functions ([`join`], [`as_dir`], [`as_file`], [`relative_path`], ...) operate on
//! `/`-separated path strings and never touch the filesystem. They are used both for local
//! and remote paths, which is why they work on strings rather than [`std::path::Path`].

use std::sync::LazyLock;

use crate::error::{Error, Result};

pub const SEP: char = '/';

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    RsyncUrl,
    RsyncModule,
    RemoteShell,
    LocalPath,
}

impl Scheme {
    /// Order in which grammars are tried, most specific first.
    pub const PRIORITY: [Scheme; 4] = [
        Scheme::RsyncUrl,
        Scheme::RsyncModule,
        Scheme::RemoteShell,
        Scheme::LocalPath,
    ];

    pub fn is_remote(&self) -> bool {
        !matches!(self, Scheme::LocalPath)
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Scheme::RsyncUrl => "rsync-protocol",
            Scheme::RsyncModule => "rsync-module",
            Scheme::RemoteShell => "remote-shell",
            Scheme::LocalPath => "local-path",
        };
        write!(f, "{name}")
    }
}

static RSYNC_URL: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"^(?P<protocol>[^/:]+)://(?:(?P<user>[^@/:]+)@)?(?P<host>[^@:/]+)(?::(?P<port>[^@:/]+))?(?:/(?P<module>[^@:/]+)/?)?(?P<path>[^@:]*)$",
    )
    .unwrap()
});

static RSYNC_MODULE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^(?:(?P<user>[^@/:]+)@)?(?P<host>[^@:/]+)::(?P<rest>[^@:]*)$").unwrap()
});

static REMOTE_SHELL: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^(?:(?P<user>[^@/:]+)@)?(?P<host>[^@:/]+):(?P<path>[^@:]*)$").unwrap()
});

static LOCAL_PATH: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^(?P<path>[^@:]*)$").unwrap());

/// Raw capture groups of a single grammar match, before normalization.
#[derive(Debug, Default)]
struct Parts {
    protocol: Option<String>,
    user: Option<String>,
    host: Option<String>,
    port: Option<String>,
    module: Option<String>,
    path: String,
}

fn group(captures: &regex::Captures, name: &str) -> Option<String> {
    captures
        .name(name)
        .map(|m| m.as_str().to_string())
        .filter(|value| !value.is_empty())
}

fn match_scheme(scheme: Scheme, address: &str) -> Option<Parts> {
    match scheme {
        Scheme::RsyncUrl => {
            let captures = RSYNC_URL.captures(address)?;
            Some(Parts {
                protocol: group(&captures, "protocol"),
                user: group(&captures, "user"),
                host: group(&captures, "host"),
                port: group(&captures, "port"),
                module: group(&captures, "module"),
                path: group(&captures, "path").unwrap_or_default(),
            })
        }
        Scheme::RsyncModule => {
            let captures = RSYNC_MODULE.captures(address)?;
            let rest = group(&captures, "rest").unwrap_or_default();
            // `HOST::/path` is not a module address
            if rest.starts_with(SEP) {
                return None;
            }
            let (module, path) = match rest.split_once(SEP) {
                Some((module, path)) => (module.to_string(), path.to_string()),
                None => (rest, String::new()),
            };
            Some(Parts {
                user: group(&captures, "user"),
                host: group(&captures, "host"),
                module: Some(module).filter(|module| !module.is_empty()),
                path,
                ..Default::default()
            })
        }
        Scheme::RemoteShell => {
            let captures = REMOTE_SHELL.captures(address)?;
            let path = group(&captures, "path").unwrap_or_default();
            // `proto://...` belongs to the URL grammar
            if path.starts_with("//") {
                return None;
            }
            Some(Parts {
                user: group(&captures, "user"),
                host: group(&captures, "host"),
                path,
                ..Default::default()
            })
        }
        Scheme::LocalPath => {
            let captures = LOCAL_PATH.captures(address)?;
            Some(Parts {
                path: group(&captures, "path").unwrap_or_default(),
                ..Default::default()
            })
        }
    }
}

/// Parsed, normalized address. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    address: String,
    scheme: Scheme,
    user: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    module: Option<String>,
    path: String,
}

impl Location {
    pub fn parse(address: &str) -> Result<Self> {
        if address.is_empty() {
            return Err(Error::invalid_address(address, "address is empty"));
        }
        let mut matches = Scheme::PRIORITY
            .iter()
            .filter_map(|scheme| match_scheme(*scheme, address).map(|parts| (*scheme, parts)))
            .collect::<Vec<_>>();
        if matches.len() > 1 {
            tracing::warn!(
                "address {:?} matches {} grammars ({:?}), using {}",
                address,
                matches.len(),
                matches.iter().map(|(scheme, _)| *scheme).collect::<Vec<_>>(),
                matches[0].0
            );
        }
        if matches.is_empty() {
            return Err(Error::invalid_address(
                address,
                "does not match any of the supported address forms",
            ));
        }
        let (scheme, parts) = matches.swap_remove(0);
        Self::from_parts(address, scheme, parts)
    }

    fn from_parts(address: &str, scheme: Scheme, parts: Parts) -> Result<Self> {
        let port = match &parts.port {
            Some(port) => Some(port.parse::<u16>().map_err(|err| {
                Error::invalid_address(address, format!("bad port {port:?}: {err}"))
            })?),
            None => None,
        };
        let path = match scheme {
            Scheme::LocalPath => {
                if parts.path.is_empty() {
                    ".".to_string()
                } else {
                    parts.path
                }
            }
            Scheme::RemoteShell => {
                if parts.path.is_empty() {
                    "~".to_string()
                } else {
                    parts.path
                }
            }
            Scheme::RsyncUrl | Scheme::RsyncModule => {
                if scheme == Scheme::RsyncUrl && parts.protocol.as_deref() != Some("rsync") {
                    return Err(Error::invalid_address(
                        address,
                        format!("unsupported protocol {:?}", parts.protocol),
                    ));
                }
                if parts.module.is_none() {
                    return Err(Error::invalid_address(address, "rsync address without a module"));
                }
                // paths inside a module are always anchored at the module root
                join(&["/", parts.path.as_str()])
            }
        };
        Ok(Self {
            address: address.to_string(),
            scheme,
            user: parts.user,
            host: parts.host,
            port,
            module: parts.module,
            path,
        })
    }

    /// The string this location was parsed from.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn user_host(&self) -> String {
        let host = self.host.as_deref().unwrap_or_default();
        match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    /// Address prefix shared by every path on this location (empty for local paths).
    pub fn netloc(&self) -> String {
        let module = self.module.as_deref().unwrap_or_default();
        match self.scheme {
            Scheme::LocalPath => String::new(),
            Scheme::RemoteShell => format!("{}:", self.user_host()),
            Scheme::RsyncModule => format!("{}::{module}", self.user_host()),
            Scheme::RsyncUrl => match self.port {
                Some(port) => format!("rsync://{}:{port}/{module}", self.user_host()),
                None => format!("rsync://{}/{module}", self.user_host()),
            },
        }
    }

    /// The addressable root of the scheme, always with a trailing separator.
    pub fn root(&self) -> String {
        match self.scheme {
            Scheme::LocalPath => as_dir(&[self.path.as_str()]),
            Scheme::RemoteShell => {
                if self.path.starts_with(SEP) {
                    format!("{}/", self.netloc())
                } else {
                    format!("{}~/", self.netloc())
                }
            }
            Scheme::RsyncUrl | Scheme::RsyncModule => format!("{}/", self.netloc()),
        }
    }

    /// Full address of this location.
    pub fn url(&self) -> String {
        format!("{}{}", self.netloc(), self.path)
    }

    pub fn url_dir(&self, parts: &[&str]) -> String {
        let url = self.url();
        let mut all = vec![url.as_str()];
        all.extend_from_slice(parts);
        as_dir(&all)
    }

    pub fn url_file(&self, parts: &[&str]) -> String {
        let url = self.url();
        let mut all = vec![url.as_str()];
        all.extend_from_slice(parts);
        as_file(&all)
    }
}

impl std::str::FromStr for Location {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        Self::parse(address)
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.url())
    }
}

fn collapse_separators(path: &str) -> String {
    let mut result = String::with_capacity(path.len());
    let mut prev = None;
    let mut before_prev = None;
    for c in path.chars() {
        // keep the `//` of `proto://`
        if c == SEP && prev == Some(SEP) && before_prev != Some(':') {
            continue;
        }
        result.push(c);
        before_prev = prev;
        prev = Some(c);
    }
    result
}

/// Joins path parts with `/`, ignoring empty parts and redundant separators.
///
/// The result keeps a trailing separator if the last non-empty part had one, so a directory
/// stays a directory after the join.
pub fn join<S: AsRef<str>>(parts: &[S]) -> String {
    let parts = parts
        .iter()
        .map(AsRef::as_ref)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();
    let Some((first, rest)) = parts.split_first() else {
        return String::new();
    };
    let is_dir = parts.last().is_some_and(|part| part.ends_with(SEP));
    let mut first = *first;
    while first.len() > 1 && first.ends_with(SEP) {
        first = &first[..first.len() - 1];
    }
    let mut result = first.to_string();
    for segment in rest
        .iter()
        .flat_map(|part| part.split(SEP))
        .filter(|segment| !segment.is_empty())
    {
        result.push(SEP);
        result.push_str(segment);
    }
    let mut result = collapse_separators(&result);
    if is_dir && !result.ends_with(SEP) {
        result.push(SEP);
    }
    result
}

/// Like [`join`], always ending with a separator.
pub fn as_dir<S: AsRef<str>>(parts: &[S]) -> String {
    let mut result = join(parts);
    if !result.ends_with(SEP) {
        result.push(SEP);
    }
    result
}

/// Like [`join`], never ending with a separator (except for the root `/`).
pub fn as_file<S: AsRef<str>>(parts: &[S]) -> String {
    let mut result = join(parts);
    while result.len() > 1 && result.ends_with(SEP) {
        result.pop();
    }
    result
}

pub fn is_absolute(path: &str) -> bool {
    path.starts_with(SEP)
}

/// Path segments, starting with `/` for absolute paths.
pub fn split(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    if is_absolute(path) {
        segments.push(SEP.to_string());
    }
    segments.extend(
        path.split(SEP)
            .filter(|segment| !segment.is_empty())
            .map(str::to_string),
    );
    segments
}

/// Path of `target` as seen from the directory `from`.
///
/// When both are relative, or both absolute, the longest common prefix is dropped and every
/// remaining segment of `from` becomes `..`. An absolute `target` seen from a relative `from`
/// is returned unchanged; a relative `target` seen from an absolute `from` is anchored
/// below `from`.
pub fn relative_path(target: &str, from: &str) -> String {
    let target_segments = split(target);
    let from_segments = split(from);
    match (is_absolute(target), is_absolute(from)) {
        (true, false) => target.to_string(),
        (false, true) => {
            let mut parts = vec![SEP.to_string()];
            parts.extend(from_segments.into_iter().skip(1));
            parts.extend(target_segments);
            join(&parts)
        }
        _ => {
            let common = target_segments
                .iter()
                .zip(from_segments.iter())
                .take_while(|(target, from)| target == from)
                .count();
            let mut parts = vec!["..".to_string(); from_segments.len() - common];
            parts.extend(target_segments.into_iter().skip(common));
            if parts.is_empty() {
                ".".to_string()
            } else {
                parts.join("/")
            }
        }
    }
}

/// Lexically resolves `.` and `..` segments.
pub fn normalize(path: &str) -> String {
    let absolute = is_absolute(path);
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(SEP) {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(last) if *last != ".." => {
                    segments.pop();
                }
                _ if absolute => {}
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Directory part of `path` (`""` for a bare name).
pub fn parent(path: &str) -> String {
    let path = as_file(&[path]);
    match path.rsplit_once(SEP) {
        Some(("", _)) => SEP.to_string(),
        Some((head, _)) => head.to_string(),
        None => String::new(),
    }
}

/// Last segment of `path`.
pub fn basename(path: &str) -> String {
    let path = as_file(&[path]);
    match path.rsplit_once(SEP) {
        Some((_, name)) => name.to_string(),
        None => path,
    }
}
