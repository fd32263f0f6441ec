//! Configuration for a publish run.
//!
//! Settings come from three layers, later layers winning: an optional TOML file, the process
//! environment, then explicit overrides (command-line flags). [`Settings::workspace`] validates
//! the merged result into the immutable [`WorkspaceConfig`] a run works from.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_REMOTE_URL: &str = "APP_REPO_URL";
pub const ENV_BRANCH: &str = "APP_REPO_BRANCH";
pub const ENV_TARGET_SUBDIR: &str = "APP_SOURCE_SUBDIR";
pub const ENV_LOCAL_PATH: &str = "APP_REPO_LOCAL_PATH";
pub const ENV_PRESERVED_ENTRIES: &str = "APP_PRESERVED_ENTRIES";
pub const ENV_GIT_TIMEOUT: &str = "APP_GIT_TIMEOUT_SECS";
pub const ENV_PORT: &str = "UPLOAD_APP_PORT";
pub const ENV_UPLOADS_DIR: &str = "UPLOADS_DIR";

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_LOCAL_PATH: &str = "temp-app-repo";
pub const DEFAULT_GIT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_PORT: u16 = 3001;

/// Version-control metadata. Always kept when the sync scope is the repository root.
pub const VCS_METADATA_DIR: &str = ".git";
/// Kept by default at the repository root so the CI definitions survive a publish.
pub const CI_DEFINITIONS_DIR: &str = ".github";

/// The part of the working copy that is cleared and repopulated on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    Root,
    Subdir(PathBuf),
}

impl SyncScope {
    /// The scope directory inside the working copy at `local_path`.
    pub fn resolve(&self, local_path: &Path) -> PathBuf {
        match self {
            SyncScope::Root => local_path.to_path_buf(),
            SyncScope::Subdir(subdir) => local_path.join(subdir),
        }
    }

    fn parse(raw: Option<&str>) -> Result<Self, ConfigError> {
        let raw = match raw.map(str::trim) {
            None | Some("") | Some(".") | Some("./") => return Ok(SyncScope::Root),
            Some(raw) => raw,
        };
        let invalid = |reason: &str| ConfigError::Invalid {
            key: ENV_TARGET_SUBDIR,
            reason: format!("'{raw}' {reason}"),
        };
        let mut subdir = PathBuf::new();
        for component in Path::new(raw).components() {
            match component {
                Component::Normal(part) => subdir.push(part),
                Component::CurDir => {}
                Component::ParentDir => return Err(invalid("must not contain '..'")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("must be relative to the repository root"));
                }
            }
        }
        if subdir.starts_with(VCS_METADATA_DIR) {
            return Err(invalid("points into the version-control metadata"));
        }
        Ok(SyncScope::Subdir(subdir))
    }
}

impl std::fmt::Display for SyncScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncScope::Root => write!(f, "repository root"),
            SyncScope::Subdir(subdir) => write!(f, "{}", subdir.display()),
        }
    }
}

/// Everything one publish run needs to know about where to publish. Immutable per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceConfig {
    pub remote_url: String,
    pub branch: String,
    pub local_path: PathBuf,
    pub scope: SyncScope,
    /// Names of top-level entries in the sync scope that survive the clear step.
    pub preserved_entries: BTreeSet<String>,
    /// Upper bound on each network operation (clone, push).
    pub git_timeout: Duration,
}

impl WorkspaceConfig {
    /// Directory the archive is extracted into.
    pub fn scope_dir(&self) -> PathBuf {
        self.scope.resolve(&self.local_path)
    }

    /// The remote URL with any embedded credentials masked, for logs and messages.
    pub fn display_url(&self) -> String {
        redact_url(&self.remote_url)
    }
}

/// One layer of raw, unvalidated settings.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_subdir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preserved_entries: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploads_dir: Option<PathBuf>,
}

impl Settings {
    /// Read settings from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            err,
        })?;
        toml::from_str(&document).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            err,
        })
    }

    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Read settings from `(name, value)` pairs named like the environment variables.
    /// Empty values count as unset.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut settings = Settings::default();
        for (key, value) in vars {
            let value: String = value.into();
            if value.trim().is_empty() {
                continue;
            }
            match key.as_ref() {
                ENV_REMOTE_URL => settings.remote_url = Some(value),
                ENV_BRANCH => settings.branch = Some(value),
                ENV_TARGET_SUBDIR => settings.target_subdir = Some(value),
                ENV_LOCAL_PATH => settings.local_path = Some(PathBuf::from(value)),
                ENV_PRESERVED_ENTRIES => {
                    settings.preserved_entries = Some(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|entry| !entry.is_empty())
                            .map(String::from)
                            .collect(),
                    )
                }
                ENV_GIT_TIMEOUT => {
                    settings.git_timeout_secs = Some(parse_number(ENV_GIT_TIMEOUT, &value)?)
                }
                ENV_PORT => settings.port = Some(parse_number(ENV_PORT, &value)?),
                ENV_UPLOADS_DIR => settings.uploads_dir = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        Ok(settings)
    }

    /// Layer `overrides` on top of `self`. Values set in `overrides` win.
    pub fn merge(self, overrides: Settings) -> Settings {
        Settings {
            remote_url: overrides.remote_url.or(self.remote_url),
            branch: overrides.branch.or(self.branch),
            target_subdir: overrides.target_subdir.or(self.target_subdir),
            local_path: overrides.local_path.or(self.local_path),
            preserved_entries: overrides.preserved_entries.or(self.preserved_entries),
            git_timeout_secs: overrides.git_timeout_secs.or(self.git_timeout_secs),
            port: overrides.port.or(self.port),
            uploads_dir: overrides.uploads_dir.or(self.uploads_dir),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// A copy safe to print: the remote URL has its credentials masked.
    pub fn redacted(&self) -> Settings {
        Settings {
            remote_url: self.remote_url.as_deref().map(redact_url),
            ..self.clone()
        }
    }

    /// Validate into a [`WorkspaceConfig`].
    pub fn workspace(&self) -> Result<WorkspaceConfig, ConfigError> {
        let remote_url = self
            .remote_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::Missing(ENV_REMOTE_URL))?
            .to_string();
        let branch = self
            .branch
            .as_deref()
            .unwrap_or(DEFAULT_BRANCH)
            .trim()
            .to_string();
        if branch.is_empty() || branch.starts_with('-') || branch.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid {
                key: ENV_BRANCH,
                reason: format!("'{branch}' is not a usable branch name"),
            });
        }
        let scope = SyncScope::parse(self.target_subdir.as_deref())?;
        let preserved_entries = preserved_entries(&scope, self.preserved_entries.as_deref())?;
        let git_timeout = match self.git_timeout_secs.unwrap_or(DEFAULT_GIT_TIMEOUT_SECS) {
            0 => {
                return Err(ConfigError::Invalid {
                    key: ENV_GIT_TIMEOUT,
                    reason: "must be greater than zero".to_string(),
                });
            }
            secs => Duration::from_secs(secs),
        };
        Ok(WorkspaceConfig {
            remote_url,
            branch,
            local_path: self
                .local_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_PATH)),
            scope,
            preserved_entries,
            git_timeout,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("'{value}' is not a valid number"),
    })
}

/// Preserved entries are single path segments. At the repository root the version-control
/// metadata is always kept, whatever was configured.
fn preserved_entries(
    scope: &SyncScope,
    configured: Option<&[String]>,
) -> Result<BTreeSet<String>, ConfigError> {
    let mut entries = match configured {
        Some(configured) => configured.iter().cloned().collect::<BTreeSet<_>>(),
        None => match scope {
            SyncScope::Root => [VCS_METADATA_DIR, CI_DEFINITIONS_DIR]
                .into_iter()
                .map(String::from)
                .collect(),
            SyncScope::Subdir(_) => BTreeSet::new(),
        },
    };
    if let Some(bad) = entries
        .iter()
        .find(|entry| entry.contains(['/', '\\']) || *entry == "." || *entry == "..")
    {
        return Err(ConfigError::Invalid {
            key: ENV_PRESERVED_ENTRIES,
            reason: format!("'{bad}' is not a single path segment"),
        });
    }
    if *scope == SyncScope::Root {
        entries.insert(VCS_METADATA_DIR.to_string());
    }
    Ok(entries)
}

const MASK: &str = "****";

/// Mask credentials embedded in a remote URL. The password is always masked; a bare username on
/// an http(s) URL is masked too since that is where access tokens usually go.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some(MASK));
            } else if !parsed.username().is_empty() && parsed.scheme().starts_with("http") {
                let _ = parsed.set_username(MASK);
            }
            parsed.to_string()
        }
        Err(_) => {
            // Not a URL (e.g. scp-like `git@host:path`); mask anything between ':' and '@'
            let start = raw.find("://").map(|i| i + 3).unwrap_or(0);
            match raw[start..].find('@').map(|at| start + at) {
                Some(at) => match raw[start..at].find(':').map(|colon| start + colon) {
                    Some(colon) => format!("{}:{MASK}{}", &raw[..colon], &raw[at..]),
                    None => raw.to_string(),
                },
                None => raw.to_string(),
            }
        }
    }
}
