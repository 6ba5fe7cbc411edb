use crate::protocol::{ConnectInfo, Vocabulary};
use globset::GlobBuilder;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    env,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Environment variables carrying the rank of a distributed job, in lookup order
pub const RANK_VARIABLES: [&str; 3] = ["PMI_RANK", "OMPI_COMM_WORLD_RANK", "SLURM_PROCID"];

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Failed to read configuration {path:?}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Configuration {path:?} is malformed")]
    Malformed {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("Failed to retrieve the hostname")]
    Hostname(#[from] nix::errno::Errno),
    #[error("Neither 'path' nor 'prefix' is set, unable to name the log")]
    MissingLogPath,
    #[error("Configuration failed its preflight checks")]
    Preflight,
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigErrors> {
    let content = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
        path: path.to_path_buf(),
        source,
    })?;

    serde_yaml::from_str(&content).map_err(|source| ConfigErrors::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

/// Settings of the merge loader; CLI flags are merged on top
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct LoaderConfig {
    #[serde(default, alias = "db")]
    pub database: DatabaseConfig,
    /// vocabulary every log has to declare, any if unset
    #[serde(default)]
    pub format: Option<Vocabulary>,
    #[serde(default)]
    pub mark_done: bool,
    /// discovery pattern, e.g. `run.*.log`
    #[serde(default)]
    pub glob: Option<String>,
}

impl LoaderConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let config: Self = read_yaml(path)?;
        debug!(path = ?path, config = ?config, "Loaded loader configuration");

        Ok(config)
    }

    /// Check everything at once so a user sees all problems in one run; true if any was found
    pub fn preflight_checks(&self, files: &[PathBuf]) -> bool {
        let mut contains_error = false;

        if files.is_empty() && self.glob.is_none() {
            error!("No log files were given and no glob is configured, nothing to merge");
            contains_error = true;
        }

        if !files.is_empty() && self.glob.is_some() {
            warn!("Both log files and a glob were given, the files discovered by the glob are merged after the listed ones");
        }

        for file in files {
            if !file.is_file() {
                error!("Log file {} does not exist or is not a file", file.to_string_lossy());
                contains_error = true;
            }
        }

        if let Some(ref glob) = self.glob {
            if let Err(error) = GlobBuilder::new(glob).literal_separator(true).build() {
                error!("glob '{glob}' is invalid: {error}");
                contains_error = true;
            }
        }

        if self.database.path.is_dir() {
            error!(
                "database.path ({}) is a directory",
                self.database.path.to_string_lossy()
            );
            contains_error = true;
        }

        if let Some(parent) = self.database.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                error!(
                    "The directory of database.path ({}) does not exist",
                    parent.to_string_lossy()
                );
                contains_error = true;
            }
        }

        contains_error
    }
}

/// Settings of a producer writing one log
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct RecorderConfig {
    /// explicit log path, takes precedence over `prefix`
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// per-producer logs named `<prefix>.<rank>.log`
    #[serde(default)]
    pub prefix: Option<PathBuf>,
    #[serde(default)]
    pub format: Vocabulary,
    /// side file keeping fact ids unique across restarts
    #[serde(default)]
    pub offsets: Option<PathBuf>,
    #[serde(default)]
    pub connect: ConnectInfo,
    /// also write a constructor line before every commit
    #[serde(default)]
    pub constructors: bool,
}

impl RecorderConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        read_yaml(path)
    }

    pub fn log_path(&self) -> Result<PathBuf, ConfigErrors> {
        match (&self.path, &self.prefix) {
            (Some(path), _) => Ok(path.clone()),
            (None, Some(prefix)) => Ok(rank_log_path(prefix, &producer_rank()?)),
            (None, None) => Err(ConfigErrors::MissingLogPath),
        }
    }
}

/// `<prefix>.<rank>.log`
pub fn rank_log_path(prefix: &Path, rank: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(format!(".{rank}.log"));

    PathBuf::from(name)
}

/// Rank of this process in a distributed job, or `<hostname>-<pid>` outside of one
pub fn producer_rank() -> Result<String, ConfigErrors> {
    for variable in RANK_VARIABLES {
        if let Ok(rank) = env::var(variable) {
            if !rank.trim().is_empty() {
                debug!(variable = variable, rank = %rank, "Found producer rank");

                return Ok(rank.trim().to_owned());
            }
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => Ok(format!(
            "{}-{}",
            hostname.to_string_lossy(),
            nix::unistd::getpid()
        )),
        Err(error) => {
            error!(error = ?error, "Failed to retrieve hostname for the producer log name: {error}");

            Err(ConfigErrors::Hostname(error))
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("perfrec.db")
}

fn default_busy_timeout() -> u64 {
    5000
}
