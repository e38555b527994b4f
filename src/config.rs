use crate::{
    distribution::DataDistribution,
    remote::Transport,
    scheduler::TaskBody,
    types::Rank,
};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Configuration entry-point for instantiating a taskpool.
///
/// A concrete `Config` binds the collaborators the engine talks to: where
/// instances live, how activations travel and what a task does.
pub trait Config: Sized + 'static {
    /// Answers the owning rank of an instance.
    type Distribution: DataDistribution;
    /// Delivers activation messages to other ranks.
    type Transport: Transport;
    /// Body run for every ready instance.
    type Body: TaskBody;
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("reading config file at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Order in which a worker serves its own ready queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    #[default]
    Lifo,
    Fifo,
}

/// Runtime settings of one process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub rank: Rank,
    pub nb_ranks: usize,
    pub nb_workers: usize,
    pub queue_policy: QueuePolicy,
    /// Send activations for successors owned by other ranks.
    pub forward_remote: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            nb_ranks: 1,
            nb_workers: std::thread::available_parallelism().map_or(1, usize::from),
            queue_policy: QueuePolicy::default(),
            forward_remote: true,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a TOML document; missing keys take their default.
    ///
    /// # Errors
    /// On malformed TOML or invalid values.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// If the file cannot be read, or see [`Self::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// # Errors
    /// If there are no ranks or workers, or `rank` is not below `nb_ranks`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Self {
            rank,
            nb_ranks,
            nb_workers,
            queue_policy: _,
            forward_remote: _,
        } = self;
        if *nb_ranks == 0 {
            return Err(ConfigError::Invalid("nb_ranks must be at least 1".into()));
        }
        if *nb_workers == 0 {
            return Err(ConfigError::Invalid("nb_workers must be at least 1".into()));
        }
        if *rank as usize >= *nb_ranks {
            return Err(ConfigError::Invalid(format!(
                "rank {rank} is not below nb_ranks {nb_ranks}"
            )));
        }
        Ok(())
    }
}
