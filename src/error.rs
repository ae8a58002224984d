use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Anything wrong with the configuration document. Always fatal: nothing is
/// started once one of these is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file `{path}`: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read config file: {0}")]
    Read(#[source] io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("missing command for process {index}")]
    MissingCommand { index: usize },

    #[error("process {index} sets both `cmd` and `cmds`; pick one")]
    ConflictingCommand { index: usize },
}

/// Why a single run of a supervised process did not succeed.
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    /// The executable could not be started at all.
    #[error("failed to start `{program}`: {source}")]
    Start {
        program: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("exit status {0}")]
    Exit(i32),

    #[error("terminated by signal {0}")]
    Signal(String),

    #[error("failed waiting on process: {0}")]
    Wait(#[source] Arc<io::Error>),
}

impl ProcessError {
    pub fn start(program: impl Into<String>, source: io::Error) -> Self {
        ProcessError::Start {
            program: program.into(),
            source: Arc::new(source),
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, ProcessError::Start { .. })
    }
}

/// Terminal failures of a whole run, keyed by process name.
///
/// Names are not required to be unique, so two failing processes sharing a
/// name collapse into one entry (the last one recorded wins).
#[derive(Debug, Clone, Default)]
pub struct AggregateError {
    failures: BTreeMap<String, ProcessError>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, err: ProcessError) {
        self.failures.insert(name.into(), err);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn get(&self, name: &str) -> Option<&ProcessError> {
        self.failures.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.failures.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProcessError)> {
        self.failures.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// `Ok(())` when nothing failed, otherwise the whole map as an error.
    pub fn into_result(self) -> Result<(), AggregateError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plural = if self.failures.len() == 1 { "" } else { "es" };
        write!(f, "{} process{} failed", self.failures.len(), plural)?;
        for (name, err) in &self.failures {
            write!(f, "\n  ({}) {}", name, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
