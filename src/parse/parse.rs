use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};

use crate::error::ConfigError;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFail,
    Always,
}

/// What a process definition runs: one executable, or a list of shell
/// statements joined and handed to `sh -c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    Program(String),
    Shell(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "ProcEntry")]
pub struct ProcessConfig {
    pub name: String,
    pub command: CommandSpec,
    pub args: Vec<String>,
    pub envs: BTreeMap<String, String>,
    pub clear_envs: bool,
    pub restart: RestartPolicy,
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    pub procs: Vec<ProcessConfig>,
}

// On-disk shape of one entry, before defaults and validation.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ProcEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    cmds: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    envs: BTreeMap<String, String>,
    #[serde(default, alias = "clearenvs", skip_serializing_if = "is_false")]
    clear_envs: bool,
    #[serde(default)]
    restart: RestartPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workdir: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDoc {
    #[serde(default)]
    procs: Vec<ProcEntry>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl From<ProcessConfig> for ProcEntry {
    fn from(p: ProcessConfig) -> Self {
        let (cmd, cmds) = match p.command {
            CommandSpec::Program(cmd) => (Some(cmd), Vec::new()),
            CommandSpec::Shell(cmds) => (None, cmds),
        };
        ProcEntry {
            name: p.name,
            cmd,
            cmds,
            args: p.args,
            envs: p.envs,
            clear_envs: p.clear_envs,
            restart: p.restart,
            workdir: p.workdir,
        }
    }
}

impl ProcEntry {
    fn validate(self, index: usize) -> Result<ProcessConfig, ConfigError> {
        let cmd = self.cmd.filter(|c| !c.trim().is_empty());
        let command = match (cmd, self.cmds.is_empty()) {
            (Some(_), false) => return Err(ConfigError::ConflictingCommand { index }),
            (Some(cmd), true) => CommandSpec::Program(cmd),
            (None, false) => CommandSpec::Shell(self.cmds),
            (None, true) => return Err(ConfigError::MissingCommand { index }),
        };

        let name = if self.name.is_empty() {
            format!("proc-{}", index)
        } else {
            self.name
        };

        Ok(ProcessConfig {
            name,
            command,
            args: self.args,
            envs: self.envs,
            clear_envs: self.clear_envs,
            restart: self.restart,
            workdir: self.workdir.filter(|w| !w.is_empty()),
        })
    }
}

impl ProcessConfig {
    /// Minimal definition running `cmd` once, mostly for tests and embedding.
    pub fn program(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        ProcessConfig {
            name: name.into(),
            command: CommandSpec::Program(cmd.into()),
            args: Vec::new(),
            envs: BTreeMap::new(),
            clear_envs: false,
            restart: RestartPolicy::Never,
            workdir: None,
        }
    }

    pub fn shell<I, S>(name: impl Into<String>, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessConfig {
            command: CommandSpec::Shell(statements.into_iter().map(Into::into).collect()),
            ..ProcessConfig::program(name, String::new())
        }
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

impl Config {
    /*
        @@@
        @from_yaml();
        . Hands the raw YAML text to serde_yaml; malformed documents and unknown keys come back as Parse errors.
        . Walks the entries in order, defaulting empty names to `proc-<index>` and the restart policy to never.
        . Rejects the first entry with no command (or with both `cmd` and `cmds`), naming its position.
    */
    pub fn from_yaml(text: &str) -> Result<Config, ConfigError> {
        let doc: ConfigDoc = serde_yaml::from_str(text)?;
        let procs = doc
            .procs
            .into_iter()
            .enumerate()
            .map(|(i, entry)| entry.validate(i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Config { procs })
    }

    /*
        @@@
        @read();
        . Reads the document from `path`, or from standard input when `path` is `-` (or empty).
        . Any I/O error (file not found, permission denied, etc.) is returned as a ConfigError.
    */
    pub fn read(path: &str) -> Result<Config, ConfigError> {
        let text = if path.is_empty() || path == "-" {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(ConfigError::Read)?;
            buf
        } else {
            fs::read_to_string(path).map_err(|source| ConfigError::Open {
                path: path.to_string(),
                source,
            })?
        };
        Config::from_yaml(&text)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Widest process name, used to line up output prefixes.
    pub fn max_name_len(&self) -> usize {
        self.procs
            .iter()
            .map(|p| p.name.chars().count())
            .max()
            .unwrap_or(0)
    }
}
