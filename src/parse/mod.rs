mod parse;
mod sample;

pub use parse::{CommandSpec, Config, ProcessConfig, RestartPolicy};
