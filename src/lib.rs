/* src/lib.rs */

// Re-export modules for both binary and tests
pub mod control;
pub mod error;
pub mod logger;
pub mod output;
pub mod parse;
pub mod runtime;
pub mod spawn;

pub use control::Manager;
pub use error::{AggregateError, ConfigError, ProcessError};
pub use output::{Destination, PrefixWriter, SharedBuffer, Stream};
pub use parse::{CommandSpec, Config, ProcessConfig, RestartPolicy};
pub use runtime::{should_restart, CommandSupervisor, Status};
pub use spawn::{CommandPlan, Exit, Launcher, ProcessLauncher};

// re-exported so callers don't need a direct tokio-util dependency
pub use tokio_util::sync::CancellationToken;
