use std::io::IsTerminal;
use std::path::Path;

use tracing::subscriber::SetGlobalDefaultError;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::SubscriberBuilder;

/// Maps `-v` repetitions to a level: warn, info, then debug.
pub fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    }
}

/*
    @@@
    @init_tracing();
    . With `log_dir`, creates a daily-rotating `multirun.log` there; otherwise logs go to stderr.
    . Either way the writer is wrapped in a non-blocking appender so child output is never held up by logging.
    . Installs a fmt subscriber at the level picked by `verbosity` (with targets and levels).
    . Returns the guard; dropping it flushes and stops the background writer.
*/
pub fn init_tracing(
    verbosity: u8,
    log_dir: Option<&Path>,
) -> Result<WorkerGuard, SetGlobalDefaultError> {
    let (writer, guard) = match log_dir {
        Some(dir) => {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "multirun.log");
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = SubscriberBuilder::default()
        .with_ansi(log_dir.is_none() && std::io::stderr().is_terminal())
        .with_target(true)
        .with_level(true)
        .with_writer(writer)
        .with_max_level(level_for(verbosity))
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}
