use std::io::IsTerminal;
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::AggregateError;
use crate::output::{Destination, PrefixWriter, Stream};
use crate::parse::Config;
use crate::runtime::{CommandSupervisor, Status};
use crate::spawn::{Launcher, ProcessLauncher};

/// Runs every configured process at once and reports which ones failed.
pub struct Manager {
    config: Config,
    stdout: Destination,
    stderr: Destination,
    colored: bool,
    launcher: Arc<dyn Launcher>,
    active: Mutex<Option<CancellationToken>>,
}

impl Manager {
    pub fn new(config: Config) -> Self {
        Manager {
            config,
            stdout: Destination::stdout(),
            stderr: Destination::stderr(),
            colored: std::io::stdout().is_terminal(),
            launcher: Arc::new(ProcessLauncher),
            active: Mutex::new(None),
        }
    }

    /// Shared streams for all processes' stdout and stderr respectively.
    pub fn with_outputs(mut self, stdout: Destination, stderr: Destination) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn with_color(mut self, colored: bool) -> Self {
        self.colored = colored;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancels the run in progress, if any. Same effect as SIGINT/SIGTERM.
    pub async fn shutdown(&self) {
        if let Some(token) = self.active.lock().await.as_ref() {
            info!("shutdown requested");
            token.cancel();
        }
    }

    fn build_supervisors(&self) -> Vec<Arc<CommandSupervisor>> {
        let width = self.config.max_name_len();
        self.config
            .procs
            .iter()
            .enumerate()
            .map(|(i, proc)| {
                let writer = |stream, dest: &Destination| {
                    PrefixWriter::new(&proc.name, stream, width, i, self.colored, dest.clone())
                };
                let out = writer(Stream::Stdout, &self.stdout);
                let err = writer(Stream::Stderr, &self.stderr);
                Arc::new(
                    CommandSupervisor::new(proc.clone(), out, err)
                        .with_launcher(Arc::clone(&self.launcher)),
                )
            })
            .collect()
    }

    /*
        @@@
        @run();
        . Derives this run's token from `parent`, so either the caller or a signal can stop everything.
        . Subscribes to SIGINT/SIGTERM for the duration of the run only; the first one cancels the token.
        . Builds one supervisor and one stdout/stderr writer pair per process and starts them all at once.
        . Joins every supervisor, tears the signal listener down, then collects processes that ended Failed.
    */
    pub async fn run(&self, parent: &CancellationToken) -> Result<(), AggregateError> {
        let token = parent.child_token();
        *self.active.lock().await = Some(token.clone());

        let listener = match Signals::new([SIGINT, SIGTERM]) {
            Ok(signals) => {
                let handle = signals.handle();
                let notice = self.stdout.clone();
                let task = tokio::spawn(listen_for_signals(signals, token.clone(), notice));
                Some((handle, task))
            }
            Err(e) => {
                warn!(error = %e, "could not subscribe to termination signals");
                None
            }
        };

        let supervisors = self.build_supervisors();
        info!(count = supervisors.len(), "starting processes");

        let tasks = supervisors.iter().map(|sup| {
            let sup = Arc::clone(sup);
            let token = token.clone();
            tokio::spawn(async move { sup.run(&token).await })
        });
        for (sup, joined) in supervisors.iter().zip(join_all(tasks).await) {
            if let Err(e) = joined {
                error!(process = %sup.name(), error = %e, "supervisor task aborted");
            }
        }

        token.cancel();
        if let Some((handle, task)) = listener {
            handle.close();
            if let Err(e) = task.await {
                warn!(error = %e, "signal listener aborted");
            }
        }
        *self.active.lock().await = None;

        let mut failures = AggregateError::new();
        for sup in &supervisors {
            if sup.status().await != Status::Failed {
                continue;
            }
            if let Some(err) = sup.error().await {
                failures.insert(sup.name(), err);
            }
        }
        info!(failed = failures.len(), "all processes finished");
        failures.into_result()
    }
}

async fn listen_for_signals(mut signals: Signals, token: CancellationToken, notice: Destination) {
    tokio::select! {
        received = signals.next() => {
            if let Some(sig) = received {
                info!(signal = sig, "received signal, shutting down");
                if let Err(e) = notice.write_raw(b"Received signal, shutting down...\n").await {
                    warn!(error = %e, "failed to write shutdown notice");
                }
                token.cancel();
            }
        }
        _ = token.cancelled() => {}
    }
}
