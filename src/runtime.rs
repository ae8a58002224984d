use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProcessError;
use crate::output::PrefixWriter;
use crate::parse::{ProcessConfig, RestartPolicy};
use crate::spawn::{CommandPlan, Exit, Launcher, ProcessLauncher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotStarted,
    Running,
    Done,
    Failed,
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::NotStarted => "not-started",
            Status::Running => "running",
            Status::Done => "done",
            Status::Failed => "failed",
            Status::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Restart decision once a run has ended (or failed to start).
pub fn should_restart(policy: RestartPolicy, outcome: &Result<(), ProcessError>) -> bool {
    match policy {
        RestartPolicy::Never => false,
        RestartPolicy::OnFail => outcome.is_err(),
        RestartPolicy::Always => true,
    }
}

#[derive(Debug)]
struct RunState {
    status: Status,
    error: Option<ProcessError>,
}

/// Owns the lifecycle of one configured process: start, wait, restart per
/// policy, and stop on cancellation.
pub struct CommandSupervisor {
    config: ProcessConfig,
    stdout: PrefixWriter,
    stderr: PrefixWriter,
    launcher: Arc<dyn Launcher>,
    state: RwLock<RunState>,
    launches: AtomicUsize,
}

impl CommandSupervisor {
    pub fn new(config: ProcessConfig, stdout: PrefixWriter, stderr: PrefixWriter) -> Self {
        CommandSupervisor {
            config,
            stdout,
            stderr,
            launcher: Arc::new(ProcessLauncher),
            state: RwLock::new(RunState {
                status: Status::NotStarted,
                error: None,
            }),
            launches: AtomicUsize::new(0),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub async fn status(&self) -> Status {
        self.state.read().await.status
    }

    /// Error from the most recent run, if it failed.
    pub async fn error(&self) -> Option<ProcessError> {
        self.state.read().await.error.clone()
    }

    /// How many times a start has been attempted.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    async fn set_status(&self, status: Status) {
        self.state.write().await.status = status;
    }

    async fn finish_run(&self, outcome: &Result<(), ProcessError>) {
        let mut state = self.state.write().await;
        match outcome {
            Ok(()) => {
                state.status = Status::Done;
                state.error = None;
            }
            Err(e) => {
                state.status = Status::Failed;
                state.error = Some(e.clone());
            }
        }
    }

    async fn note(&self, msg: &str) {
        if let Err(e) = self.stdout.log(msg).await {
            debug!(process = %self.name(), error = %e, "failed to write lifecycle line");
        }
    }

    /*
        @@@
        @run();
        . Loops start -> wait -> decide until the process settles, returning the terminal outcome.
        . Cancellation is checked before every start; once fired the status becomes Stopped and nothing else starts.
        . A live child is killed by the launcher when the same token fires, which also ends the loop as Stopped.
        . A run that finished on its own but is only seen after the token fired also ends Stopped, whatever the policy.
        . Spawn errors count as failures for the restart policy but skip the wait entirely.
        . Only a terminal Failed returns Err; Done and Stopped return Ok.
    */
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), ProcessError> {
        loop {
            if cancel.is_cancelled() {
                self.set_status(Status::Stopped).await;
                info!(process = %self.name(), "stopped before start");
                return Ok(());
            }

            let plan = CommandPlan::build(&self.config);
            self.note("Starting...").await;
            self.set_status(Status::Running).await;
            let attempt = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(process = %self.name(), attempt, program = %plan.program, "starting");

            let outcome = match self
                .launcher
                .launch(&plan, &self.stdout, &self.stderr, cancel)
                .await
            {
                Exit::Cancelled => {
                    self.set_status(Status::Stopped).await;
                    info!(process = %self.name(), "stopped");
                    self.note("Stopped").await;
                    return Ok(());
                }
                Exit::Finished(outcome) => outcome,
            };

            self.finish_run(&outcome).await;
            match &outcome {
                Ok(()) => info!(process = %self.name(), status = %Status::Done, "exited"),
                Err(e) if e.is_start() => {
                    warn!(process = %self.name(), error = %e, "failed to start");
                    self.note(&format!("Error starting command: {}", e)).await;
                }
                Err(e) => {
                    warn!(process = %self.name(), status = %Status::Failed, error = %e, "exited")
                }
            }

            // the token may have fired while the launcher was returning
            if cancel.is_cancelled() {
                self.set_status(Status::Stopped).await;
                info!(process = %self.name(), "stopped after exit");
                self.note("Stopped").await;
                return Ok(());
            }

            if should_restart(self.config.restart, &outcome) {
                info!(process = %self.name(), restart = ?self.config.restart, "restarting");
                self.note("Restarting...").await;
                // let a tight restart loop still observe cancellation
                tokio::task::yield_now().await;
                continue;
            }

            self.note("Finished").await;
            return outcome;
        }
    }
}

impl fmt::Debug for CommandSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSupervisor")
            .field("name", &self.config.name)
            .field("restart", &self.config.restart)
            .field("launches", &self.launches())
            .finish_non_exhaustive()
    }
}
