use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProcessError;
use crate::output::PrefixWriter;
use crate::parse::{CommandSpec, ProcessConfig};

const SHELL: &str = "sh";
const READ_CHUNK: usize = 4096;

/// Replaces every `${NAME}` in `text` with `lookup(NAME)`. A `$` not
/// followed by a closed `{...}` is left alone for the shell to see.
pub fn expand<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> String,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("${") {
        let body = &rest[pos + 2..];
        match body.find('}') {
            Some(end) => {
                out.push_str(&rest[..pos]);
                out.push_str(&lookup(&body[..end]));
                rest = &body[end + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// Three-tier variable lookup for one process: explicit `envs` first, then
/// nothing at all if `clear-envs` is set, then the ambient environment.
pub struct EnvResolver<'a, A> {
    envs: &'a BTreeMap<String, String>,
    clear_envs: bool,
    ambient: A,
}

impl<'a, A> EnvResolver<'a, A>
where
    A: Fn(&str) -> Option<String>,
{
    pub fn new(config: &'a ProcessConfig, ambient: A) -> Self {
        EnvResolver {
            envs: &config.envs,
            clear_envs: config.clear_envs,
            ambient,
        }
    }

    pub fn lookup(&self, key: &str) -> String {
        if let Some(v) = self.envs.get(key) {
            return v.clone();
        }
        if self.clear_envs {
            return String::new();
        }
        (self.ambient)(key).unwrap_or_default()
    }

    pub fn expand(&self, text: &str) -> String {
        expand(text, |k| self.lookup(k))
    }

    pub fn expand_bare(&self, text: &str) -> String {
        expand_bare(text, |k| self.lookup(k))
    }
}

/// Like [`expand`], but also replaces bare `$NAME` (letters, digits, `_`).
/// Used for text that reaches the child without a shell in between.
pub fn expand_bare<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> String,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let body = &rest[pos + 1..];
        if let Some(braced) = body.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                out.push_str(&lookup(&braced[..end]));
                rest = &braced[end + 1..];
                continue;
            }
            out.push('$');
            rest = body;
            continue;
        }
        let end = body
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(body.len());
        if end == 0 {
            out.push('$');
        } else {
            out.push_str(&lookup(&body[..end]));
        }
        rest = &body[end..];
    }
    out.push_str(rest);
    out
}

fn process_env(key: &str) -> Option<String> {
    std::env::var_os(key).map(|v| v.to_string_lossy().into_owned())
}

/// Everything needed to start one child, with variables already expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub envs: BTreeMap<String, String>,
    pub clear_envs: bool,
}

impl CommandPlan {
    pub fn build(config: &ProcessConfig) -> Self {
        Self::build_with(config, process_env)
    }

    /*
        @@@
        @build_with();
        . Expands `${VAR}` in the command text and every argument through the three-tier lookup.
        . Text no shell will parse (a direct `cmd`, every arg) also gets bare `$VAR` expanded.
        . A single `cmd` becomes a direct exec of that program with the expanded args.
        . A `cmds` list is joined with "; " and run as `sh -c <joined>`, expanded args appended after it.
        . The working directory falls back to "." when unset.
    */
    pub fn build_with<A>(config: &ProcessConfig, ambient: A) -> Self
    where
        A: Fn(&str) -> Option<String>,
    {
        let env = EnvResolver::new(config, ambient);
        let extra: Vec<String> = config.args.iter().map(|a| env.expand_bare(a)).collect();

        let (program, args) = match &config.command {
            CommandSpec::Program(cmd) => (env.expand_bare(cmd), extra),
            CommandSpec::Shell(statements) => {
                let joined = statements
                    .iter()
                    .map(|s| env.expand(s))
                    .collect::<Vec<_>>()
                    .join("; ");
                let mut args = Vec::with_capacity(extra.len() + 2);
                args.push("-c".to_string());
                args.push(joined);
                args.extend(extra);
                (SHELL.to_string(), args)
            }
        };

        CommandPlan {
            program,
            args,
            workdir: PathBuf::from(config.workdir.as_deref().unwrap_or(".")),
            envs: config.envs.clone(),
            clear_envs: config.clear_envs,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.workdir);
        if self.clear_envs {
            cmd.env_clear();
        }
        cmd.envs(&self.envs);
        cmd
    }
}

/// How one launch ended.
#[derive(Debug)]
pub enum Exit {
    Finished(Result<(), ProcessError>),
    Cancelled,
}

/// Starts one child and blocks until it exits, or kills it once `cancel`
/// fires.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(
        &self,
        plan: &CommandPlan,
        stdout: &PrefixWriter,
        stderr: &PrefixWriter,
        cancel: &CancellationToken,
    ) -> Exit;
}

/// Real OS processes via `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    /*
        @@@
        @launch();
        . Spawns the child in its own process group with stdin on /dev/null and both output pipes pumped into the writers.
        . A spawn failure returns immediately as a Start error, without waiting on anything.
        . On cancellation the whole group gets SIGKILL and the child is reaped before returning Cancelled.
        . On a normal exit, waits for the pumps to drain so no trailing output is lost.
        . Cancellation while draining still kills the group and reports Cancelled.
    */
    async fn launch(
        &self,
        plan: &CommandPlan,
        stdout: &PrefixWriter,
        stderr: &PrefixWriter,
        cancel: &CancellationToken,
    ) -> Exit {
        let mut cmd = plan.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Exit::Finished(Err(ProcessError::start(&plan.program, e))),
        };
        let pid = child.id();
        info!(process = %stdout.name(), pid = ?pid, program = %plan.program, "spawned");

        let pumps: Vec<_> = [
            child.stdout.take().map(|r| tokio::spawn(pump(r, stdout.clone()))),
            child.stderr.take().map(|r| tokio::spawn(pump(r, stderr.clone()))),
        ]
        .into_iter()
        .flatten()
        .collect();
        let aborts: Vec<_> = pumps.iter().map(|p| p.abort_handle()).collect();

        let waited = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                terminate(&mut child, pid, stdout.name()).await;
                aborts.iter().for_each(|a| a.abort());
                return Exit::Cancelled;
            }
        };

        // a backgrounded grandchild can hold the pipes open past the exit
        tokio::select! {
            _ = futures::future::join_all(pumps) => {}
            _ = cancel.cancelled() => {
                kill_group(pid, stdout.name());
                aborts.iter().for_each(|a| a.abort());
                info!(process = %stdout.name(), "terminated while draining output");
                return Exit::Cancelled;
            }
        }

        match waited {
            Ok(status) => Exit::Finished(exit_result(status)),
            Err(e) => Exit::Finished(Err(ProcessError::Wait(e.into()))),
        }
    }
}

/// SIGKILL to the whole process group led by `pid`. The group outlives its
/// leader while any member is alive.
fn kill_group(pid: Option<u32>, name: &str) -> bool {
    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()).map(Pid::from_raw) else {
        return false;
    };
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => true,
        Err(e) => {
            debug!(process = %name, error = %e, "killpg failed");
            false
        }
    }
}

async fn terminate(child: &mut tokio::process::Child, pid: Option<u32>, name: &str) {
    if !kill_group(pid, name) {
        if let Err(e) = child.start_kill() {
            warn!(process = %name, error = %e, "failed to kill child");
        }
    }
    if let Err(e) = child.wait().await {
        warn!(process = %name, error = %e, "failed to reap child");
    }
    info!(process = %name, "terminated on shutdown");
}

/// Maps an exit status onto the error taxonomy; success is `Ok`.
pub fn exit_result(status: ExitStatus) -> Result<(), ProcessError> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(ProcessError::Exit(code));
    }
    match status.signal() {
        Some(sig) => {
            let name = Signal::try_from(sig)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| sig.to_string());
            Err(ProcessError::Signal(name))
        }
        None => Err(ProcessError::Exit(-1)),
    }
}

async fn pump<R>(mut reader: R, out: PrefixWriter)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    let mut sink_ok = true;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                // keep draining after a failed write so the child never blocks on a full pipe
                if sink_ok {
                    if let Err(e) = out.write(&buf[..n]).await {
                        warn!(
                            process = %out.name(),
                            stream = %out.stream(),
                            error = %e,
                            "output write failed"
                        );
                        sink_ok = false;
                    }
                }
            }
            Err(e) => {
                debug!(
                    process = %out.name(),
                    stream = %out.stream(),
                    error = %e,
                    "pipe read failed"
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::ProcessConfig;

    fn ambient_y(key: &str) -> Option<String> {
        (key == "NAME").then(|| "y".to_string())
    }

    #[test]
    fn expand_replaces_braced_names_only() {
        let got = expand("a ${X} $Y ${Z}!", |k| k.to_lowercase());
        assert_eq!(got, "a x $Y z!");
    }

    #[test]
    fn expand_bare_replaces_both_forms() {
        let got = expand_bare("$HOME/${X}_$Y-z $ $", |k| k.to_lowercase());
        assert_eq!(got, "home/x_y-z $ $");
        assert_eq!(expand_bare("cost $5", |_| "n".into()), "cost n");
        assert_eq!(expand_bare("${A}", |_| "$B".into()), "$B");
        assert_eq!(expand_bare("${open", |_| "x".into()), "${open");
    }

    #[test]
    fn expand_leaves_unclosed_reference() {
        assert_eq!(expand("cost ${oops", |_| "x".into()), "cost ${oops");
        assert_eq!(expand("${}", |_| "empty".into()), "empty");
    }

    #[test]
    fn explicit_env_wins() {
        let mut cfg = ProcessConfig::program("p", "echo");
        cfg.envs.insert("NAME".into(), "x".into());
        assert_eq!(EnvResolver::new(&cfg, ambient_y).lookup("NAME"), "x");
    }

    #[test]
    fn cleared_env_resolves_to_empty() {
        let mut cfg = ProcessConfig::program("p", "echo");
        cfg.clear_envs = true;
        assert_eq!(EnvResolver::new(&cfg, ambient_y).lookup("NAME"), "");
    }

    #[test]
    fn ambient_env_is_the_fallback() {
        let cfg = ProcessConfig::program("p", "echo");
        let env = EnvResolver::new(&cfg, ambient_y);
        assert_eq!(env.lookup("NAME"), "y");
        assert_eq!(env.lookup("UNSET_ELSEWHERE"), "");
    }

    #[test]
    fn single_command_plan() {
        let mut cfg = ProcessConfig::program("p", "${BIN}");
        cfg.args = vec!["--name=${NAME}".into(), "plain".into()];
        cfg.envs.insert("BIN".into(), "echo".into());

        let plan = CommandPlan::build_with(&cfg, ambient_y);
        assert_eq!(plan.program, "echo");
        assert_eq!(plan.args, vec!["--name=y", "plain"]);
        assert_eq!(plan.workdir, PathBuf::from("."));
    }

    #[test]
    fn direct_exec_args_expand_bare_names() {
        let mut cfg = ProcessConfig::program("p", "echo");
        cfg.args = vec!["$NAME".into(), "$NAME.txt".into()];

        let plan = CommandPlan::build_with(&cfg, ambient_y);
        assert_eq!(plan.args, vec!["y", "y.txt"]);
    }

    #[test]
    fn shell_plan_joins_statements() {
        let mut cfg = ProcessConfig::shell("p", ["echo ${NAME} $NAME", "sleep 1"]);
        cfg.args = vec!["${NAME}-arg".into()];
        cfg.workdir = Some("/tmp".into());

        let plan = CommandPlan::build_with(&cfg, ambient_y);
        assert_eq!(plan.program, "sh");
        assert_eq!(plan.args, vec!["-c", "echo y $NAME; sleep 1", "y-arg"]);
        assert_eq!(plan.workdir, PathBuf::from("/tmp"));
    }

    #[tokio::test]
    async fn real_process_exit_codes() {
        use crate::output::{Destination, SharedBuffer, Stream};

        let buf = SharedBuffer::new();
        let dest = Destination::new(buf.clone());
        let out = PrefixWriter::new("p", Stream::Stdout, 1, 0, false, dest.clone());
        let err = PrefixWriter::new("p", Stream::Stderr, 1, 0, false, dest);
        let cancel = CancellationToken::new();

        let ok = CommandPlan::build(&ProcessConfig::shell("p", ["echo hi"]));
        let exit = ProcessLauncher.launch(&ok, &out, &err, &cancel).await;
        assert!(matches!(exit, Exit::Finished(Ok(()))));
        assert_eq!(buf.to_string_lossy(), "p (stdout) | hi\n");

        let failing = CommandPlan::build(&ProcessConfig::shell("p", ["exit 3"]));
        let exit = ProcessLauncher.launch(&failing, &out, &err, &cancel).await;
        assert!(matches!(exit, Exit::Finished(Err(ProcessError::Exit(3)))));

        let missing = CommandPlan::build(&ProcessConfig::program("p", "nonexistent-binary-xyz"));
        let exit = ProcessLauncher.launch(&missing, &out, &err, &cancel).await;
        match exit {
            Exit::Finished(Err(e)) => assert!(e.is_start()),
            other => panic!("expected start error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        use crate::output::{Destination, SharedBuffer, Stream};

        let dest = Destination::new(SharedBuffer::new());
        let out = PrefixWriter::new("p", Stream::Stdout, 1, 0, false, dest.clone());
        let err = PrefixWriter::new("p", Stream::Stderr, 1, 0, false, dest);
        let cancel = CancellationToken::new();

        let mut cfg = ProcessConfig::program("p", "sleep");
        cfg.args = vec!["30".into()];
        let plan = CommandPlan::build(&cfg);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let exit = ProcessLauncher.launch(&plan, &out, &err, &cancel).await;
        assert!(matches!(exit, Exit::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[test]
    fn signal_exit_is_named() {
        // raw wait status: terminated by signal 9
        let status = ExitStatus::from_raw(9);
        match exit_result(status) {
            Err(ProcessError::Signal(name)) => assert_eq!(name, "SIGKILL"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
