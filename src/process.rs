//! Build and exec command management
//!
//! Commands run through the [`CommandRunner`] capability. Long-running exec
//! commands belong to a [`Generation`], a cancellation scope that is replaced
//! wholesale on every change; cancelling it terminates every process spawned
//! under it.

use anyhow::Context;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval between readiness check attempts
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default time between SIGTERM and SIGKILL when a generation is cancelled
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// One configured command: a build step or a long-running exec step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Command line, split shell-style
    #[serde(rename = "cmd")]
    pub command: String,

    /// Command polled until it exits zero before the step counts as ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl CommandSpec {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }
}

/// Split a command line into program and arguments
pub fn split_command(line: &str) -> anyhow::Result<(String, Vec<String>)> {
    let mut words = shell_words::split(line)
        .with_context(|| format!("cannot parse command line {:?}", line))?
        .into_iter();
    let program = words
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty command line"))?;
    Ok((program, words.collect()))
}

/// Where a command's stdout/stderr go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// Share the developer's terminal
    Inherit,
    /// Drop output (readiness checks)
    Discard,
}

/// How a command run to completion ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Success,
    /// Non-zero exit, or killed by a signal (no code)
    Failed(Option<i32>),
    /// Its cancellation scope fired first
    Cancelled,
}

/// Capability to execute external commands.
pub trait CommandRunner: Send + Sync + 'static {
    /// Run a command to completion, terminating it if `cancel` fires.
    fn run(
        &self,
        command: &str,
        output: Output,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<CommandOutcome>>;

    /// Start a long-running command bound to `cancel`. Returns once spawned.
    fn spawn(&self, command: &str, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Runs commands as OS child processes.
///
/// On Unix each child leads its own process group so cancellation reaches
/// whatever the command forks (`go run`, `npm start`, shell wrappers).
#[derive(Debug, Clone)]
pub struct OsCommandRunner {
    grace_period: Duration,
}

impl Default for OsCommandRunner {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl OsCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    fn command(line: &str, output: Output) -> anyhow::Result<Command> {
        let (program, args) = split_command(line)?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        match output {
            Output::Inherit => {
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
            }
            Output::Discard => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        Ok(cmd)
    }
}

impl CommandRunner for OsCommandRunner {
    fn run(
        &self,
        command: &str,
        output: Output,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<CommandOutcome>> {
        let prepared = Self::command(command, output);
        let command = command.to_string();
        let grace_period = self.grace_period;

        Box::pin(async move {
            let mut child = prepared?
                .spawn()
                .with_context(|| format!("failed to start {:?}", command))?;

            tokio::select! {
                status = child.wait() => {
                    let status = status.with_context(|| format!("failed to wait for {:?}", command))?;
                    if status.success() {
                        Ok(CommandOutcome::Success)
                    } else {
                        Ok(CommandOutcome::Failed(status.code()))
                    }
                }
                _ = cancel.cancelled() => {
                    terminate(&command, &mut child, grace_period).await;
                    Ok(CommandOutcome::Cancelled)
                }
            }
        })
    }

    fn spawn(&self, command: &str, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut child = Self::command(command, Output::Inherit)?
            .spawn()
            .with_context(|| format!("failed to start {:?}", command))?;
        let pid = child.id().unwrap_or(0);
        info!(command, pid, "Process spawned");

        let command = command.to_string();
        let grace_period = self.grace_period;
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => info!(command = %command, pid, "Process exited"),
                    Ok(status) => warn!(command = %command, pid, code = ?status.code(), "Process exited with failure"),
                    Err(e) => warn!(command = %command, pid, error = %e, "Error waiting for process"),
                },
                _ = cancel.cancelled() => terminate(&command, &mut child, grace_period).await,
            }
        });

        Ok(())
    }
}

/// Stop a child: SIGTERM to its group, then SIGKILL once the grace period runs out
async fn terminate(command: &str, child: &mut Child, grace_period: Duration) {
    let pid = child.id();
    if let Some(pid) = pid {
        debug!(command, pid, "Sending SIGTERM");

        #[cfg(unix)]
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(command, ?status, "Process stopped");
        }
        Ok(Err(e)) => {
            warn!(command, error = %e, "Error waiting for process to stop");
        }
        Err(_) => {
            warn!(
                command,
                grace_period_ms = grace_period.as_millis() as u64,
                "Grace period exceeded, sending SIGKILL"
            );
            #[cfg(unix)]
            if let Some(pid) = pid {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
            let _ = child.kill().await;
        }
    }
}

/// One cancellable epoch of exec processes
#[derive(Debug, Clone)]
pub struct Generation {
    id: u64,
    token: CancellationToken,
}

impl Generation {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Scope every process of this generation is bound to
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Owner of the single current generation.
///
/// Generations are children of a root token, so cancelling the root (shutdown)
/// cancels whichever generation is current.
#[derive(Debug)]
pub struct GenerationHolder {
    root: CancellationToken,
    next_id: u64,
    current: Option<Generation>,
}

impl GenerationHolder {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            next_id: 1,
            current: None,
        }
    }

    /// Replace the current generation with a fresh one, cancelling the old one.
    pub fn advance(&mut self) -> Generation {
        let generation = Generation {
            id: self.next_id,
            token: self.root.child_token(),
        };
        self.next_id += 1;

        if let Some(previous) = self.current.replace(generation.clone()) {
            debug!(generation = previous.id, "Cancelling generation");
            previous.cancel();
        }
        generation
    }

    pub fn current(&self) -> Option<&Generation> {
        self.current.as_ref()
    }

    pub fn cancel_current(&mut self) {
        if let Some(current) = self.current.take() {
            debug!(generation = current.id, "Cancelling generation");
            current.cancel();
        }
    }
}

/// Lifecycle of one exec step within a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    NotStarted,
    /// Spawned; readiness check not yet passing
    Polling,
    Ready,
    Cancelled,
    /// Could not be spawned
    Failed,
}

impl StepState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, StepState::NotStarted | StepState::Polling)
    }
}

/// Overall readiness of a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// Every step is ready (or failed to spawn, which was logged)
    Ready,
    /// The generation was cancelled before all checks passed
    Cancelled,
}

enum StepHandle {
    Settled(StepState),
    Polling(JoinHandle<StepState>),
}

/// Pending readiness of the exec steps of one generation
pub struct Readiness {
    generation: u64,
    steps: Vec<StepHandle>,
}

impl Readiness {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait until every step has settled
    pub async fn wait(self) -> ReadyOutcome {
        let mut outcome = ReadyOutcome::Ready;
        for step in self.steps {
            let state = match step {
                StepHandle::Settled(state) => state,
                StepHandle::Polling(handle) => handle.await.unwrap_or(StepState::Cancelled),
            };
            if state == StepState::Cancelled {
                outcome = ReadyOutcome::Cancelled;
            }
        }
        outcome
    }
}

/// Runs build steps and starts exec steps under generations.
#[derive(Clone)]
pub struct ProcessOrchestrator {
    runner: Arc<dyn CommandRunner>,
    poll_interval: Duration,
}

impl ProcessOrchestrator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            poll_interval: READINESS_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run build steps one after another, in order.
    ///
    /// Failures are logged and the next step still runs. Stops early only if
    /// `cancel` fires. Returns the number of steps that did not succeed.
    pub async fn run_build_steps(&self, specs: &[CommandSpec], cancel: &CancellationToken) -> usize {
        let mut failures = 0;

        for spec in specs {
            if cancel.is_cancelled() {
                break;
            }
            info!(command = %spec.command, "Running build step");

            match self
                .runner
                .run(&spec.command, Output::Inherit, cancel.clone())
                .await
            {
                Ok(CommandOutcome::Success) => {
                    debug!(command = %spec.command, "Build step succeeded");
                }
                Ok(CommandOutcome::Failed(code)) => {
                    failures += 1;
                    warn!(command = %spec.command, ?code, "Build step failed");
                }
                Ok(CommandOutcome::Cancelled) => {
                    failures += 1;
                    break;
                }
                Err(e) => {
                    failures += 1;
                    error!(command = %spec.command, error = %e, "Error running build step");
                }
            }
        }

        failures
    }

    /// Spawn exec steps in order under `generation`.
    ///
    /// Spawning never waits on readiness checks: each check is polled in its
    /// own task, so siblings start immediately.
    pub fn start_exec_steps(&self, specs: &[CommandSpec], generation: &Generation) -> Readiness {
        let mut steps = Vec::with_capacity(specs.len());

        for spec in specs {
            info!(generation = generation.id(), command = %spec.command, "Executing");

            if let Err(e) = self.runner.spawn(&spec.command, generation.token().clone()) {
                error!(command = %spec.command, error = %e, "Error running command");
                steps.push(StepHandle::Settled(StepState::Failed));
                continue;
            }

            let Some(condition) = spec.condition.clone() else {
                steps.push(StepHandle::Settled(StepState::Ready));
                continue;
            };

            let runner = Arc::clone(&self.runner);
            let token = generation.token().clone();
            let interval = self.poll_interval;
            let command = spec.command.clone();
            steps.push(StepHandle::Polling(tokio::spawn(async move {
                poll_readiness(runner, &command, &condition, token, interval).await
            })));
        }

        Readiness {
            generation: generation.id(),
            steps,
        }
    }
}

/// Re-run `condition` every `interval` until it exits zero or `cancel` fires.
///
/// Polling has no attempt limit: a check that never passes keeps the step
/// polling until its generation is replaced.
async fn poll_readiness(
    runner: Arc<dyn CommandRunner>,
    command: &str,
    condition: &str,
    cancel: CancellationToken,
    interval: Duration,
) -> StepState {
    let mut state = StepState::NotStarted;
    let mut attempts: u32 = 0;

    while !state.is_settled() {
        state = StepState::Polling;
        attempts += 1;

        match runner.run(condition, Output::Discard, cancel.clone()).await {
            Ok(CommandOutcome::Success) => {
                state = StepState::Ready;
                info!(command, attempts, "Ready");
                break;
            }
            Ok(CommandOutcome::Cancelled) => {
                state = StepState::Cancelled;
                break;
            }
            Ok(CommandOutcome::Failed(code)) => {
                debug!(command, condition, ?code, attempts, "Readiness check not passing yet");
            }
            Err(e) => {
                debug!(command, condition, error = %e, attempts, "Readiness check could not run");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => state = StepState::Cancelled,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    if state == StepState::Cancelled {
        debug!(command, attempts, "Readiness polling cancelled");
    }
    state
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`CommandRunner`] for tests

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet, VecDeque};

    #[derive(Default)]
    pub struct FakeRunner {
        spawned: Mutex<Vec<(String, CancellationToken)>>,
        runs: Mutex<Vec<String>>,
        scripts: Mutex<HashMap<String, VecDeque<CommandOutcome>>>,
        always_fail: Mutex<HashSet<String>>,
        unspawnable: Mutex<HashSet<String>>,
    }

    impl FakeRunner {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Outcomes returned by successive runs of `command`; Success afterwards
        pub fn script(&self, command: &str, outcomes: Vec<CommandOutcome>) {
            self.scripts
                .lock()
                .insert(command.to_string(), outcomes.into_iter().collect());
        }

        pub fn fail_forever(&self, command: &str) {
            self.always_fail.lock().insert(command.to_string());
        }

        pub fn refuse_spawn(&self, command: &str) {
            self.unspawnable.lock().insert(command.to_string());
        }

        pub fn runs(&self) -> Vec<String> {
            self.runs.lock().clone()
        }

        pub fn run_count(&self, command: &str) -> usize {
            self.runs.lock().iter().filter(|c| *c == command).count()
        }

        pub fn spawn_count(&self, command: &str) -> usize {
            self.spawned.lock().iter().filter(|(c, _)| c == command).count()
        }

        /// Cancellation tokens handed to each spawn of `command`, oldest first
        pub fn tokens(&self, command: &str) -> Vec<CancellationToken> {
            self.spawned
                .lock()
                .iter()
                .filter(|(c, _)| c == command)
                .map(|(_, t)| t.clone())
                .collect()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(
            &self,
            command: &str,
            _output: Output,
            cancel: CancellationToken,
        ) -> BoxFuture<'static, anyhow::Result<CommandOutcome>> {
            self.runs.lock().push(command.to_string());
            let outcome = if self.always_fail.lock().contains(command) {
                CommandOutcome::Failed(Some(1))
            } else {
                self.scripts
                    .lock()
                    .get_mut(command)
                    .and_then(|q| q.pop_front())
                    .unwrap_or(CommandOutcome::Success)
            };

            Box::pin(async move {
                if cancel.is_cancelled() {
                    return Ok(CommandOutcome::Cancelled);
                }
                Ok(outcome)
            })
        }

        fn spawn(&self, command: &str, cancel: CancellationToken) -> anyhow::Result<()> {
            if self.unspawnable.lock().contains(command) {
                anyhow::bail!("no such command: {}", command);
            }
            self.spawned.lock().push((command.to_string(), cancel));
            Ok(())
        }
    }
}
