//! The change → restart → reload loop
//!
//! ```text
//! Idle -> Building -> Starting -> Ready
//!                        ^          |
//!                        |    change detected
//!                        +-- Cancelling
//! ```
//!
//! Every change replaces the current [`Generation`]: the old one is cancelled
//! (terminating its processes and readiness polling) before the exec steps are
//! started again. Browsers are told to reload only once the newest generation
//! is ready, so a burst of changes yields a single reload.

use crate::error::Result;
use crate::process::{CommandSpec, Generation, GenerationHolder, ProcessOrchestrator, ReadyOutcome};
use crate::reload::{announce_reload, ConnectionRegistry};
use crate::watcher::ChangeEvent;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Observable phase of the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Building,
    Starting,
    Ready,
    Cancelling,
    Stopped,
}

/// Readiness of the generation the loop is currently waiting on
struct PendingReady {
    generation: u64,
    announce: bool,
    outcome: BoxFuture<'static, ReadyOutcome>,
}

async fn next_ready(pending: &mut Option<PendingReady>) -> (u64, bool, ReadyOutcome) {
    match pending {
        Some(p) => {
            let outcome = (&mut p.outcome).await;
            (p.generation, p.announce, outcome)
        }
        None => std::future::pending().await,
    }
}

/// Drives build steps, exec generations and reload broadcasts.
pub struct ReloadLoop {
    processes: ProcessOrchestrator,
    registry: Arc<ConnectionRegistry>,
    build: Vec<CommandSpec>,
    exec: Vec<CommandSpec>,
    state: watch::Sender<LoopState>,
}

impl ReloadLoop {
    pub fn new(
        processes: ProcessOrchestrator,
        registry: Arc<ConnectionRegistry>,
        build: Vec<CommandSpec>,
        exec: Vec<CommandSpec>,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            processes,
            registry,
            build,
            exec,
            state,
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LoopState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Loop state");
        }
    }

    /// Run until `changes` ends, yields an error, or `shutdown` fires.
    ///
    /// Build steps run once up front. A watcher error is returned after the
    /// current generation has been cancelled.
    pub async fn run<S>(&self, mut changes: S, shutdown: CancellationToken) -> Result<()>
    where
        S: Stream<Item = Result<ChangeEvent>> + Unpin,
    {
        self.set_state(LoopState::Building);
        self.processes.run_build_steps(&self.build, &shutdown).await;

        let mut generations = GenerationHolder::new(shutdown.clone());
        let mut pending = if shutdown.is_cancelled() {
            None
        } else {
            Some(self.start_generation(&mut generations, false))
        };

        let result = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break Ok(()),

                change = changes.next() => match change {
                    Some(Ok(event)) => {
                        info!(path = %event.path.display(), "Detected change");
                        self.set_state(LoopState::Cancelling);
                        pending = Some(self.start_generation(&mut generations, true));
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "File watcher failed");
                        break Err(e);
                    }
                    None => {
                        debug!("Change stream ended");
                        break Ok(());
                    }
                },

                (generation, announce, outcome) = next_ready(&mut pending) => {
                    pending = None;
                    match outcome {
                        ReadyOutcome::Ready => {
                            self.set_state(LoopState::Ready);
                            if announce {
                                let signalled = announce_reload(&self.registry);
                                info!(generation, signalled, "Done");
                            } else {
                                info!(generation, "Ready");
                            }
                        }
                        ReadyOutcome::Cancelled => {
                            debug!(generation, "Generation cancelled before it was ready");
                        }
                    }
                }
            }
        };

        generations.cancel_current();
        self.set_state(LoopState::Stopped);
        result
    }

    fn start_generation(&self, generations: &mut GenerationHolder, announce: bool) -> PendingReady {
        let generation: Generation = generations.advance();
        self.set_state(LoopState::Starting);

        let readiness = self.processes.start_exec_steps(&self.exec, &generation);
        PendingReady {
            generation: generation.id(),
            announce,
            outcome: Box::pin(readiness.wait()),
        }
    }
}
