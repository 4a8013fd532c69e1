//! Owner of the single takt run
//!
//! The [`Supervisor`] builds a fresh link and [`TaktRun`] per `start`, spawns it, and keeps
//! just enough of a handle to stop, await or resume it. Everything the run reports travels
//! through the shared [`EventSink`]; the supervisor never reaches into the run's state.
//!
//! A stop that lands before the spawned task has begun is not lost: the run's token is
//! already cancelled when the task first looks at it, so the run skips straight to teardown.

use crate::config::AgentConfig;
use crate::events::EventSink;
use crate::link::LinkFactory;
use crate::takt::classifier::Classifier;
use crate::takt::engine::{Preparing, RunSettings, TaktRun};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct RunHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    active: Arc<AtomicBool>,
}

pub struct Supervisor {
    config: AgentConfig,
    events: EventSink,
    link_factory: LinkFactory,
    run: Option<RunHandle>,
}

impl Supervisor {
    pub fn new(config: AgentConfig, events: EventSink, link_factory: LinkFactory) -> Self {
        Self {
            config,
            events,
            link_factory,
            run: None,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Spawns a new run; returns false if one is still active or the cell is incomplete
    pub fn start(&mut self, classifier: Box<dyn Classifier>) -> bool {
        if self.is_running() {
            warn!("A takt run is already active, ignoring start");
            return false;
        }
        if !self.config.cell.is_complete() {
            warn!("Cell number, factory and cell leader must be set before starting");
            return false;
        }

        let link = (self.link_factory)(&self.config, self.events.clone());
        let active = Arc::new(AtomicBool::new(false));
        let run = TaktRun::create(
            RunSettings::from(&self.config),
            link,
            classifier,
            self.events.clone(),
            active.clone(),
        );

        let token = CancellationToken::new();
        let task = tokio::spawn(drive(run, token.clone()));
        info!(
            "Started takt run for cell {} ({})",
            self.config.cell.cell_number, self.config.cell.factory
        );

        self.run = Some(RunHandle {
            token,
            task,
            active,
        });
        true
    }

    /// Requests cooperative cancellation of the current run
    ///
    /// Safe before the run has begun and after it has finished.
    pub fn stop(&self) {
        match &self.run {
            Some(run) if run.token.is_cancelled() => debug!("Stop already requested"),
            Some(run) => {
                info!("Stopping takt run");
                run.token.cancel();
            }
            None => debug!("No takt run to stop"),
        }
    }

    /// Stops the run and waits for its teardown to finish
    pub async fn shutdown(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        run.token.cancel();
        if let Err(e) = run.task.await {
            error!("Takt run task failed: {}", e);
        }
        info!("Takt run shut down");
    }

    /// Resolves once the current run has ended, whether stopped or failed on its own
    ///
    /// Cancel-safe: dropping the future leaves the run in place for a later `shutdown`.
    pub async fn wait(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if let Err(e) = (&mut run.task).await {
            error!("Takt run task failed: {}", e);
        }
        self.run = None;
    }

    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.task.is_finished())
    }

    /// Re-enables analysis after the screen watchdog paused it
    pub fn resume_analysis(&self) -> bool {
        match &self.run {
            Some(run) if !run.task.is_finished() => {
                info!("Resuming takt analysis");
                run.active.store(true, Ordering::SeqCst);
                true
            }
            _ => {
                warn!("No active run to resume");
                false
            }
        }
    }
}

/// Body of the spawned run task; every path ends in exactly one shutdown
async fn drive(run: TaktRun<Preparing>, token: CancellationToken) {
    let closing = if token.is_cancelled() {
        run.abort()
    } else {
        match run.establish().await {
            Ok(linked) => linked.activate().run_until_cancelled(&token).await,
            Err(closing) => closing,
        }
    };

    let closed = closing.shutdown();
    info!(
        "Run for {} closed at takt count {}",
        closed.device_id(),
        closed.takt_count()
    );
}
