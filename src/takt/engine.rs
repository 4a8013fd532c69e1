//! Takt run with statum state machine for its lifecycle
//!
//! One [`TaktRun`] owns everything a single monitoring run needs: the broker link, the
//! classifier, the publisher and the cycle state. Its lifecycle is checked at compile time.
//!
//! # State Machine
//!
//! ```text
//! Preparing ──establish──► Linked ──activate──► Monitoring ──cancelled──► Closing ──shutdown──► Closed
//!     │                       ▲                                              ▲
//!     ├── connect / model failure ───────────────────────────────────────────┤
//!     └── abort (stop before start) ─────────────────────────────────────────┘
//! ```
//!
//! `Closing::shutdown` is the only place the link is disconnected, so every path through the
//! machine tears the session down exactly once.

use super::classifier::Classifier;
use super::cycle::{CycleSettings, TaktCycle, Verdict};
use crate::config::AgentConfig;
use crate::error::{ClassifierError, LinkError, RunError};
use crate::events::{EventSink, OutboundEvent};
use crate::link::Link;
use crate::publisher::{Command, CommandPublisher};
use chrono::{DateTime, Local};
use statum::{machine, state};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-run constants taken from the agent configuration
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub device_id: String,
    pub tick: Duration,
    pub error_backoff: Duration,
    pub connect_timeout: Duration,
    pub cycle: CycleSettings,
}

impl From<&AgentConfig> for RunSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            device_id: config.device.id.clone(),
            tick: Duration::from_millis(config.timing.tick_ms),
            error_backoff: Duration::from_millis(config.timing.error_backoff_ms),
            connect_timeout: config.broker.connect_timeout(),
            cycle: CycleSettings::from(&config.timing),
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum RunState {
    Preparing,  // Nothing connected yet
    Linked,     // Broker acknowledged, classifier ready
    Monitoring, // Tick loop running
    Closing,    // Loop left, link still up
    Closed,     // Link torn down
}

#[machine]
pub struct TaktRun<S: RunState> {
    settings: RunSettings,
    link: Box<dyn Link>,
    classifier: Box<dyn Classifier>,
    publisher: CommandPublisher,
    cycle: TaktCycle,
    events: EventSink,
    active: Arc<AtomicBool>,
}

impl<S: RunState> TaktRun<S> {
    pub fn takt_count(&self) -> u8 {
        self.cycle.counter()
    }

    pub fn device_id(&self) -> &str {
        &self.settings.device_id
    }

    pub fn link(&self) -> &dyn Link {
        self.link.as_ref()
    }
}

impl TaktRun<Preparing> {
    pub fn create(
        settings: RunSettings,
        link: Box<dyn Link>,
        classifier: Box<dyn Classifier>,
        events: EventSink,
        active: Arc<AtomicBool>,
    ) -> Self {
        info!("Preparing takt run for device {}", settings.device_id);
        let cycle = TaktCycle::new(settings.cycle);

        Self::new(
            settings,
            link,
            classifier,
            CommandPublisher,
            cycle,
            events,
            active,
        )
    }

    /// Connects the link and readies the classifier
    ///
    /// Either failure is fatal to the run: it is reported and the machine goes straight to
    /// `Closing` so the caller still tears the link down.
    pub async fn establish(mut self) -> Result<TaktRun<Linked>, TaktRun<Closing>> {
        let broker = self.link.broker();
        match self.link.connect(self.settings.connect_timeout).await {
            Ok(()) => {
                self.events.emit(OutboundEvent::Connected { broker });
            }
            Err(LinkError::Connect { failure, detail }) => {
                error!("Could not connect to {}: {} ({})", broker, failure, detail);
                self.events.emit(OutboundEvent::ConnectionError {
                    reason: failure,
                    detail,
                });
                return Err(self.transition());
            }
            Err(e) => {
                error!("Could not connect to {}: {}", broker, e);
                self.events.emit(OutboundEvent::ConnectionError {
                    reason: crate::error::ConnectFailure::Unreachable,
                    detail: e.to_string(),
                });
                return Err(self.transition());
            }
        }

        match self.classifier.prepare() {
            Ok(()) => {
                self.events.emit(OutboundEvent::ModelLoaded {
                    source: self.classifier.name(),
                });
            }
            Err(e) => {
                error!("Classifier {} not ready: {}", self.classifier.name(), e);
                self.events.emit(OutboundEvent::ModelMissing {
                    detail: e.to_string(),
                });
                return Err(self.transition());
            }
        }

        Ok(self.transition())
    }

    /// Skips straight to teardown when a stop arrived before the run began
    pub fn abort(self) -> TaktRun<Closing> {
        info!("Run for {} stopped before it started", self.settings.device_id);
        self.transition()
    }
}

impl TaktRun<Linked> {
    pub fn activate(self) -> TaktRun<Monitoring> {
        info!("Monitoring takt screen for device {}", self.settings.device_id);
        self.active.store(true, Ordering::SeqCst);
        self.transition()
    }
}

impl TaktRun<Monitoring> {
    /// Runs one tick: poll, decide, publish, watchdog
    ///
    /// Does nothing while the run is inactive (screen closed and not yet resumed).
    pub fn tick(&mut self, now: DateTime<Local>) -> Result<(), RunError> {
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        let label = self.classifier.poll()?;
        let link = &self.link;
        let device_id = &self.settings.device_id;
        let verdict = self.cycle.observe(label, now, || {
            link.registry().is_device_connected(device_id)
        });

        match verdict {
            Verdict::Idle | Verdict::ScreenSuppressed => {}
            Verdict::Debounced => debug!("Duplicate completion ignored"),
            Verdict::ScreenNotice => {
                self.events.emit(OutboundEvent::TaktScreenDetected { at: now });
            }
            Verdict::DeviceOffline { notify } => {
                if notify {
                    warn!("{} offline, completion not relayed", self.settings.device_id);
                    self.events.emit(OutboundEvent::DeviceDisconnected {
                        device_id: self.settings.device_id.clone(),
                    });
                } else {
                    debug!("{} still offline", self.settings.device_id);
                }
            }
            Verdict::Accepted { takt } => {
                self.events.emit(OutboundEvent::TaktDetected { takt, at: now });
                self.send_takt(takt, now);
                self.cycle.settle();
            }
        }

        if self.cycle.check_screen(now) {
            self.active.store(false, Ordering::SeqCst);
            self.events.emit(OutboundEvent::TaktScreenClosed {
                takt: self.cycle.counter(),
            });
        }
        Ok(())
    }

    fn send_takt(&mut self, takt: u8, now: DateTime<Local>) {
        let device_id = self.settings.device_id.clone();
        let command = Command::takt(&device_id, takt, now);

        match self
            .publisher
            .publish_command(self.link.as_ref(), &device_id, &command)
        {
            Ok(()) => self.events.emit(OutboundEvent::MessageSent {
                device_id,
                takt_count: takt,
            }),
            Err(e) => self.events.emit(OutboundEvent::MessageError {
                device_id,
                takt_count: takt,
                detail: e.to_string(),
            }),
        }
    }

    /// Tick loop with cooperative cancellation
    ///
    /// Cancellation is only observed between ticks; a tick that has started always finishes.
    /// Failed ticks are reported and followed by a backoff instead of the normal period.
    pub async fn run_until_cancelled(mut self, token: &CancellationToken) -> TaktRun<Closing> {
        info!("Starting takt loop for {}", self.settings.device_id);
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    info!("Stop requested for {}", self.settings.device_id);
                    break;
                }

                _ = tokio::time::sleep(delay) => {
                    delay = match self.tick(Local::now()) {
                        Ok(()) => self.settings.tick,
                        Err(RunError::Classifier(ClassifierError::ModelMissing(detail))) => {
                            error!("Classifier lost its model: {}", detail);
                            self.events.emit(OutboundEvent::ModelMissing { detail });
                            break;
                        }
                        Err(e) => {
                            error!("Tick failed: {}", e);
                            self.events.emit(OutboundEvent::RuntimeError {
                                detail: e.to_string(),
                            });
                            self.settings.error_backoff
                        }
                    };
                }
            }
        }

        info!("Takt loop for {} finished", self.settings.device_id);
        self.transition()
    }
}

impl TaktRun<Closing> {
    /// Disconnects the link and transitions to Closed
    pub fn shutdown(mut self) -> TaktRun<Closed> {
        info!("Closing run for {}", self.settings.device_id);
        self.link.disconnect();
        self.active.store(false, Ordering::SeqCst);
        self.transition()
    }
}

impl TaktRun<Closed> {}
