//! Takt cycle state machine
//!
//! Pure decision logic for one tick: screen state, debounce, connectivity gate, the 1..3 step
//! counter and the notice cooldowns. It performs no I/O; the run engine turns each
//! [`Verdict`] into events and publishes.
//!
//! ```text
//!            ScreenOpen / CycleComplete
//! ScreenClosed ─────────────────────────► ScreenOpen
//!      ▲                                      │
//!      └──────── no label for screen_timeout ─┘
//! ```
//!
//! The counter is carried alongside either state:
//!
//! ```text
//! 0 ──accept──► 1 ──accept──► 2 ──accept──► 3 ──(after publish)──► 0
//! ```

use super::classifier::Label;
use crate::config::TimingConfig;
use chrono::{DateTime, Duration, Local};
use tracing::{debug, info};

/// Steps in one takt sequence
pub const TAKT_STEPS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenState {
    ScreenClosed,
    ScreenOpen,
}

/// Window lengths driving the cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSettings {
    pub debounce: Duration,
    pub screen_notice_cooldown: Duration,
    pub offline_notice_cooldown: Duration,
    pub screen_timeout: Duration,
}

impl From<&TimingConfig> for CycleSettings {
    fn from(timing: &TimingConfig) -> Self {
        let millis = |ms: u64| Duration::milliseconds(ms as i64);
        Self {
            debounce: millis(timing.debounce_ms),
            screen_notice_cooldown: millis(timing.screen_notice_cooldown_ms),
            offline_notice_cooldown: millis(timing.offline_notice_cooldown_ms),
            screen_timeout: millis(timing.screen_timeout_ms),
        }
    }
}

/// Outcome of feeding one label into the cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No label this tick
    Idle,
    /// Takt screen seen and the notice cooldown has passed
    ScreenNotice,
    /// Takt screen seen within the notice cooldown
    ScreenSuppressed,
    /// Completion inside the debounce window of the last accepted one
    Debounced,
    /// Completion while the target device is offline; `notify` is false inside the cooldown
    DeviceOffline { notify: bool },
    /// Completion accepted, the counter now holds `takt`
    Accepted { takt: u8 },
}

#[derive(Debug, Clone)]
pub struct TaktCycle {
    settings: CycleSettings,
    screen: ScreenState,
    counter: u8,
    last_accepted: Option<DateTime<Local>>,
    last_screen_notice: Option<DateTime<Local>>,
    last_offline_notice: Option<DateTime<Local>>,
    last_label: Option<DateTime<Local>>,
}

impl TaktCycle {
    pub fn new(settings: CycleSettings) -> Self {
        Self {
            settings,
            screen: ScreenState::ScreenClosed,
            counter: 0,
            last_accepted: None,
            last_screen_notice: None,
            last_offline_notice: None,
            last_label: None,
        }
    }

    pub fn counter(&self) -> u8 {
        self.counter
    }

    pub fn screen(&self) -> ScreenState {
        self.screen
    }

    pub fn last_accepted(&self) -> Option<DateTime<Local>> {
        self.last_accepted
    }

    /// Feeds one classifier label
    ///
    /// `device_connected` is only consulted for completions that pass the debounce.
    pub fn observe(
        &mut self,
        label: Label,
        now: DateTime<Local>,
        device_connected: impl FnOnce() -> bool,
    ) -> Verdict {
        if label == Label::None {
            return Verdict::Idle;
        }

        self.last_label = Some(now);
        if self.screen == ScreenState::ScreenClosed {
            info!("Takt screen open");
            self.screen = ScreenState::ScreenOpen;
        }

        match label {
            Label::None => Verdict::Idle,
            Label::ScreenOpen => {
                if elapsed_beyond(self.last_screen_notice, now, self.settings.screen_notice_cooldown) {
                    self.last_screen_notice = Some(now);
                    Verdict::ScreenNotice
                } else {
                    Verdict::ScreenSuppressed
                }
            }
            Label::CycleComplete => self.complete(now, device_connected),
        }
    }

    fn complete(&mut self, now: DateTime<Local>, device_connected: impl FnOnce() -> bool) -> Verdict {
        if let Some(last) = self.last_accepted {
            if now - last < self.settings.debounce {
                debug!(
                    "Completion {}ms after the last one, debounced",
                    (now - last).num_milliseconds()
                );
                return Verdict::Debounced;
            }
        }

        if !device_connected() {
            let notify =
                elapsed_beyond(self.last_offline_notice, now, self.settings.offline_notice_cooldown);
            if notify {
                self.last_offline_notice = Some(now);
            }
            return Verdict::DeviceOffline { notify };
        }

        self.counter = (self.counter + 1).min(TAKT_STEPS);
        self.last_accepted = Some(now);
        info!("Takt step {} of {} accepted", self.counter, TAKT_STEPS);
        Verdict::Accepted { takt: self.counter }
    }

    /// Closes the sequence once the last step has been published (or attempted)
    pub fn settle(&mut self) {
        if self.counter >= TAKT_STEPS {
            debug!("Takt sequence complete, resetting counter");
            self.counter = 0;
        }
    }

    /// Screen watchdog; returns true when the screen just transitioned to closed
    ///
    /// The counter is left untouched.
    pub fn check_screen(&mut self, now: DateTime<Local>) -> bool {
        if self.screen != ScreenState::ScreenOpen {
            return false;
        }
        match self.last_label {
            Some(last) if now - last > self.settings.screen_timeout => {
                info!(
                    "No takt screen for {}ms, closing",
                    (now - last).num_milliseconds()
                );
                self.screen = ScreenState::ScreenClosed;
                true
            }
            _ => false,
        }
    }
}

/// True when `last` is unset or more than `window` ago
fn elapsed_beyond(last: Option<DateTime<Local>>, now: DateTime<Local>, window: Duration) -> bool {
    last.map_or(true, |last| now - last > window)
}
