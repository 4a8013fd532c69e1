use super::device::DeviceRegistry;
use crate::events::{EventSink, OutboundEvent};
use chrono::Local;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Settings for the offline sweep
#[derive(Clone, Debug)]
pub struct LivenessSettings {
    pub timeout: Duration,
    pub sweep_interval: Duration,
}

/// Background sweep marking silent devices offline
///
/// The sweep is the only source of offline transitions when traffic simply stops. It runs
/// independently of the takt tick loop and stops when its token (a child of the session's
/// token) is cancelled.
pub struct LivenessTracker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LivenessTracker {
    pub fn spawn(
        registry: DeviceRegistry,
        settings: LivenessSettings,
        events: EventSink,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let token = cancel.clone();
        let timeout = chrono::Duration::from_std(settings.timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        info!(
            "Starting liveness sweep every {:?} (timeout {:?})",
            settings.sweep_interval, settings.timeout
        );

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(settings.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        for change in registry.sweep(Local::now(), timeout) {
                            events.emit(OutboundEvent::DeviceStatusChanged {
                                device_id: change.device_id,
                                connected: change.connected,
                            });
                        }
                    }
                }
            }
            debug!("Liveness sweep finished");
        });

        Self { cancel, task }
    }

    pub fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::message::LinkMessage;

    #[tokio::test]
    async fn sweep_task_reports_timed_out_device() {
        let registry = DeviceRegistry::new("takt");
        registry.register("a");
        let stale = Local::now() - chrono::Duration::seconds(5);
        registry.dispatch(&LinkMessage::received_at("takt/device/a/status", "online", stale));

        let (events, mut rx) = EventSink::channel(8);
        let parent = CancellationToken::new();
        let tracker = LivenessTracker::spawn(
            registry.clone(),
            LivenessSettings {
                timeout: Duration::from_secs(1),
                sweep_interval: Duration::from_millis(10),
            },
            events,
            &parent,
        );

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            OutboundEvent::DeviceStatusChanged {
                device_id: "a".into(),
                connected: false
            }
        );
        assert!(!registry.is_device_connected("a"));

        tracker.stop();
    }

    #[tokio::test]
    async fn parent_cancellation_stops_the_sweep() {
        let (events, _rx) = EventSink::channel(8);
        let parent = CancellationToken::new();
        let tracker = LivenessTracker::spawn(
            DeviceRegistry::new("takt"),
            LivenessSettings {
                timeout: Duration::from_secs(60),
                sweep_interval: Duration::from_millis(10),
            },
            events,
            &parent,
        );

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !tracker.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
