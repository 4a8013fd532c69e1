//! Command publishing towards a registered device

use crate::error::PublishError;
use crate::link::Link;
use chrono::{DateTime, Local};
use rumqttc::QoS;
use serde::{Serialize, Serializer};
use tracing::{error, info, warn};

/// Commands are delivered at least once
pub const COMMAND_QOS: QoS = QoS::AtLeastOnce;

/// Event label carried by takt completion commands
pub const TAKT_EVENT: &str = "takt_detected";

const WIRE_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

fn wire_timestamp<S: Serializer>(at: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&at.format(WIRE_TIMESTAMP).to_string())
}

/// Wire record sent on a device's command topic
///
/// Serializes as `{event, message, id, timestamp, takt_count}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub event: String,
    pub message: String,
    #[serde(rename = "id")]
    pub device_id: String,
    #[serde(serialize_with = "wire_timestamp")]
    pub timestamp: DateTime<Local>,
    pub takt_count: u8,
    #[serde(skip)]
    pub qos: QoS,
}

impl Command {
    pub fn takt(device_id: &str, takt_count: u8, timestamp: DateTime<Local>) -> Self {
        Self {
            event: TAKT_EVENT.to_string(),
            message: format!("Takt step {} completed", takt_count),
            device_id: device_id.to_string(),
            timestamp,
            takt_count,
            qos: COMMAND_QOS,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Formats commands and hands them to the link
///
/// Fails fast when the session is down or the device unknown. A registered but offline
/// device is still published to; deciding whether to try at all belongs to the takt loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandPublisher;

impl CommandPublisher {
    pub fn publish_command(
        &self,
        link: &dyn Link,
        device_id: &str,
        command: &Command,
    ) -> Result<(), PublishError> {
        if !link.is_connected() {
            error!("Not connected to broker, dropping command for {}", device_id);
            return Err(PublishError::SessionDown);
        }

        let Some(topic) = link.registry().command_topic(device_id) else {
            error!("Device {} not registered", device_id);
            return Err(PublishError::UnknownDevice(device_id.to_string()));
        };

        if !link.registry().is_device_connected(device_id) {
            warn!("{} is offline, publishing anyway", device_id);
        }

        let payload = command.encode()?;
        match link.publish(&topic, payload, command.qos) {
            Ok(()) => {
                info!(
                    "Command sent to {}: {} (takt {})",
                    device_id, command.event, command.takt_count
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to send command to {}: {}", device_id, e);
                Err(PublishError::Rejected(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLink;
    use chrono::TimeZone;
    use serde_json::Value;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
    }

    #[test]
    fn command_wire_shape() {
        let command = Command::takt("cost-2-2408", 2, fixed_time());
        let json: Value = serde_json::from_slice(&command.encode().unwrap()).unwrap();

        assert_eq!(json["event"], TAKT_EVENT);
        assert_eq!(json["id"], "cost-2-2408");
        assert_eq!(json["timestamp"], "2025-03-14 09:26:53");
        assert_eq!(json["takt_count"], 2);
        assert!(json["message"].as_str().unwrap().contains('2'));
        assert!(json.get("qos").is_none());
        assert_eq!(command.qos, QoS::AtLeastOnce);
    }

    #[test]
    fn publishes_to_command_topic() {
        let link = MockLink::connected("a");
        link.set_device_online("a");

        let command = Command::takt("a", 1, fixed_time());
        CommandPublisher.publish_command(&link, "a", &command).unwrap();

        let published = link.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "takt/device/a");
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
    }

    #[test]
    fn fails_fast_when_session_down() {
        let link = MockLink::disconnected("a");
        let result = CommandPublisher.publish_command(&link, "a", &Command::takt("a", 1, fixed_time()));
        assert!(matches!(result, Err(PublishError::SessionDown)));
        assert!(link.published().is_empty());
    }

    #[test]
    fn fails_fast_for_unknown_device() {
        let link = MockLink::connected("a");
        let result = CommandPublisher.publish_command(&link, "b", &Command::takt("b", 1, fixed_time()));
        assert!(matches!(result, Err(PublishError::UnknownDevice(id)) if id == "b"));
        assert!(link.published().is_empty());
    }

    #[test]
    fn offline_device_is_still_attempted() {
        let link = MockLink::connected("a");
        CommandPublisher
            .publish_command(&link, "a", &Command::takt("a", 1, fixed_time()))
            .unwrap();
        assert_eq!(link.published().len(), 1);
    }

    #[test]
    fn broker_rejection_is_reported() {
        let link = MockLink::connected("a");
        link.reject_publishes();
        let result = CommandPublisher.publish_command(&link, "a", &Command::takt("a", 1, fixed_time()));
        assert!(matches!(result, Err(PublishError::Rejected(_))));
    }
}
