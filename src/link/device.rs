//! Device table shared between the receive loop, the liveness sweep and the takt loop
//!
//! Writers: the receive loop ([`DeviceRegistry::dispatch`]) and the sweep
//! ([`DeviceRegistry::sweep`]). Reader: the connectivity gate
//! ([`DeviceRegistry::is_device_connected`]). All access goes through one lock so the gate
//! always sees a whole `Device`, never half of an update.

use super::message::LinkMessage;
use crate::error::HeartbeatError;
use chrono::{DateTime, Duration, Local};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Status token a device publishes while it is alive
pub const ONLINE_TOKEN: &str = "online";

/// Topics derived from a device id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceTopics {
    pub status: String,
    pub heartbeat: String,
    pub command: String,
}

impl DeviceTopics {
    pub fn new(namespace: &str, device_id: &str) -> Self {
        let command = format!("{}/device/{}", namespace, device_id);
        Self {
            status: format!("{}/status", command),
            heartbeat: format!("{}/heartbeat", command),
            command,
        }
    }
}

/// Decoded heartbeat record
///
/// Only `uptime` and `wifi_rssi` are interpreted; they are read defensively so a record
/// missing one of them, or carrying extra fields, still decodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Heartbeat {
    pub uptime_secs: Option<u64>,
    pub wifi_rssi: Option<i64>,
    pub fields: Map<String, Value>,
}

impl Heartbeat {
    pub fn decode(payload: &[u8]) -> Result<Self, HeartbeatError> {
        let fields = match serde_json::from_slice::<Value>(payload)? {
            Value::Object(fields) => fields,
            _ => return Err(HeartbeatError::NotAnObject),
        };

        Ok(Self {
            uptime_secs: fields.get("uptime").and_then(Value::as_u64),
            wifi_rssi: fields.get("wifi_rssi").and_then(Value::as_i64),
            fields,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: String,
    pub connected: bool,
    pub last_seen: Option<DateTime<Local>>,
    pub last_heartbeat: Option<Heartbeat>,
    pub topics: DeviceTopics,
}

impl Device {
    pub fn new(namespace: &str, id: &str) -> Self {
        Self {
            id: id.to_string(),
            connected: false,
            last_seen: None,
            last_heartbeat: None,
            topics: DeviceTopics::new(namespace, id),
        }
    }
}

/// Read-only snapshot of a device for status displays
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub connected: bool,
    pub last_seen: Option<DateTime<Local>>,
    pub last_heartbeat: Option<Heartbeat>,
    pub status_topic: String,
    pub heartbeat_topic: String,
    pub command_topic: String,
}

impl From<&Device> for DeviceInfo {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            connected: device.connected,
            last_seen: device.last_seen,
            last_heartbeat: device.last_heartbeat.clone(),
            status_topic: device.topics.status.clone(),
            heartbeat_topic: device.topics.heartbeat.clone(),
            command_topic: device.topics.command.clone(),
        }
    }
}

/// Connectivity flip of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub device_id: String,
    pub connected: bool,
}

#[derive(Clone, Debug)]
pub struct DeviceRegistry {
    namespace: String,
    devices: Arc<RwLock<BTreeMap<String, Device>>>,
}

impl DeviceRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            devices: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Adds a device to the table; returns false if it was already registered
    pub fn register(&self, device_id: &str) -> bool {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        if devices.contains_key(device_id) {
            warn!("Device {} is already registered", device_id);
            return false;
        }

        let device = Device::new(&self.namespace, device_id);
        info!("Registered device {}", device_id);
        debug!(
            "  status: {}, heartbeat: {}, command: {}",
            device.topics.status, device.topics.heartbeat, device.topics.command
        );
        devices.insert(device_id.to_string(), device);
        true
    }

    pub fn is_registered(&self, device_id: &str) -> bool {
        self.read(|devices| devices.contains_key(device_id))
    }

    /// Per-device connectivity flag; false for unknown ids
    pub fn is_device_connected(&self, device_id: &str) -> bool {
        self.read(|devices| devices.get(device_id).is_some_and(|d| d.connected))
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.read(|devices| devices.get(device_id).cloned())
    }

    pub fn device_info(&self, device_id: &str) -> Option<DeviceInfo> {
        self.read(|devices| devices.get(device_id).map(DeviceInfo::from))
    }

    pub fn command_topic(&self, device_id: &str) -> Option<String> {
        self.read(|devices| devices.get(device_id).map(|d| d.topics.command.clone()))
    }

    /// Status and heartbeat topics of every registered device
    pub fn subscription_topics(&self) -> Vec<String> {
        self.read(|devices| {
            devices
                .values()
                .flat_map(|d| [d.topics.status.clone(), d.topics.heartbeat.clone()])
                .collect()
        })
    }

    /// Applies an inbound message to the device owning its topic
    ///
    /// Returns the resulting connectivity flip, if any. Messages on unknown topics and
    /// malformed heartbeats leave the table untouched.
    pub fn dispatch(&self, message: &LinkMessage) -> Option<StatusChange> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let device = devices.values_mut().find(|d| {
            d.topics.status == message.topic || d.topics.heartbeat == message.topic
        })?;

        let was_connected = device.connected;
        if device.topics.status == message.topic {
            let token = message.text();
            device.connected = token == ONLINE_TOKEN;
            device.last_seen = Some(message.received_at);
            if device.connected {
                info!("{} status: {}", device.id, token);
            } else {
                warn!("{} status: {}", device.id, token);
            }
        } else {
            let heartbeat = match Heartbeat::decode(&message.payload) {
                Ok(heartbeat) => heartbeat,
                Err(e) => {
                    warn!("Dropping heartbeat from {}: {}", device.id, e);
                    return None;
                }
            };
            debug!(
                "Heartbeat from {}: uptime={:?}s rssi={:?}dBm",
                device.id, heartbeat.uptime_secs, heartbeat.wifi_rssi
            );
            device.last_heartbeat = Some(heartbeat);
            device.last_seen = Some(message.received_at);
            device.connected = true;
        }

        (was_connected != device.connected).then(|| StatusChange {
            device_id: device.id.clone(),
            connected: device.connected,
        })
    }

    /// Flips connected devices silent for longer than `timeout` to offline
    ///
    /// Devices that were never seen are left alone.
    pub fn sweep(&self, now: DateTime<Local>, timeout: Duration) -> Vec<StatusChange> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let mut changes = Vec::new();

        for device in devices.values_mut() {
            let Some(last_seen) = device.last_seen else {
                continue;
            };
            if device.connected && now - last_seen > timeout {
                device.connected = false;
                warn!(
                    "{} silent for {}s, marking offline",
                    device.id,
                    (now - last_seen).num_seconds()
                );
                changes.push(StatusChange {
                    device_id: device.id.clone(),
                    connected: false,
                });
            }
        }
        changes
    }

    fn read<T>(&self, f: impl FnOnce(&BTreeMap<String, Device>) -> T) -> T {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        f(&devices)
    }
}
