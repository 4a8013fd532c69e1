//! Takt relay agent
//!
//! Watches a production line's takt screen through a pluggable classifier, counts completed
//! takt steps and relays each one as a command to a remote device over MQTT, while tracking
//! whether that device is alive.
//!
//! ```text
//! ┌────────────┐  label  ┌──────────┐ command ┌─────────────┐
//! │ Classifier │ ──────► │ TaktRun  │ ──────► │ LinkSession │ ◄──► broker
//! └────────────┘         └──────────┘         └─────────────┘
//!                             │  ▲                   │
//!                      events │  │ connected?        │ status / heartbeat
//!                             ▼  │                   ▼
//!                        EventSink ◄──────── DeviceRegistry + liveness sweep
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod link;
pub mod publisher;
pub mod supervisor;
pub mod takt;

#[cfg(test)]
mod testing;
