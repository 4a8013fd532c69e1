//! # Broker link
//!
//! Everything between the relay and the message broker: the session, the table of remote
//! devices it tracks, and the sweep that decides when a silent device is offline.
//!
//! ```text
//! link/
//! ├── message.rs   - inbound message representation
//! ├── device.rs    - device table, topics, heartbeat decoding
//! ├── liveness.rs  - background offline sweep
//! └── session.rs   - rumqttc session, Link seam, connect taxonomy
//! ```
//!
//! ## Threads of control
//!
//! A connected [`session::LinkSession`] owns two background tasks: the receive loop driving
//! the `rumqttc` event loop, and the [`liveness::LivenessTracker`] sweep. Both write into the
//! shared [`device::DeviceRegistry`]; the takt loop only reads from it.
//!
//! ## Topic layout
//!
//! | topic | direction |
//! |---|---|
//! | `<namespace>/device/<id>/status` | subscribed, bare liveness token |
//! | `<namespace>/device/<id>/heartbeat` | subscribed, JSON record |
//! | `<namespace>/device/<id>` | published, JSON command |

pub mod device;
pub mod liveness;
pub mod message;
pub mod session;

pub use device::{Device, DeviceInfo, DeviceRegistry, Heartbeat, StatusChange};
pub use session::{Link, LinkFactory, LinkSession, SessionSettings};
