use chrono::{DateTime, Local};
use std::fmt;

/// One inbound publish as seen by the receive loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl fmt::Display for LinkMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} - {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.preview()
        )
    }
}

impl LinkMessage {
    pub fn received_now(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::received_at(topic, payload, Local::now())
    }

    pub fn received_at(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        received_at: DateTime<Local>,
    ) -> Self {
        LinkMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }

    /// Payload as text, lossy for non UTF-8 bytes
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    fn preview(&self) -> String {
        let text = self.text();
        match text.char_indices().nth(48) {
            Some((cut, _)) => format!("{}...", &text[..cut]),
            None => text,
        }
    }
}
