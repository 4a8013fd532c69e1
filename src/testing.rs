//! Test doubles shared by the unit tests

use crate::error::{ClassifierError, ConnectFailure, LinkError};
use crate::events::OutboundEvent;
use crate::link::message::LinkMessage;
use crate::link::{DeviceRegistry, Link};
use crate::takt::classifier::{Classifier, Label};
use async_trait::async_trait;
use rumqttc::QoS;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

#[derive(Default)]
struct MockState {
    connected: bool,
    connect_failure: Option<ConnectFailure>,
    reject_publishes: bool,
    published: Vec<Published>,
    connect_calls: usize,
    disconnect_calls: usize,
}

/// In-memory link; clones share state so a test can inspect what a run did with its copy
#[derive(Clone)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
    registry: DeviceRegistry,
}

impl MockLink {
    /// Disconnected link whose connect succeeds
    pub fn new(device_id: &str) -> Self {
        let registry = DeviceRegistry::new("takt");
        registry.register(device_id);
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            registry,
        }
    }

    pub fn connected(device_id: &str) -> Self {
        let link = Self::new(device_id);
        link.state.lock().unwrap().connected = true;
        link
    }

    pub fn disconnected(device_id: &str) -> Self {
        Self::new(device_id)
    }

    pub fn failing(device_id: &str, failure: ConnectFailure) -> Self {
        let link = Self::new(device_id);
        link.state.lock().unwrap().connect_failure = Some(failure);
        link
    }

    pub fn set_device_online(&self, device_id: &str) {
        self.send_status(device_id, "online");
    }

    pub fn set_device_offline(&self, device_id: &str) {
        self.send_status(device_id, "offline");
    }

    fn send_status(&self, device_id: &str, token: &str) {
        let topic = format!("takt/device/{}/status", device_id);
        self.registry
            .dispatch(&LinkMessage::received_now(topic, token.as_bytes().to_vec()));
    }

    pub fn reject_publishes(&self) {
        self.state.lock().unwrap().reject_publishes = true;
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().unwrap().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().unwrap().disconnect_calls
    }
}

#[async_trait]
impl Link for MockLink {
    async fn connect(&mut self, _timeout: Duration) -> Result<(), LinkError> {
        let mut state = self.state.lock().unwrap();
        state.connect_calls += 1;
        match state.connect_failure {
            Some(failure) => Err(LinkError::connect(failure, "mock refused")),
            None => {
                state.connected = true;
                Ok(())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), LinkError> {
        let mut state = self.state.lock().unwrap();
        if state.reject_publishes {
            return Err(LinkError::Client("mock rejected publish".into()));
        }
        state.published.push(Published {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.disconnect_calls += 1;
        state.connected = false;
    }

    fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    fn broker(&self) -> String {
        "mock:1883".to_string()
    }
}

/// Classifier replaying a fixed script, then reporting no label
pub struct ScriptedClassifier {
    steps: VecDeque<Result<Label, ClassifierError>>,
    delay: Option<Duration>,
    model_missing: bool,
    polls: Arc<AtomicUsize>,
}

impl ScriptedClassifier {
    pub fn new(labels: Vec<Label>) -> Self {
        Self::with_steps(labels.into_iter().map(Ok).collect())
    }

    pub fn with_steps(steps: Vec<Result<Label, ClassifierError>>) -> Self {
        Self {
            steps: steps.into(),
            delay: None,
            model_missing: false,
            polls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn missing_model() -> Self {
        let mut classifier = Self::new(vec![]);
        classifier.model_missing = true;
        classifier
    }

    /// Makes every poll block the calling thread for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn polls(&self) -> Arc<AtomicUsize> {
        self.polls.clone()
    }
}

impl Classifier for ScriptedClassifier {
    fn prepare(&mut self) -> Result<(), ClassifierError> {
        if self.model_missing {
            return Err(ClassifierError::ModelMissing("scripted".into()));
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<Label, ClassifierError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.steps.pop_front().unwrap_or(Ok(Label::None))
    }

    fn name(&self) -> String {
        "scripted".to_string()
    }
}

/// Collects every event currently queued
pub fn drain(rx: &mut mpsc::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
