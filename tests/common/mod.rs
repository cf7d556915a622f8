// Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use millstream::communication::{EventSender, Frame, Transport, TransportError, TransportEvent};

/// Transport fake: records every frame, never answers on its own. Tests push
/// controller lines through [`ScriptedTransport::inbound`].
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    pub sent: Arc<Mutex<Vec<Frame>>>,
    events: Arc<Mutex<Option<EventSender>>>,
    /// Every line send fails once this is set.
    pub fail_sends: Arc<Mutex<bool>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn inbound(&self, line: &str) {
        let events = self.events.lock().unwrap().clone().expect("transport not connected");
        events.send(TransportEvent::Line(line.to_string())).await.unwrap();
    }

    pub fn lines(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|f| match f {
                Frame::Line(l) => Some(l.clone()),
                Frame::Realtime(_) => None,
            })
            .collect()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self, events: EventSender) -> Result<(), TransportError> {
        events.send(TransportEvent::Connected).await.unwrap();
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if matches!(frame, Frame::Line(_)) && *self.fail_sends.lock().unwrap() {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let events = self.events.lock().unwrap().take();
        if let Some(events) = events {
            let reason = "closed by test".to_string();
            let _ = events.send(TransportEvent::Disconnected { reason }).await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
