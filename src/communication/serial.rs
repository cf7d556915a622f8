//! Local serial adapter over serial2-tokio.
//!
//! A lost serial link is reported once and left down: reconnecting is an
//! operator decision.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serial2_tokio::SerialPort;
use tokio::task::JoinHandle;

use super::{EventSender, Frame, LineCodec, Transport, TransportError, TransportEvent};

pub struct SerialTransport {
    device: String,
    baud: u32,
    coalesce_status_ok: bool,
    port: Option<Arc<SerialPort>>,
    connected: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    events: Option<EventSender>,
}

impl SerialTransport {
    pub fn new(device: String, baud: u32, coalesce_status_ok: bool) -> Self {
        Self {
            device,
            baud,
            coalesce_status_ok,
            port: None,
            connected: Arc::new(AtomicBool::new(false)),
            reader: None,
            events: None,
        }
    }
}

async fn read_loop(port: Arc<SerialPort>, events: EventSender, connected: Arc<AtomicBool>, coalesce: bool) {
    let mut codec = LineCodec::new(coalesce);
    let mut buf = [0u8; 256];
    let reason = loop {
        match port.read(&mut buf).await {
            Ok(0) => break "serial port closed".to_string(),
            Ok(n) => {
                for line in codec.feed(&buf[..n]) {
                    tracing::trace!("RX {}", line);
                    if events.send(TransportEvent::Line(line)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => break format!("serial read error: {e}"),
        }
    };
    connected.store(false, Ordering::SeqCst);
    tracing::warn!("Serial link lost: {}", reason);
    let _ = events.send(TransportEvent::Disconnected { reason }).await;
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&mut self, events: EventSender) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let port = Arc::new(SerialPort::open(&self.device, self.baud)?);
        tracing::info!("Opened serial port {} @ {} baud", self.device, self.baud);
        self.connected.store(true, Ordering::SeqCst);
        self.reader = Some(tokio::spawn(read_loop(
            port.clone(),
            events.clone(),
            self.connected.clone(),
            self.coalesce_status_ok,
        )));
        self.port = Some(port);
        let _ = events.send(TransportEvent::Connected).await;
        self.events = Some(events);
        Ok(())
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let port = self.port.as_ref().filter(|_| self.is_connected()).ok_or(TransportError::NotConnected)?;
        if let Frame::Line(line) = &frame {
            tracing::trace!("TX {}", line);
        }
        port.write_all(&frame.to_bytes()).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.port = None;
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if let Some(events) = self.events.take() {
            if was_connected {
                let reason = "closed by host".to_string();
                let _ = events.send(TransportEvent::Disconnected { reason }).await;
            }
        }
        tracing::info!("Closed serial port {}", self.device);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        format!("serial {} @ {}", self.device, self.baud)
    }
}
