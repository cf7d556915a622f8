//! Network socket adapter (telnet-style bridges, WiFi controllers).
//!
//! A close the host did not ask for is treated as abnormal: the reader task
//! retries with exponential backoff until it reconnects or runs out of attempts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{EventSender, Frame, LineCodec, Transport, TransportError, TransportEvent};
use crate::config::ReconnectConfig;

type SharedWriter = Arc<Mutex<Option<OwnedWriteHalf>>>;

/// Delay before reconnect `attempt` (1-based): `base * 2^(attempt-1)` capped at
/// `max_delay`, scaled into `[0.5, 1.0)` of that when jitter is on.
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = config.base_delay_ms.saturating_mul(1u64 << exponent).min(config.max_delay_ms);
    let delay = if config.jitter {
        let factor = 0.5 + 0.5 * rand::random::<f64>();
        (delay as f64 * factor) as u64
    } else {
        delay
    };
    Duration::from_millis(delay)
}

pub struct SocketTransport {
    host: String,
    port: u16,
    reconnect: ReconnectConfig,
    coalesce_status_ok: bool,
    writer: SharedWriter,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    events: Option<EventSender>,
}

impl SocketTransport {
    pub fn new(host: String, port: u16, reconnect: ReconnectConfig, coalesce_status_ok: bool) -> Self {
        Self {
            host,
            port,
            reconnect,
            coalesce_status_ok,
            writer: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            reader: None,
            events: None,
        }
    }
}

struct ReadLoop {
    address: (String, u16),
    reconnect: ReconnectConfig,
    coalesce: bool,
    writer: SharedWriter,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    events: EventSender,
}

impl ReadLoop {
    async fn run(self, mut read_half: OwnedReadHalf) {
        loop {
            let reason = self.read_until_closed(&mut read_half).await;
            self.connected.store(false, Ordering::SeqCst);
            *self.writer.lock().await = None;
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            tracing::warn!("Socket closed unexpectedly: {}", reason);
            if self.events.send(TransportEvent::Disconnected { reason }).await.is_err() {
                return;
            }
            match self.reconnect().await {
                Some(next) => read_half = next,
                None => return,
            }
        }
    }

    async fn read_until_closed(&self, read_half: &mut OwnedReadHalf) -> String {
        let mut codec = LineCodec::new(self.coalesce);
        let mut buf = [0u8; 512];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => return "connection closed by peer".to_string(),
                Ok(n) => {
                    for line in codec.feed(&buf[..n]) {
                        tracing::trace!("RX {}", line);
                        if self.events.send(TransportEvent::Line(line)).await.is_err() {
                            return "event receiver dropped".to_string();
                        }
                    }
                }
                Err(e) => return format!("socket read error: {e}"),
            }
        }
    }

    async fn reconnect(&self) -> Option<OwnedReadHalf> {
        for attempt in 1..=self.reconnect.max_attempts {
            let delay = backoff_delay(&self.reconnect, attempt);
            tracing::info!("Reconnect attempt {}/{} in {:?}", attempt, self.reconnect.max_attempts, delay);
            tokio::time::sleep(delay).await;
            if self.closing.load(Ordering::SeqCst) {
                return None;
            }
            match TcpStream::connect((self.address.0.as_str(), self.address.1)).await {
                Ok(stream) => {
                    let (read_half, write_half) = stream.into_split();
                    *self.writer.lock().await = Some(write_half);
                    self.connected.store(true, Ordering::SeqCst);
                    tracing::info!("Reconnected to {}:{}", self.address.0, self.address.1);
                    let _ = self.events.send(TransportEvent::Connected).await;
                    return Some(read_half);
                }
                Err(e) => tracing::warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
        let error = TransportError::ReconnectExhausted(self.reconnect.max_attempts);
        tracing::error!("{}", error);
        let _ = self.events.send(TransportEvent::Error(error.to_string())).await;
        None
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn connect(&mut self, events: EventSender) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.closing.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("Connected to {}:{}", self.host, self.port);

        let read_loop = ReadLoop {
            address: (self.host.clone(), self.port),
            reconnect: self.reconnect.clone(),
            coalesce: self.coalesce_status_ok,
            writer: self.writer.clone(),
            connected: self.connected.clone(),
            closing: self.closing.clone(),
            events: events.clone(),
        };
        self.reader = Some(tokio::spawn(read_loop.run(read_half)));
        let _ = events.send(TransportEvent::Connected).await;
        self.events = Some(events);
        Ok(())
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(TransportError::NotConnected)?;
        if let Frame::Line(line) = &frame {
            tracing::trace!("TX {}", line);
        }
        stream.write_all(&frame.to_bytes()).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut stream) = self.writer.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Socket shutdown: {}", e);
            }
        }
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if let Some(events) = self.events.take() {
            if was_connected {
                let reason = "closed by host".to_string();
                let _ = events.send(TransportEvent::Disconnected { reason }).await;
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        format!("socket {}:{}", self.host, self.port)
    }
}
