//! Line-oriented transports to the motion controller.
//!
//! A [`Transport`] moves [`Frame`]s out and reports [`TransportEvent`]s back
//! through the channel handed to it on [`Transport::connect`]. Inbound bytes
//! are split and coalesced by [`codec::LineCodec`] before they are reported.

pub mod codec;
pub mod serial;
pub mod simulated;
pub mod socket;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{Config, ConnectionKind};

pub use codec::LineCodec;
pub use serial::SerialTransport;
pub use simulated::{SimulatedTransport, SimulatorOptions};
pub use socket::SocketTransport;

/// Single-byte commands the controller acts on immediately, outside the line buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Realtime {
    SoftReset,
    FeedHold,
    CycleResume,
    StatusQuery,
    JogCancel,
    DwellSkip,
}

impl Realtime {
    pub fn byte(self) -> u8 {
        match self {
            Realtime::SoftReset => 0x18,
            Realtime::FeedHold => b'!',
            Realtime::CycleResume => b'~',
            Realtime::StatusQuery => b'?',
            Realtime::JogCancel => 0x85,
            Realtime::DwellSkip => 0xA4,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Realtime> {
        [
            Realtime::SoftReset,
            Realtime::FeedHold,
            Realtime::CycleResume,
            Realtime::StatusQuery,
            Realtime::JogCancel,
            Realtime::DwellSkip,
        ]
        .into_iter()
        .find(|r| r.byte() == byte)
    }
}

/// Outbound unit: a `\n`-terminated line or an unterminated realtime byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    Realtime(Realtime),
}

impl Frame {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Frame::Line(line) => {
                let mut bytes = Vec::with_capacity(line.len() + 1);
                bytes.extend_from_slice(line.trim_end_matches(['\r', '\n']).as_bytes());
                bytes.push(b'\n');
                bytes
            }
            Frame::Realtime(r) => vec![r.byte()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Line(String),
    Error(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Reconnect gave up after {0} attempts")]
    ReconnectExhausted(u32),
}

pub type EventSender = mpsc::Sender<TransportEvent>;
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(1024)
}

#[async_trait]
pub trait Transport: Send {
    /// Opens the channel. Events, including `Connected`, go to `events`.
    async fn connect(&mut self, events: EventSender) -> Result<(), TransportError>;
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;
    /// Closes the channel on request. Emits `Disconnected` and never reconnects.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    fn describe(&self) -> String;
}

/// Builds the transport selected in `config`. `simulate` overrides the configured kind.
pub fn open_transport(config: &Config, simulate: bool) -> Box<dyn Transport> {
    let kind = if simulate { ConnectionKind::Simulated } else { config.connection.kind };
    let coalesce = config.streaming.coalesce_status_ok;
    match kind {
        ConnectionKind::Serial => Box::new(SerialTransport::new(
            config.connection.device.clone().unwrap_or_default(),
            config.connection.baud,
            coalesce,
        )),
        ConnectionKind::Socket => Box::new(SocketTransport::new(
            config.connection.host.clone(),
            config.connection.port,
            config.reconnect.clone(),
            coalesce,
        )),
        ConnectionKind::Simulated => Box::new(SimulatedTransport::new(SimulatorOptions {
            ok_after_status: coalesce,
            coalesce_status_ok: coalesce,
            ..SimulatorOptions::default()
        })),
    }
}

/// Serial ports present on this host.
pub fn available_ports() -> Vec<String> {
    match serial2_tokio::SerialPort::available_ports() {
        Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate serial ports: {}", e);
            vec![]
        }
    }
}
