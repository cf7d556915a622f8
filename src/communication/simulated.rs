//! In-process controller emulator.
//!
//! Acknowledges every line, tracks position with the shared parser and answers
//! status, modal-state and offset queries in the controller's telegram format.
//! Used by `millstream stream --simulate` and the integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use millstream_shared::status::MachineState;
use millstream_shared::{GCodeParser, OffsetId, OffsetTable, Point};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{EventSender, Frame, LineCodec, Realtime, Transport, TransportError, TransportEvent};

const WELCOME: &str = "Grbl 1.1h ['$' for help]";

#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    /// Follow every status telegram with a bare `ok`, as some firmware does.
    pub ok_after_status: bool,
    pub coalesce_status_ok: bool,
    /// Lines containing this text are answered with `error:20`.
    pub error_on: Option<String>,
    pub offsets: OffsetTable,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self { ok_after_status: true, coalesce_status_ok: true, error_on: None, offsets: OffsetTable::new() }
    }
}

/// Lines the emulator has received, in order.
pub type ReceivedLog = Arc<Mutex<Vec<String>>>;

pub struct SimulatedTransport {
    options: SimulatorOptions,
    frames: Option<mpsc::UnboundedSender<Frame>>,
    task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    events: Option<EventSender>,
    received: ReceivedLog,
}

impl SimulatedTransport {
    pub fn new(options: SimulatorOptions) -> Self {
        Self {
            options,
            frames: None,
            task: None,
            connected: Arc::new(AtomicBool::new(false)),
            events: None,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn received(&self) -> ReceivedLog {
        self.received.clone()
    }
}

struct Emulator {
    options: SimulatorOptions,
    parser: GCodeParser,
    state: MachineState,
    line: Option<u32>,
    codec: LineCodec,
    events: EventSender,
    received: ReceivedLog,
}

fn axes(point: &Point) -> String {
    format!("{:.3},{:.3},{:.3}", point.x, point.y, point.z)
}

impl Emulator {
    fn new(options: SimulatorOptions, events: EventSender, received: ReceivedLog) -> Self {
        let parser = GCodeParser::new(options.offsets.clone(), OffsetId::G54);
        let codec = LineCodec::new(options.coalesce_status_ok);
        Self { options, parser, state: MachineState::Idle, line: None, codec, events, received }
    }

    async fn emit(&mut self, text: &str) -> bool {
        let mut bytes = text.as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        for line in self.codec.feed(&bytes) {
            if self.events.send(TransportEvent::Line(line)).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn run(mut self, mut frames: mpsc::UnboundedReceiver<Frame>) {
        self.emit(WELCOME).await;
        while let Some(frame) = frames.recv().await {
            let alive = match frame {
                Frame::Realtime(r) => self.handle_realtime(r).await,
                Frame::Line(line) => self.handle_line(line.trim()).await,
            };
            if !alive {
                break;
            }
        }
    }

    async fn handle_realtime(&mut self, realtime: Realtime) -> bool {
        match realtime {
            Realtime::StatusQuery => {
                let status = self.status_report();
                if !self.emit(&status).await {
                    return false;
                }
                if self.options.ok_after_status {
                    return self.emit("ok").await;
                }
                true
            }
            Realtime::FeedHold => {
                self.state = MachineState::Hold;
                true
            }
            Realtime::CycleResume => {
                self.state = MachineState::Idle;
                true
            }
            Realtime::SoftReset => {
                self.state = MachineState::Idle;
                self.codec.reset();
                self.emit(WELCOME).await
            }
            Realtime::JogCancel | Realtime::DwellSkip => true,
        }
    }

    fn status_report(&self) -> String {
        let modal = self.parser.modal();
        let wco = self.parser.offsets().effective(modal.active_work_offset);
        let state = format!("{:?}", self.state);
        let mut report = format!(
            "<{}|MPos:{}|FS:{},{}|WCO:{}",
            state,
            axes(&self.parser.position()),
            modal.feed_rate,
            modal.spindle_speed,
            axes(&wco)
        );
        if let Some(line) = self.line {
            report.push_str(&format!("|Ln:{line}"));
        }
        report.push('>');
        report
    }

    async fn handle_line(&mut self, line: &str) -> bool {
        if let Ok(mut received) = self.received.lock() {
            received.push(line.to_string());
        }
        if self.state == MachineState::Alarm {
            return self.emit("error:9").await;
        }
        if let Some(pattern) = &self.options.error_on {
            if line.contains(pattern.as_str()) {
                return self.emit("error:20").await;
            }
        }
        match line {
            "$G" => {
                let modal = self.parser.modal().clone();
                let report = format!(
                    "[GC:G0 {} {} {} {} G94 M5 M9 T0 F{} S{}]",
                    modal.active_work_offset.code(),
                    modal.plane.code(),
                    modal.units.code(),
                    modal.positioning.code(),
                    modal.feed_rate,
                    modal.spindle_speed
                );
                self.emit(&report).await && self.emit("ok").await
            }
            "$#" => {
                let offsets: Vec<String> = self
                    .parser
                    .offsets()
                    .iter()
                    .map(|(id, point)| format!("[{}:{}]", id.code(), axes(&point)))
                    .collect();
                for offset in offsets {
                    if !self.emit(&offset).await {
                        return false;
                    }
                }
                self.emit("ok").await
            }
            _ => {
                if !line.starts_with('$') {
                    if let Some(record) = self.parser.parse_line(line) {
                        self.line = Some(record.line_number);
                    }
                }
                self.emit("ok").await
            }
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn connect(&mut self, events: EventSender) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let emulator = Emulator::new(self.options.clone(), events.clone(), self.received.clone());
        self.connected.store(true, Ordering::SeqCst);
        let _ = events.send(TransportEvent::Connected).await;
        self.task = Some(tokio::spawn(emulator.run(rx)));
        self.frames = Some(tx);
        self.events = Some(events);
        tracing::info!("Connected to simulated controller");
        Ok(())
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let frames = self.frames.as_ref().ok_or(TransportError::NotConnected)?;
        frames.send(frame).map_err(|_| TransportError::NotConnected)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.frames = None;
        if let Some(task) = self.task.take() {
            task.abort();
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
        "simulated controller".to_string()
    }
}
