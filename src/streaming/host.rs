//! Async driver around [`StreamingController`].
//!
//! One task owns the transport and the controller and reacts to transport
//! events, operator commands and timers from a single `tokio::select!` loop,
//! so controller state is only ever touched from that task. Operators talk to
//! it through a cloneable [`MachineHandle`].

use std::collections::VecDeque;
use std::time::Duration;

use futures_core::Stream;
use millstream_shared::{OffsetId, Point};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use super::controller::{Action, CommandError, SessionSnapshot, StartRejected, StreamingController};
use super::report::OperatorReporter;
use crate::communication::{EventReceiver, EventSender, Frame, Realtime, Transport, TransportError, TransportEvent, event_channel};
use crate::config::{Config, ConfigError, PollingConfig};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("offset {0:?} cannot be set from the host")]
    UnsupportedOffset(OffsetId),
    #[error("machine host is not running")]
    Closed,
}

type Reply<T> = oneshot::Sender<Result<T, HostError>>;

pub enum HostCommand {
    Connect { respond_to: Reply<()> },
    Disconnect { respond_to: Reply<()> },
    Load { text: String, respond_to: Reply<usize> },
    Start { respond_to: Reply<Uuid> },
    Stop { respond_to: oneshot::Sender<()> },
    Reverse { from_line: Option<u32>, respond_to: Reply<Uuid> },
    ResumeFrom { line: u32, respond_to: Reply<Uuid> },
    FeedHold { respond_to: Reply<()> },
    CycleResume { respond_to: Reply<()> },
    SoftReset { respond_to: Reply<()> },
    SetOffset { id: OffsetId, point: Point, respond_to: Reply<()> },
    Shutdown,
}

pub struct MachineHost {
    core: HostCore,
    commands: mpsc::Receiver<HostCommand>,
    events: EventReceiver,
    shutdown: broadcast::Receiver<()>,
}

struct HostCore {
    transport: Box<dyn Transport>,
    controller: StreamingController,
    reporter: Box<dyn OperatorReporter>,
    events_tx: EventSender,
    snapshots: watch::Sender<SessionSnapshot>,
    polling: PollingConfig,
    reset_delay: Duration,
    /// When to soft-reset, and the stopped session the reset belongs to.
    pending_reset: Option<(Instant, Uuid)>,
}

impl MachineHost {
    pub fn new(
        transport: Box<dyn Transport>,
        config: &Config,
        reporter: Box<dyn OperatorReporter>,
    ) -> Result<(MachineHost, MachineHandle), ConfigError> {
        let controller =
            StreamingController::new(&config.streaming, config.offsets.table()?, config.offsets.active_offset()?);
        let (events_tx, events) = event_channel();
        let (commands_tx, commands) = mpsc::channel(64);
        let (snapshots, snapshots_rx) = watch::channel(controller.snapshot());
        let (shutdown_tx, shutdown) = broadcast::channel(1);

        let core = HostCore {
            transport,
            controller,
            reporter,
            events_tx,
            snapshots,
            polling: config.polling.clone(),
            reset_delay: config.streaming.reset_delay(),
            pending_reset: None,
        };
        let handle = MachineHandle { commands: commands_tx, snapshots: snapshots_rx, shutdown: shutdown_tx };
        Ok((MachineHost { core, commands, events, shutdown }, handle))
    }

    pub async fn run(self) {
        let MachineHost { mut core, mut commands, mut events, mut shutdown } = self;
        let mut status_tick = tokio::time::interval(core.polling.status_interval());
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut modal_tick = tokio::time::interval(core.polling.modal_interval());
        modal_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("Machine host running on {}", core.transport.describe());

        loop {
            let connected = core.controller.is_connected();
            let idle = core.controller.session().is_none() && !core.controller.reset_pending();
            let reset_at = core.pending_reset.map(|(at, _)| at);
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Machine host shutting down");
                    break;
                }
                command = commands.recv() => match command {
                    Some(HostCommand::Shutdown) | None => {
                        tracing::info!("Machine host shutting down");
                        break;
                    }
                    Some(command) => core.handle_command(command).await,
                },
                Some(event) = events.recv() => core.handle_event(event).await,
                _ = status_tick.tick(), if connected => core.poll_status().await,
                _ = modal_tick.tick(), if connected && idle => core.poll_modal().await,
                _ = tokio::time::sleep_until(reset_at.unwrap_or_else(Instant::now)), if reset_at.is_some() => {
                    core.finish_reset().await;
                }
            }
            core.publish();
        }
        core.close().await;
    }
}

impl HostCore {
    fn publish(&self) {
        self.snapshots.send_replace(self.controller.snapshot());
    }

    async fn realtime(&mut self, realtime: Realtime) -> Result<(), TransportError> {
        self.transport.send(Frame::Realtime(realtime)).await
    }

    /// Sends a line whose `ok` belongs to the host, not the program.
    async fn query(&mut self, line: &str) -> Result<(), TransportError> {
        self.transport.send(Frame::Line(line.to_string())).await?;
        self.controller.note_query();
        Ok(())
    }

    async fn poll_status(&mut self) {
        match self.realtime(Realtime::StatusQuery).await {
            Ok(()) => self.controller.note_status_query(),
            Err(e) => tracing::debug!("status query failed: {}", e),
        }
    }

    async fn poll_modal(&mut self) {
        for query in ["$G", "$#"] {
            if let Err(e) = self.query(query).await {
                tracing::debug!("{} query failed: {}", query, e);
                return;
            }
        }
    }

    async fn finish_reset(&mut self) {
        let Some((_, session)) = self.pending_reset.take() else {
            return;
        };
        if !self.controller.reset_issued(Some(session)) {
            return;
        }
        tracing::info!("Issuing soft reset after session {}", session);
        if let Err(e) = self.realtime(Realtime::SoftReset).await {
            tracing::error!("Soft reset failed: {}", e);
        }
    }

    /// Hold and reset right away, as on disconnect or an operator reset.
    async fn reset_now(&mut self, hold: bool) -> Result<(), TransportError> {
        self.pending_reset = None;
        if hold {
            if let Err(e) = self.realtime(Realtime::FeedHold).await {
                tracing::warn!("Feed hold failed: {}", e);
            }
        }
        self.controller.reset_issued(None);
        self.realtime(Realtime::SoftReset).await
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                tracing::info!("Controller connected");
                self.controller.connected();
            }
            TransportEvent::Disconnected { reason } => {
                tracing::warn!("Controller disconnected: {}", reason);
                self.pending_reset = None;
                self.controller.disconnected();
            }
            TransportEvent::Line(line) => {
                let actions = self.controller.handle_line(&line);
                self.execute(actions).await;
            }
            TransportEvent::Error(message) => {
                tracing::error!("Transport error: {}", message);
                self.pending_reset = None;
                self.controller.disconnected();
            }
        }
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send { session, line } => {
                    if self.controller.session_id() != Some(session) {
                        tracing::debug!("dropping line for stale session {}", session);
                        continue;
                    }
                    if let Err(e) = self.transport.send(Frame::Line(line)).await {
                        queue.extend(self.controller.send_failed(session, &e.to_string()));
                    }
                }
                Action::HoldThenReset { session } => {
                    if let Err(e) = self.realtime(Realtime::FeedHold).await {
                        tracing::error!("Feed hold failed: {}", e);
                    }
                    self.pending_reset = Some((Instant::now() + self.reset_delay, session));
                }
                Action::Query(line) => {
                    if let Err(e) = self.query(&line).await {
                        tracing::warn!("{} query failed: {}", line, e);
                    }
                }
                Action::ReportError(report) => self.reporter.report_error(report),
                Action::ReportAlarm(report) => self.reporter.report_alarm(report),
                Action::Completed { session } => tracing::info!("Session {} finished", session),
            }
        }
    }

    async fn start_with(&mut self, started: Result<(Uuid, Vec<Action>), CommandError>) -> Result<Uuid, HostError> {
        let (id, actions) = started?;
        self.execute(actions).await;
        Ok(id)
    }

    async fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Connect { respond_to } => {
                let result = self.transport.connect(self.events_tx.clone()).await.map_err(HostError::from);
                let _ = respond_to.send(result);
            }
            HostCommand::Disconnect { respond_to } => {
                if !self.controller.stop().is_empty() {
                    if let Err(e) = self.reset_now(true).await {
                        tracing::warn!("Soft reset before disconnect failed: {}", e);
                    }
                }
                self.pending_reset = None;
                let _ = respond_to.send(self.transport.disconnect().await.map_err(HostError::from));
            }
            HostCommand::Load { text, respond_to } => {
                let _ = respond_to.send(self.controller.load(&text).map_err(HostError::from));
            }
            HostCommand::Start { respond_to } => {
                let started = self.controller.start_program();
                let _ = respond_to.send(self.start_with(started).await);
            }
            HostCommand::Stop { respond_to } => {
                let actions = self.controller.stop();
                self.execute(actions).await;
                let _ = respond_to.send(());
            }
            HostCommand::Reverse { from_line, respond_to } => {
                let started = self.controller.reverse_from(from_line);
                let _ = respond_to.send(self.start_with(started).await);
            }
            HostCommand::ResumeFrom { line, respond_to } => {
                let started = self.controller.resume_from(line);
                let _ = respond_to.send(self.start_with(started).await);
            }
            HostCommand::FeedHold { respond_to } => {
                let _ = respond_to.send(self.realtime(Realtime::FeedHold).await.map_err(HostError::from));
            }
            HostCommand::CycleResume { respond_to } => {
                let _ = respond_to.send(self.realtime(Realtime::CycleResume).await.map_err(HostError::from));
            }
            HostCommand::SoftReset { respond_to } => {
                self.controller.stop();
                let _ = respond_to.send(self.reset_now(false).await.map_err(HostError::from));
            }
            HostCommand::SetOffset { id, point, respond_to } => {
                let _ = respond_to.send(self.set_offset(id, point).await);
            }
            HostCommand::Shutdown => {}
        }
    }

    /// Writes a work offset slot with `G10 L2` and asks the controller to report it back.
    async fn set_offset(&mut self, id: OffsetId, point: Point) -> Result<(), HostError> {
        let p = id.p_index().ok_or(HostError::UnsupportedOffset(id))?;
        if self.controller.session().is_some() {
            return Err(CommandError::from(StartRejected::SessionActive).into());
        }
        if self.controller.reset_pending() {
            return Err(CommandError::from(StartRejected::ResetPending).into());
        }
        self.query(&format!("G10 L2 P{} X{:.4} Y{:.4} Z{:.4}", p, point.x, point.y, point.z)).await?;
        self.query("$#").await?;
        Ok(())
    }

    async fn close(&mut self) {
        if self.transport.is_connected() {
            if let Err(e) = self.transport.disconnect().await {
                tracing::warn!("Disconnect on shutdown failed: {}", e);
            }
        }
    }
}

/// Cloneable front end to a running [`MachineHost`].
#[derive(Clone)]
pub struct MachineHandle {
    commands: mpsc::Sender<HostCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    shutdown: broadcast::Sender<()>,
}

impl MachineHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> HostCommand) -> Result<T, HostError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).await.map_err(|_| HostError::Closed)?;
        rx.await.map_err(|_| HostError::Closed)
    }

    pub async fn connect(&self) -> Result<(), HostError> {
        self.request(|respond_to| HostCommand::Connect { respond_to }).await?
    }

    pub async fn disconnect(&self) -> Result<(), HostError> {
        self.request(|respond_to| HostCommand::Disconnect { respond_to }).await?
    }

    /// Loads program text; returns the number of program lines.
    pub async fn load(&self, text: impl Into<String>) -> Result<usize, HostError> {
        let text = text.into();
        self.request(|respond_to| HostCommand::Load { text, respond_to }).await?
    }

    pub async fn start(&self) -> Result<Uuid, HostError> {
        self.request(|respond_to| HostCommand::Start { respond_to }).await?
    }

    pub async fn stop(&self) -> Result<(), HostError> {
        self.request(|respond_to| HostCommand::Stop { respond_to }).await
    }

    pub async fn reverse(&self, from_line: Option<u32>) -> Result<Uuid, HostError> {
        self.request(|respond_to| HostCommand::Reverse { from_line, respond_to }).await?
    }

    pub async fn resume_from(&self, line: u32) -> Result<Uuid, HostError> {
        self.request(|respond_to| HostCommand::ResumeFrom { line, respond_to }).await?
    }

    pub async fn feed_hold(&self) -> Result<(), HostError> {
        self.request(|respond_to| HostCommand::FeedHold { respond_to }).await?
    }

    pub async fn cycle_resume(&self) -> Result<(), HostError> {
        self.request(|respond_to| HostCommand::CycleResume { respond_to }).await?
    }

    pub async fn soft_reset(&self) -> Result<(), HostError> {
        self.request(|respond_to| HostCommand::SoftReset { respond_to }).await?
    }

    pub async fn set_offset(&self, id: OffsetId, point: Point) -> Result<(), HostError> {
        self.request(|respond_to| HostCommand::SetOffset { id, point, respond_to }).await?
    }

    pub async fn shutdown(&self) {
        if self.commands.send(HostCommand::Shutdown).await.is_err() {
            tracing::debug!("machine host already stopped");
        }
    }

    /// Stops the host loop without going through the command queue.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// The current snapshot, then one per change until the host stops.
    pub fn snapshots(&self) -> impl Stream<Item = SessionSnapshot> + use<> {
        let mut rx = self.snapshots.clone();
        async_stream::stream! {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                yield snapshot;
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Waits until a published snapshot satisfies `predicate`.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&SessionSnapshot) -> bool) -> Result<SessionSnapshot, HostError> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx.wait_for(|s| predicate(s)).await.map_err(|_| HostError::Closed)?;
        Ok(snapshot.clone())
    }
}
