//! Flow-controlled send/acknowledge state machine.
//!
//! [`StreamingController`] performs no IO. Every input (a controller line, a
//! status telegram, an operator request, a transport failure) goes in through
//! a method and comes back out as a list of [`Action`]s for the host driver to
//! carry out in order.

use chrono::Utc;
use millstream_shared::status::ControllerResponse;
use millstream_shared::{
    ActiveModal, MachineState, MachineStatus, ModalScanner, OffsetId, OffsetTable, ReverseError, classify_response,
    resume_program, reverse,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::report::{AlarmReport, ErrorReport};
use super::session::{BufferType, ProgramStore, StreamingSession};
use crate::config::StreamingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControllerState {
    #[default]
    Idle,
    Sending,
    /// The machine is holding or homing; the session survives but nothing is sent.
    Paused,
    ErrorStopped,
}

/// Work for the host driver, produced by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Transmit one program line on behalf of `session`.
    Send { session: Uuid, line: String },
    /// Feed hold now, soft reset after the configured delay. `session` is the
    /// session that was stopped.
    HoldThenReset { session: Uuid },
    /// A host query whose `ok` is not a line acknowledgement.
    Query(String),
    ReportError(ErrorReport),
    ReportAlarm(AlarmReport),
    Completed { session: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StartRejected {
    #[error("controller is not connected")]
    NotConnected,
    #[error("a session is already active")]
    SessionActive,
    #[error("program is empty")]
    EmptyProgram,
    #[error("controller reset still in progress")]
    ResetPending,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("start rejected: {0}")]
    Rejected(#[from] StartRejected),
    #[error("reverse failed: {0}")]
    Reverse(#[from] ReverseError),
    #[error("line {0} is not part of the loaded program")]
    UnknownLine(u32),
    #[error("no machine position reported yet")]
    NoPosition,
    #[error("no line selected to reverse from")]
    NoSelection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOutcome {
    Completed,
    /// Ended by a controller error or a failed send.
    Failed,
    /// Dropped on disconnect, alarm, door or controller reset.
    Discarded,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedSession {
    pub id: Uuid,
    pub outcome: SessionOutcome,
}

/// Read-only view of a running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: Uuid,
    pub buffer_type: BufferType,
    pub total_lines: usize,
    pub next_line_index: usize,
    pub acknowledged_count: usize,
    pub selected_line: Option<u32>,
    pub started_at: chrono::DateTime<Utc>,
}

/// Everything an observer may look at, published after every event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: ControllerState,
    pub connected: bool,
    pub session: Option<SessionView>,
    pub machine: MachineStatus,
    pub active_modal: ActiveModal,
    pub reported_modal: Vec<String>,
    pub offsets: OffsetTable,
    pub active_offset: OffsetId,
    pub loaded_lines: usize,
    pub selected_line: Option<u32>,
    pub reset_pending: bool,
    pub last_error: Option<ErrorReport>,
    pub last_finished: Option<FinishedSession>,
}

/// Progress of the soft reset that follows a stopped or failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetPhase {
    Clear,
    /// Hold sent, reset not yet issued.
    Scheduled(Uuid),
    /// Reset sent. Cleared by the welcome banner, or by a status reply to a
    /// query sent after the reset.
    Issued { polled: bool },
}

pub struct StreamingController {
    ack_window: usize,
    exec_window: usize,
    state: ControllerState,
    connected: bool,
    session: Option<StreamingSession>,
    store: ProgramStore,
    offsets: OffsetTable,
    active_offset: OffsetId,
    status: MachineStatus,
    reported_modal: Vec<String>,
    active_modal: ActiveModal,
    scanner: ModalScanner,
    selected_line: Option<u32>,
    /// `ok`s owed to host queries (`$G`, `$#`) rather than program lines.
    pending_query_acks: usize,
    alarm_reported: bool,
    reset: ResetPhase,
    last_error: Option<ErrorReport>,
    last_finished: Option<FinishedSession>,
}

impl StreamingController {
    pub fn new(config: &StreamingConfig, offsets: OffsetTable, active_offset: OffsetId) -> Self {
        Self {
            ack_window: config.ack_window,
            exec_window: config.exec_window,
            state: ControllerState::Idle,
            connected: false,
            session: None,
            store: ProgramStore::default(),
            offsets,
            active_offset,
            status: MachineStatus::default(),
            reported_modal: Vec::new(),
            active_modal: ActiveModal { offset: active_offset, ..ActiveModal::default() },
            scanner: ModalScanner::new(),
            selected_line: None,
            pending_query_acks: 0,
            alarm_reported: false,
            reset: ResetPhase::Clear,
            last_error: None,
            last_finished: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn session(&self) -> Option<&StreamingSession> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn store(&self) -> &ProgramStore {
        &self.store
    }

    pub fn offsets(&self) -> &OffsetTable {
        &self.offsets
    }

    pub fn status(&self) -> &MachineStatus {
        &self.status
    }

    pub fn active_modal(&self) -> ActiveModal {
        self.active_modal
    }

    pub fn last_error(&self) -> Option<&ErrorReport> {
        self.last_error.as_ref()
    }

    pub fn last_finished(&self) -> Option<FinishedSession> {
        self.last_finished
    }

    /// True from a stop or error until the controller is known to have reset.
    pub fn reset_pending(&self) -> bool {
        self.reset != ResetPhase::Clear
    }

    pub fn connected(&mut self) {
        self.connected = true;
        self.pending_query_acks = 0;
        self.reset = ResetPhase::Clear;
    }

    pub fn disconnected(&mut self) {
        self.connected = false;
        self.pending_query_acks = 0;
        self.reset = ResetPhase::Clear;
        self.status.state = MachineState::NotConnected;
        self.discard_session("transport disconnected");
        self.state = ControllerState::Idle;
    }

    /// Records that a query whose `ok` must not count as a line acknowledgement was sent.
    pub fn note_query(&mut self) {
        self.pending_query_acks += 1;
    }

    /// Records that a status query went out.
    pub fn note_status_query(&mut self) {
        if let ResetPhase::Issued { polled } = &mut self.reset {
            *polled = true;
        }
    }

    /// Records that the soft reset was sent. `session` names the stopped
    /// session the reset was scheduled for; a reset for any other session is
    /// stale and returns false. `None` is an unconditional operator reset.
    pub fn reset_issued(&mut self, session: Option<Uuid>) -> bool {
        let scheduled = match self.reset {
            ResetPhase::Scheduled(id) => Some(id),
            _ => None,
        };
        if session.is_some() && session != scheduled {
            tracing::debug!("ignoring stale reset for session {:?}", session);
            return false;
        }
        // Replies to anything sent before the reset never arrive.
        self.pending_query_acks = 0;
        self.reset = ResetPhase::Issued { polled: false };
        true
    }

    fn schedule_reset(&mut self, session: Uuid) -> Action {
        self.reset = ResetPhase::Scheduled(session);
        Action::HoldThenReset { session }
    }

    /// Replaces the loaded program. Refused while a session is running.
    pub fn load(&mut self, text: &str) -> Result<usize, CommandError> {
        if self.session.is_some() {
            return Err(StartRejected::SessionActive.into());
        }
        self.store = ProgramStore::load(text, &self.offsets, self.active_offset);
        self.scanner.clear();
        self.selected_line = None;
        Ok(self.store.lines().len())
    }

    pub fn start(&mut self, lines: Vec<String>, buffer_type: BufferType) -> Result<(Uuid, Vec<Action>), StartRejected> {
        if !self.connected {
            return Err(StartRejected::NotConnected);
        }
        if self.session.is_some() || !matches!(self.state, ControllerState::Idle | ControllerState::ErrorStopped) {
            return Err(StartRejected::SessionActive);
        }
        if lines.is_empty() {
            return Err(StartRejected::EmptyProgram);
        }
        if self.reset_pending() {
            return Err(StartRejected::ResetPending);
        }
        let session = StreamingSession::new(lines, buffer_type);
        let id = session.id;
        tracing::info!("Starting {:?} session {} ({} lines)", buffer_type, id, session.len());
        self.session = Some(session);
        self.state = ControllerState::Sending;
        self.last_error = None;
        Ok((id, self.pump()))
    }

    /// Streams the loaded program from its first line.
    pub fn start_program(&mut self) -> Result<(Uuid, Vec<Action>), CommandError> {
        let lines = self.store.lines().to_vec();
        Ok(self.start(lines, BufferType::Program)?)
    }

    /// Streams the loaded program backward from `from_line` (or the selected
    /// line) using the last reported machine position.
    pub fn reverse_from(&mut self, from_line: Option<u32>) -> Result<(Uuid, Vec<Action>), CommandError> {
        let from_line = from_line.or(self.selected_line).ok_or(CommandError::NoSelection)?;
        let position = self.status.machine_position.ok_or(CommandError::NoPosition)?;
        let lines = reverse(self.store.records(), from_line, &position, &self.offsets)?;
        Ok(self.start(lines, BufferType::Reverse)?)
    }

    /// Streams the loaded program from `line` on, behind a modal preamble.
    pub fn resume_from(&mut self, line: u32) -> Result<(Uuid, Vec<Action>), CommandError> {
        let lines =
            resume_program(self.store.records(), self.store.lines(), line).ok_or(CommandError::UnknownLine(line))?;
        Ok(self.start(lines, BufferType::Resume)?)
    }

    /// Ends any session. Safe in every state; acknowledgements still in flight
    /// are ignored afterwards.
    pub fn stop(&mut self) -> Vec<Action> {
        let stopped = self.end_session(SessionOutcome::Stopped);
        self.state = ControllerState::Idle;
        if let Some(session) = stopped {
            tracing::info!("Session {} stopped by operator", session.id);
            vec![self.schedule_reset(session.id)]
        } else {
            vec![]
        }
    }

    /// Sends as many lines as the two flow-control windows allow.
    pub fn pump(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != ControllerState::Sending {
            return actions;
        }
        let Some(session) = self.session.as_mut() else {
            return actions;
        };
        while !session.all_sent()
            && session.in_flight() < self.ack_window
            && session.next_line_index <= session.execution_index() + self.exec_window
        {
            let index = session.next_line_index;
            let line = session.program[index].clone();
            session.next_line_index += 1;
            tracing::debug!("send [{}/{}] {}", index + 1, session.len(), line);
            let highlighted = session.selected_line.or(session.line_numbers[index]);
            actions.push(Action::Send { session: session.id, line });
            if let Some(record) = highlighted.and_then(|n| self.store.record_index(n)) {
                self.active_modal = self.scanner.state_at(self.store.records(), record);
            }
        }
        actions.extend(self.check_complete());
        actions
    }

    fn check_complete(&mut self) -> Option<Action> {
        let session = self.session.as_ref()?;
        if !session.is_complete() {
            return None;
        }
        let id = session.id;
        tracing::info!("Session {} complete ({} lines)", id, session.len());
        self.end_session(SessionOutcome::Completed);
        self.state = ControllerState::Idle;
        Some(Action::Completed { session: id })
    }

    /// Feeds one inbound line from the transport.
    pub fn handle_line(&mut self, line: &str) -> Vec<Action> {
        match classify_response(line) {
            ControllerResponse::Ok => self.acknowledge(),
            ControllerResponse::Error { code, message } => self.controller_error(line, code, message),
            ControllerResponse::Alarm { code, message } => {
                self.discard_session("controller alarm");
                self.state = ControllerState::Idle;
                self.alarm_reported = true;
                vec![Action::ReportAlarm(AlarmReport { code, message, at: Utc::now() })]
            }
            ControllerResponse::Status(status) => self.apply_status(status),
            ControllerResponse::Offset { id, point } => {
                tracing::debug!("offset {} = {:?}", id.code(), point);
                self.offsets.set(id, point);
                vec![]
            }
            ControllerResponse::ModalState(words) => {
                if let Some(id) = words.iter().find_map(|w| OffsetId::from_code(w).filter(|id| id.is_work_offset())) {
                    self.active_offset = id;
                }
                self.reported_modal = words;
                vec![]
            }
            ControllerResponse::Welcome(banner) => {
                tracing::info!("Controller reset: {}", banner);
                self.pending_query_acks = 0;
                self.reset = ResetPhase::Clear;
                self.discard_session("controller reset");
                self.state = ControllerState::Idle;
                vec![Action::Query("$#".to_string())]
            }
            ControllerResponse::Message(text) => {
                tracing::debug!("controller message: {}", text);
                vec![]
            }
            ControllerResponse::Other(text) => {
                tracing::trace!("unhandled controller line '{}'", text);
                vec![]
            }
        }
    }

    fn acknowledge(&mut self) -> Vec<Action> {
        if self.pending_query_acks > 0 {
            self.pending_query_acks -= 1;
            return vec![];
        }
        let Some(session) = self.session.as_mut() else {
            tracing::trace!("ok with no active session");
            return vec![];
        };
        if !session.acknowledge() {
            tracing::warn!("Ignoring ok beyond the lines sent");
        }
        self.pump()
    }

    fn controller_error(&mut self, raw: &str, code: Option<u32>, message: String) -> Vec<Action> {
        // Replies arrive in order, so an owed query reply comes before any program line's.
        if self.pending_query_acks > 0 {
            self.pending_query_acks -= 1;
            tracing::warn!("Controller rejected a host query: {}", raw);
            return vec![];
        }
        if !matches!(self.state, ControllerState::Sending | ControllerState::Paused) {
            tracing::warn!("Controller error outside a session: {}", raw);
            return vec![];
        }
        self.error_stop(raw.to_string(), code, message)
    }

    /// A transport failure while sending a line of `session`. Stale sessions are ignored.
    pub fn send_failed(&mut self, session: Uuid, error: &str) -> Vec<Action> {
        if self.session_id() != Some(session) {
            tracing::debug!("dropping send failure for stale session {}", session);
            return vec![];
        }
        self.error_stop(error.to_string(), None, format!("send failed: {error}"))
    }

    fn error_stop(&mut self, raw: String, code: Option<u32>, message: String) -> Vec<Action> {
        let Some(session) = self.end_session(SessionOutcome::Failed) else {
            return vec![];
        };
        let estimated_line_number = session.acknowledged_count + 2;
        tracing::error!("Session {} stopped on error near line {}: {}", session.id, estimated_line_number, raw);
        self.state = ControllerState::ErrorStopped;
        let report =
            ErrorReport { message, raw, code, estimated_line_number, session: Some(session.id), at: Utc::now() };
        self.last_error = Some(report.clone());
        vec![self.schedule_reset(session.id), Action::ReportError(report)]
    }

    fn apply_status(&mut self, status: MachineStatus) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.reset == (ResetPhase::Issued { polled: true }) {
            tracing::debug!("controller answered after reset");
            self.reset = ResetPhase::Clear;
        }
        if let Some(line) = status.line_in_execution {
            if let Some(session) = self.session.as_mut() {
                session.observe_line(line);
            }
            if self.selected_line != Some(line) {
                self.selected_line = Some(line);
                if let Some(index) = self.store.record_index(line) {
                    self.active_modal = self.scanner.state_at(self.store.records(), index);
                }
            }
        }

        match status.state {
            MachineState::Door | MachineState::Alarm => {
                if status.state == MachineState::Alarm && !self.alarm_reported {
                    self.alarm_reported = true;
                    let message = "Controller entered alarm state".to_string();
                    actions.push(Action::ReportAlarm(AlarmReport { code: None, message, at: Utc::now() }));
                }
                if matches!(self.state, ControllerState::Sending | ControllerState::Paused) {
                    self.discard_session(&format!("machine state {:?}", status.state));
                    self.state = ControllerState::Idle;
                }
            }
            MachineState::Hold | MachineState::Home => {
                if self.state == ControllerState::Sending {
                    tracing::debug!("transmission paused ({:?})", status.state);
                    self.state = ControllerState::Paused;
                }
            }
            _ => {
                if self.state == ControllerState::Paused {
                    tracing::debug!("transmission resumed");
                    self.state = ControllerState::Sending;
                }
            }
        }
        if status.state != MachineState::Alarm {
            self.alarm_reported = false;
        }
        self.status = status;
        actions.extend(self.pump());
        actions
    }

    fn discard_session(&mut self, reason: &str) {
        if let Some(session) = self.end_session(SessionOutcome::Discarded) {
            tracing::warn!("Discarding session {}: {}", session.id, reason);
        }
    }

    fn end_session(&mut self, outcome: SessionOutcome) -> Option<StreamingSession> {
        let session = self.session.take()?;
        self.last_finished = Some(FinishedSession { id: session.id, outcome });
        Some(session)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            connected: self.connected,
            session: self.session.as_ref().map(|s| SessionView {
                id: s.id,
                buffer_type: s.buffer_type,
                total_lines: s.len(),
                next_line_index: s.next_line_index,
                acknowledged_count: s.acknowledged_count,
                selected_line: s.selected_line,
                started_at: s.started_at,
            }),
            machine: self.status.clone(),
            active_modal: self.active_modal,
            reported_modal: self.reported_modal.clone(),
            offsets: self.offsets.clone(),
            active_offset: self.active_offset,
            loaded_lines: self.store.lines().len(),
            selected_line: self.selected_line,
            reset_pending: self.reset_pending(),
            last_error: self.last_error.clone(),
            last_finished: self.last_finished,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> StreamingController {
        let mut c = StreamingController::new(&StreamingConfig::default(), OffsetTable::new(), OffsetId::G54);
        c.connected();
        c
    }

    fn sends(actions: &[Action]) -> usize {
        actions.iter().filter(|a| matches!(a, Action::Send { .. })).count()
    }

    fn program(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("N{i} G1 X{i} F100")).collect()
    }

    #[test]
    fn start_requires_a_connection() {
        let mut c = StreamingController::new(&StreamingConfig::default(), OffsetTable::new(), OffsetId::G54);
        assert_eq!(c.start(program(3), BufferType::Program).unwrap_err(), StartRejected::NotConnected);
    }

    #[test]
    fn empty_and_concurrent_starts_are_rejected() {
        let mut c = controller();
        assert_eq!(c.start(vec![], BufferType::Program).unwrap_err(), StartRejected::EmptyProgram);
        c.start(program(30), BufferType::Program).unwrap();
        assert_eq!(c.start(program(3), BufferType::Program).unwrap_err(), StartRejected::SessionActive);
    }

    #[test]
    fn first_burst_fills_the_window() {
        let mut c = controller();
        let (_, actions) = c.start(program(30), BufferType::Program).unwrap();
        assert_eq!(sends(&actions), 10);
        assert_eq!(sends(&c.handle_line("ok")), 1);
    }

    #[test]
    fn query_acks_are_not_counted() {
        let mut c = controller();
        c.note_query();
        c.start(program(30), BufferType::Program).unwrap();
        assert!(c.handle_line("ok").is_empty());
        assert_eq!(c.session().unwrap().acknowledged_count, 0);
    }

    #[test]
    fn hold_pauses_and_idle_resumes() {
        let mut c = controller();
        c.start(program(30), BufferType::Program).unwrap();
        c.handle_line("<Hold:0|MPos:0,0,0>");
        assert_eq!(c.state(), ControllerState::Paused);
        assert!(c.handle_line("ok").is_empty());
        let actions = c.handle_line("<Run|MPos:0,0,0>");
        assert_eq!(c.state(), ControllerState::Sending);
        assert_eq!(sends(&actions), 1);
    }

    #[test]
    fn stop_is_safe_without_a_session() {
        let mut c = controller();
        assert!(c.stop().is_empty());
        let (id, _) = c.start(program(3), BufferType::Program).unwrap();
        assert_eq!(c.stop(), vec![Action::HoldThenReset { session: id }]);
        assert_eq!(c.state(), ControllerState::Idle);
    }

    #[test]
    fn restart_waits_for_the_controller_reset() {
        let mut c = controller();
        let (old, _) = c.start(program(30), BufferType::Program).unwrap();
        c.stop();
        assert_eq!(c.start(program(3), BufferType::Program).unwrap_err(), StartRejected::ResetPending);

        assert!(!c.reset_issued(Some(Uuid::new_v4())));
        assert!(c.reset_issued(Some(old)));
        // A status reply to a query sent before the reset does not clear it.
        c.handle_line("<Idle|MPos:0,0,0>");
        assert!(c.reset_pending());
        c.note_status_query();
        c.handle_line("ok");
        c.handle_line("<Idle|MPos:0,0,0>");
        assert!(!c.reset_pending());
        assert!(c.start(program(3), BufferType::Program).is_ok());
    }

    #[test]
    fn welcome_banner_clears_a_pending_reset() {
        let mut c = controller();
        c.start(program(30), BufferType::Program).unwrap();
        c.handle_line("error:20");
        assert!(c.reset_pending());
        c.handle_line("Grbl 1.1h ['$' for help]");
        assert!(!c.reset_pending());
    }

    #[test]
    fn query_errors_do_not_stop_the_session() {
        let mut c = controller();
        c.note_query();
        c.start(program(30), BufferType::Program).unwrap();
        assert!(c.handle_line("error:3").is_empty());
        assert_eq!(c.state(), ControllerState::Sending);
        assert!(c.session().is_some());
        assert_eq!(c.handle_line("error:20").len(), 2);
        assert_eq!(c.state(), ControllerState::ErrorStopped);
    }
}
