//! Program streaming: the loaded program, the send session, the flow-control
//! state machine and the async host that drives it against a transport.

pub mod controller;
pub mod host;
pub mod report;
pub mod session;

pub use controller::{
    Action, CommandError, ControllerState, FinishedSession, SessionOutcome, SessionSnapshot, SessionView, StartRejected,
    StreamingController,
};
pub use host::{HostCommand, HostError, MachineHandle, MachineHost};
pub use report::{AlarmReport, ChannelReporter, ErrorReport, OperatorReport, OperatorReporter, TracingReporter};
pub use session::{BufferType, ProgramStore, StreamingSession};
