//! Operator-facing error and alarm reports.
//!
//! The streaming core only produces reports; presenting them is up to whoever
//! implements [`OperatorReporter`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    /// The controller line that triggered the stop, or the transport error text.
    pub raw: String,
    pub code: Option<u32>,
    /// One-based program line believed to have failed.
    pub estimated_line_number: usize,
    pub session: Option<Uuid>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmReport {
    pub code: Option<u32>,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperatorReport {
    Error(ErrorReport),
    Alarm(AlarmReport),
}

pub trait OperatorReporter: Send {
    fn report_error(&mut self, report: ErrorReport);
    fn report_alarm(&mut self, report: AlarmReport);
}

/// Logs reports and nothing else.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl OperatorReporter for TracingReporter {
    fn report_error(&mut self, report: ErrorReport) {
        tracing::error!(
            "Controller error near line {}: {} ({})",
            report.estimated_line_number,
            report.message,
            report.raw
        );
    }

    fn report_alarm(&mut self, report: AlarmReport) {
        match report.code {
            Some(code) => tracing::error!("Alarm {}: {}", code, report.message),
            None => tracing::error!("Alarm: {}", report.message),
        }
    }
}

/// Forwards reports to a channel. Reports are dropped once the receiver is gone.
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<OperatorReport>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OperatorReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OperatorReporter for ChannelReporter {
    fn report_error(&mut self, report: ErrorReport) {
        if self.tx.send(OperatorReport::Error(report)).is_err() {
            tracing::debug!("operator report receiver closed");
        }
    }

    fn report_alarm(&mut self, report: AlarmReport) {
        if self.tx.send(OperatorReport::Alarm(report)).is_err() {
            tracing::debug!("operator report receiver closed");
        }
    }
}
