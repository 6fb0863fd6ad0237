//! Tamper alerts.
//!
//! Chain and checkpoint verification failures are never just returned: they
//! are also raised here so an operator sees them even if the caller drops
//! the error.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::error;

/// What failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TamperKind {
    /// Stored bytes no longer match the hash recorded at store time.
    ContentHash,
    /// The audit hash chain does not recompute.
    AuditChain,
    /// A checkpoint signature, root or link is invalid.
    Checkpoint,
}

impl TamperKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TamperKind::ContentHash => "content_hash",
            TamperKind::AuditChain => "audit_chain",
            TamperKind::Checkpoint => "checkpoint",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TamperAlert {
    pub kind: TamperKind,
    /// Evidence key, entry id or checkpoint id.
    pub subject: String,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
}

impl TamperAlert {
    pub fn new(kind: TamperKind, subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            reason: reason.into(),
            raised_at: Utc::now(),
        }
    }
}

/// Destination for tamper alerts.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: &TamperAlert);
}

/// Logs alerts at ERROR level.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, alert: &TamperAlert) {
        error!(
            kind = alert.kind.as_str(),
            subject = %alert.subject,
            reason = %alert.reason,
            "TAMPER ALERT"
        );
    }
}

/// Keeps the most recent alerts in memory.
pub struct MemoryAlertSink {
    alerts: RwLock<VecDeque<TamperAlert>>,
    max_alerts: usize,
}

impl MemoryAlertSink {
    pub fn new(max_alerts: usize) -> Self {
        Self {
            alerts: RwLock::new(VecDeque::with_capacity(max_alerts)),
            max_alerts,
        }
    }

    pub fn alerts(&self) -> Vec<TamperAlert> {
        self.alerts.read().iter().cloned().collect()
    }
}

impl AlertSink for MemoryAlertSink {
    fn raise(&self, alert: &TamperAlert) {
        LogAlertSink.raise(alert);
        let mut alerts = self.alerts.write();
        if alerts.len() >= self.max_alerts {
            alerts.pop_front();
        }
        alerts.push_back(alert.clone());
    }
}
