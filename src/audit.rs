//! Audit trail for match attempts and outcomes.
//!
//! Recording is fire-and-forget: an [`AuditSink`] must never block or fail
//! the matching path. Failures to record are logged locally and dropped.

use std::fmt;
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use crate::error::DispatchError;

/// Log target used by [`LogAuditWriter`].
pub const AUDIT_TARGET: &str = "audit";

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditRecord {
    MatchAttempt {
        rider_id: String,
        session_id: String,
        lat: f64,
        lng: f64,
    },
    MatchOutcome {
        rider_id: String,
        driver_id: Option<String>,
        session_id: String,
        distance_km: f64,
        success: bool,
    },
    Error {
        action: String,
        rider_id: String,
        session_id: String,
        message: String,
    },
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditRecord::MatchAttempt { rider_id, session_id, lat, lng } => write!(
                f,
                "MATCH_REQUEST rider_id={} session_id={} lat={:.6} lng={:.6}",
                rider_id, session_id, lat, lng
            ),
            AuditRecord::MatchOutcome { rider_id, driver_id, session_id, distance_km, success } => write!(
                f,
                "MATCH_RESULT rider_id={} driver_id={} session_id={} distance_km={:.3} success={}",
                rider_id,
                driver_id.as_deref().unwrap_or(""),
                session_id,
                distance_km,
                success
            ),
            AuditRecord::Error { action, rider_id, session_id, message } => write!(
                f,
                "ERROR action={} rider_id={} session_id={} error={}",
                action, rider_id, session_id, message
            ),
        }
    }
}

/// A stamped audit record.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    pub record: AuditRecord,
}

impl AuditEvent {
    pub fn new(record: AuditRecord) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            timestamp: (now.unix_timestamp_nanos() / 1_000_000) as i64,
            record,
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} event_id={} timestamp={}", self.record, self.id, self.timestamp)
    }
}

/// Narrow contract the matching engine reports through.
///
/// Implementations must return promptly and swallow their own failures.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);

    fn record_match_attempt(&self, rider_id: &str, session_id: &str, lat: f64, lng: f64) {
        self.record(AuditRecord::MatchAttempt {
            rider_id: rider_id.to_string(),
            session_id: session_id.to_string(),
            lat,
            lng,
        });
    }

    fn record_match_outcome(
        &self,
        rider_id: &str,
        driver_id: Option<&str>,
        session_id: &str,
        distance_km: f64,
        success: bool,
    ) {
        self.record(AuditRecord::MatchOutcome {
            rider_id: rider_id.to_string(),
            driver_id: driver_id.map(str::to_string),
            session_id: session_id.to_string(),
            distance_km,
            success,
        });
    }

    fn record_error(&self, action: &str, rider_id: &str, session_id: &str, message: &str) {
        self.record(AuditRecord::Error {
            action: action.to_string(),
            rider_id: rider_id.to_string(),
            session_id: session_id.to_string(),
            message: message.to_string(),
        });
    }
}

/// Durable destination for audit events, driven from a background task.
#[async_trait]
pub trait AuditWriter: Send + Sync + 'static {
    async fn write(&self, event: &AuditEvent) -> Result<(), DispatchError>;
}

/// Writes audit events to the [`AUDIT_TARGET`] log target.
#[derive(Debug, Default, Clone)]
pub struct LogAuditWriter;

#[async_trait]
impl AuditWriter for LogAuditWriter {
    async fn write(&self, event: &AuditEvent) -> Result<(), DispatchError> {
        log::info!(target: AUDIT_TARGET, "{}", event);
        Ok(())
    }
}

/// Hands events to a bounded channel drained by a background writer task.
///
/// `record` never waits: when the channel is full or the writer has gone
/// away, the event is dropped with a warning.
#[derive(Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Spawns the writer task. Must be called from within a tokio runtime.
    pub fn spawn<W: AuditWriter>(buffer: usize, writer: W) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(buffer.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = writer.write(&event).await {
                    log::warn!("Failed to write audit event {}: {}", event.id, e);
                }
            }
            log::debug!("Audit writer stopped");
        });
        (Self { tx }, handle)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, record: AuditRecord) {
        let event = AuditEvent::new(record);
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    log::warn!("Audit channel full, dropping event: {}", event);
                }
                mpsc::error::TrySendError::Closed(event) => {
                    log::warn!("Audit writer gone, dropping event: {}", event);
                }
            }
        }
    }
}

/// Keeps every event in memory. Useful in tests and local tooling.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.events.lock().iter().map(|e| e.record.clone()).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.events.lock().push(AuditEvent::new(record));
    }
}
