//! Tracking records and participants
//!
//! Records are buffered on the instance and delivered to every participant
//! when the host flushes tracking. An instance with no participant does not
//! track at all.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

/// Lifecycle events of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceLifecycle {
    /// First run of a new instance
    Started,
    /// First run of a rehydrated instance
    Resumed,
    /// Aborted by the host or the runtime
    Aborted,
    /// Terminated by the host
    Terminated,
    /// Completed successfully
    Closed,
    /// Completed by cancellation
    Canceled,
    /// Completed with an unhandled fault
    Faulted,
    /// State was persisted
    Persisted,
}

impl fmt::Display for InstanceLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A tracking record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackingRecord {
    /// Instance lifecycle transition
    Instance {
        /// Instance the record belongs to
        instance_id: Uuid,
        /// Transition
        state: InstanceLifecycle,
        /// Abort, terminate or fault reason
        reason: Option<String>,
        /// When the transition happened
        timestamp: DateTime<Utc>,
    },
    /// Host-defined record
    Custom {
        /// Instance the record belongs to
        instance_id: Uuid,
        /// Record name
        name: String,
        /// Payload
        data: Value,
        /// When the record was created
        timestamp: DateTime<Utc>,
    },
}

impl TrackingRecord {
    /// Lifecycle record stamped now
    pub fn instance(instance_id: Uuid, state: InstanceLifecycle, reason: Option<String>) -> Self {
        TrackingRecord::Instance {
            instance_id,
            state,
            reason,
            timestamp: Utc::now(),
        }
    }

    /// Custom record stamped now
    pub fn custom(instance_id: Uuid, name: impl Into<String>, data: Value) -> Self {
        TrackingRecord::Custom {
            instance_id,
            name: name.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Instance the record belongs to
    pub fn instance_id(&self) -> Uuid {
        match self {
            TrackingRecord::Instance { instance_id, .. } | TrackingRecord::Custom { instance_id, .. } => *instance_id,
        }
    }

    /// Lifecycle transition, for instance records
    pub fn lifecycle(&self) -> Option<InstanceLifecycle> {
        match self {
            TrackingRecord::Instance { state, .. } => Some(*state),
            TrackingRecord::Custom { .. } => None,
        }
    }

    /// Reason attached to an instance record
    pub fn reason(&self) -> Option<&str> {
        match self {
            TrackingRecord::Instance { reason, .. } => reason.as_deref(),
            TrackingRecord::Custom { .. } => None,
        }
    }
}

/// Receives flushed tracking records
pub trait TrackingParticipant: Send + Sync {
    /// Deliver one record
    fn track(&self, record: &TrackingRecord);
}

/// Participant that keeps every record in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryTrackingParticipant {
    records: Arc<Mutex<Vec<TrackingRecord>>>,
}

impl MemoryTrackingParticipant {
    /// Empty participant
    pub fn new() -> Self {
        Self::default()
    }

    /// Records delivered so far
    pub fn records(&self) -> Vec<TrackingRecord> {
        self.records.lock().clone()
    }

    /// Lifecycle transitions delivered so far, in order
    pub fn lifecycle(&self) -> Vec<InstanceLifecycle> {
        self.records.lock().iter().filter_map(TrackingRecord::lifecycle).collect()
    }
}

impl TrackingParticipant for MemoryTrackingParticipant {
    fn track(&self, record: &TrackingRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Participant that writes every record to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTrackingParticipant;

impl TrackingParticipant for LogTrackingParticipant {
    fn track(&self, record: &TrackingRecord) {
        match record {
            TrackingRecord::Instance {
                instance_id,
                state,
                reason: Some(reason),
                ..
            } => info!("instance {} {}: {}", instance_id, state, reason),
            TrackingRecord::Instance { instance_id, state, .. } => info!("instance {} {}", instance_id, state),
            TrackingRecord::Custom { instance_id, name, data, .. } => {
                info!("instance {} custom record '{}': {}", instance_id, name, data)
            }
        }
    }
}

/// Buffers records until they are flushed to the participants
#[derive(Default)]
pub struct TrackingProvider {
    participants: Vec<Arc<dyn TrackingParticipant>>,
    pending: Mutex<Vec<TrackingRecord>>,
}

impl TrackingProvider {
    /// Provider with no participant (tracking disabled)
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a participant
    pub fn add_participant(&mut self, participant: Arc<dyn TrackingParticipant>) {
        self.participants.push(participant);
    }

    /// Whether any participant is attached
    pub fn is_enabled(&self) -> bool {
        !self.participants.is_empty()
    }

    /// Buffer a record; dropped when tracking is disabled
    pub fn add_record(&self, record: TrackingRecord) {
        if self.is_enabled() {
            self.pending.lock().push(record);
        }
    }

    /// Number of buffered records
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Deliver buffered records to every participant, returning how many
    pub fn flush(&self) -> usize {
        let records = std::mem::take(&mut *self.pending.lock());
        for record in &records {
            for participant in &self.participants {
                participant.track(record);
            }
        }
        records.len()
    }
}

impl fmt::Debug for TrackingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingProvider")
            .field("participants", &self.participants.len())
            .field("pending", &self.pending())
            .finish()
    }
}
