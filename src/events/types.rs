use crate::error::UploadError;
use crate::upload::{Priority, QueueStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sequence number for ordering events
pub type EventSequence = u64;

/// Event names listeners can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "session:created")]
    SessionCreated,
    #[serde(rename = "session:progress")]
    SessionProgress,
    #[serde(rename = "session:paused")]
    SessionPaused,
    #[serde(rename = "session:resumed")]
    SessionResumed,
    #[serde(rename = "session:completed")]
    SessionCompleted,
    #[serde(rename = "session:failed")]
    SessionFailed,
    #[serde(rename = "session:cancelled")]
    SessionCancelled,
    #[serde(rename = "chunk:upload:start")]
    ChunkUploadStart,
    #[serde(rename = "chunk:upload:complete")]
    ChunkUploadComplete,
    #[serde(rename = "chunk:upload:failed")]
    ChunkUploadFailed,
    #[serde(rename = "chunk:upload:retry")]
    ChunkUploadRetry,
    #[serde(rename = "queue:added")]
    QueueAdded,
    #[serde(rename = "queue:started")]
    QueueStarted,
    #[serde(rename = "queue:stats")]
    QueueStats,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionCreated => "session:created",
            EventKind::SessionProgress => "session:progress",
            EventKind::SessionPaused => "session:paused",
            EventKind::SessionResumed => "session:resumed",
            EventKind::SessionCompleted => "session:completed",
            EventKind::SessionFailed => "session:failed",
            EventKind::SessionCancelled => "session:cancelled",
            EventKind::ChunkUploadStart => "chunk:upload:start",
            EventKind::ChunkUploadComplete => "chunk:upload:complete",
            EventKind::ChunkUploadFailed => "chunk:upload:failed",
            EventKind::ChunkUploadRetry => "chunk:upload:retry",
            EventKind::QueueAdded => "queue:added",
            EventKind::QueueStarted => "queue:started",
            EventKind::QueueStats => "queue:stats",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEvent {
    pub sequence: EventSequence,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionCreated {
        session_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },
    SessionProgress {
        session_id: String,
        uploaded_chunks: u32,
        total_chunks: u32,
        uploaded_bytes: u64,
        total_bytes: u64,
        percent: f64,
    },
    SessionPaused {
        session_id: String,
    },
    SessionResumed {
        session_id: String,
        remaining_chunks: u32,
    },
    SessionCompleted {
        session_id: String,
        url: String,
        key: String,
    },
    SessionFailed {
        session_id: String,
        error: UploadError,
    },
    SessionCancelled {
        session_id: String,
        reason: Option<String>,
    },
    ChunkUploadStart {
        session_id: String,
        chunk_index: u32,
        attempt: u32,
    },
    ChunkUploadComplete {
        session_id: String,
        chunk_index: u32,
        etag: String,
    },
    ChunkUploadFailed {
        session_id: String,
        chunk_index: u32,
        error: UploadError,
    },
    ChunkUploadRetry {
        session_id: String,
        chunk_index: u32,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    QueueAdded {
        ticket_id: String,
        file_name: String,
        priority: Priority,
        position: usize,
    },
    QueueStarted {
        ticket_id: String,
        file_name: String,
    },
    QueueStats {
        stats: QueueStats,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::SessionCreated { .. } => EventKind::SessionCreated,
            EventPayload::SessionProgress { .. } => EventKind::SessionProgress,
            EventPayload::SessionPaused { .. } => EventKind::SessionPaused,
            EventPayload::SessionResumed { .. } => EventKind::SessionResumed,
            EventPayload::SessionCompleted { .. } => EventKind::SessionCompleted,
            EventPayload::SessionFailed { .. } => EventKind::SessionFailed,
            EventPayload::SessionCancelled { .. } => EventKind::SessionCancelled,
            EventPayload::ChunkUploadStart { .. } => EventKind::ChunkUploadStart,
            EventPayload::ChunkUploadComplete { .. } => EventKind::ChunkUploadComplete,
            EventPayload::ChunkUploadFailed { .. } => EventKind::ChunkUploadFailed,
            EventPayload::ChunkUploadRetry { .. } => EventKind::ChunkUploadRetry,
            EventPayload::QueueAdded { .. } => EventKind::QueueAdded,
            EventPayload::QueueStarted { .. } => EventKind::QueueStarted,
            EventPayload::QueueStats { .. } => EventKind::QueueStats,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            EventPayload::SessionCreated { session_id, .. }
            | EventPayload::SessionProgress { session_id, .. }
            | EventPayload::SessionPaused { session_id }
            | EventPayload::SessionResumed { session_id, .. }
            | EventPayload::SessionCompleted { session_id, .. }
            | EventPayload::SessionFailed { session_id, .. }
            | EventPayload::SessionCancelled { session_id, .. }
            | EventPayload::ChunkUploadStart { session_id, .. }
            | EventPayload::ChunkUploadComplete { session_id, .. }
            | EventPayload::ChunkUploadFailed { session_id, .. }
            | EventPayload::ChunkUploadRetry { session_id, .. } => Some(session_id),
            EventPayload::QueueAdded { .. }
            | EventPayload::QueueStarted { .. }
            | EventPayload::QueueStats { .. } => None,
        }
    }
}

impl UploadEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.payload.session_id()
    }
}
