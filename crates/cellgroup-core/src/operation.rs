//! Mutations that can be queued while offline.
//!
//! `Operation` is the typed payload of every queued write. Dispatch on it is
//! exhaustive, so adding a variant forces the remote client to handle it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AttendanceRecord, Event, EventPatch, Member, MemberPatch, PrayerRequest};

/// Entity class names. Cache keys for a class are prefixed with `<class>:`.
pub const MEMBERS: &str = "members";
pub const EVENTS: &str = "events";
pub const ATTENDANCE: &str = "attendance";
pub const PRAYER_REQUESTS: &str = "prayer_requests";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    CreateMember(Member),
    UpdateMember { id: String, patch: MemberPatch },
    DeleteMember { id: String },
    CreateEvent(Event),
    UpdateEvent { id: String, patch: EventPatch },
    DeleteEvent { id: String },
    SaveAttendance(AttendanceRecord),
    CreatePrayerRequest(PrayerRequest),
}

/// Payload-free discriminant of an `Operation`, for display and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum OperationKind {
    CreateMember,
    UpdateMember,
    DeleteMember,
    CreateEvent,
    UpdateEvent,
    DeleteEvent,
    SaveAttendance,
    CreatePrayerRequest,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OperationKind::CreateMember => "Add member",
            OperationKind::UpdateMember => "Edit member",
            OperationKind::DeleteMember => "Remove member",
            OperationKind::CreateEvent => "Add event",
            OperationKind::UpdateEvent => "Edit event",
            OperationKind::DeleteEvent => "Remove event",
            OperationKind::SaveAttendance => "Save attendance",
            OperationKind::CreatePrayerRequest => "Add prayer request",
        };
        write!(f, "{}", label)
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreateMember(_) => OperationKind::CreateMember,
            Operation::UpdateMember { .. } => OperationKind::UpdateMember,
            Operation::DeleteMember { .. } => OperationKind::DeleteMember,
            Operation::CreateEvent(_) => OperationKind::CreateEvent,
            Operation::UpdateEvent { .. } => OperationKind::UpdateEvent,
            Operation::DeleteEvent { .. } => OperationKind::DeleteEvent,
            Operation::SaveAttendance(_) => OperationKind::SaveAttendance,
            Operation::CreatePrayerRequest(_) => OperationKind::CreatePrayerRequest,
        }
    }

    /// The class of entity this operation touches. Used to invalidate
    /// cache entries after the operation is applied remotely.
    pub fn entity_class(&self) -> &'static str {
        match self {
            Operation::CreateMember(_)
            | Operation::UpdateMember { .. }
            | Operation::DeleteMember { .. } => MEMBERS,
            Operation::CreateEvent(_)
            | Operation::UpdateEvent { .. }
            | Operation::DeleteEvent { .. } => EVENTS,
            Operation::SaveAttendance(_) => ATTENDANCE,
            Operation::CreatePrayerRequest(_) => PRAYER_REQUESTS,
        }
    }

    /// Identity of the single entity this operation touches.
    ///
    /// Two operations with the same key must be applied in queue order.
    pub fn entity_key(&self) -> String {
        let id = match self {
            Operation::CreateMember(member) => member.id.as_str(),
            Operation::UpdateMember { id, .. } | Operation::DeleteMember { id } => id.as_str(),
            Operation::CreateEvent(event) => event.id.as_str(),
            Operation::UpdateEvent { id, .. } | Operation::DeleteEvent { id } => id.as_str(),
            // One attendance row per meeting date of an event
            Operation::SaveAttendance(record) => {
                return format!("{}/{}/{}", ATTENDANCE, record.event_id, record.date);
            }
            Operation::CreatePrayerRequest(request) => request.id.as_str(),
        };
        format!("{}/{}", self.entity_class(), id)
    }
}

/// Lifecycle of a queued entry. Entries that complete are deleted from the
/// queue rather than kept with a done marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: u64,
    pub operation: Operation,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub status: OperationStatus,
}

impl QueuedOperation {
    pub fn new(id: u64, operation: Operation) -> Self {
        Self {
            id,
            operation,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
            status: OperationStatus::Pending,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    pub fn is_pending(&self) -> bool {
        self.status == OperationStatus::Pending
    }

    pub fn is_failed(&self) -> bool {
        self.status == OperationStatus::Failed
    }
}
