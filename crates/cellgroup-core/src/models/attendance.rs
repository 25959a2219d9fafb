use serde::{Deserialize, Serialize};

/// Attendance for one meeting of an event. Saved as an upsert keyed by
/// event and date, so replaying the same record twice leaves one row on the
/// server while each date of a recurring event keeps its own row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    #[serde(rename = "eventId")]
    pub event_id: String,
    #[serde(rename = "cellId")]
    pub cell_id: String,
    pub date: String,
    #[serde(rename = "presentMemberIds", default)]
    pub present_member_ids: Vec<String>,
    #[serde(rename = "visitorCount", default)]
    pub visitor_count: u32,
    pub notes: Option<String>,
}

impl AttendanceRecord {
    pub fn headcount(&self) -> usize {
        self.present_member_ids.len() + self.visitor_count as usize
    }
}
