//! Data models for cell group entities.
//!
//! These are the payload shapes carried by queued operations and returned
//! by the remote store:
//!
//! - `Member`, `MemberPatch`: cell group membership and contact info
//! - `Event`, `EventPatch`: meetings and gatherings
//! - `AttendanceRecord`: who was present at an event
//! - `PrayerRequest`: requests shared with the group

pub mod attendance;
pub mod event;
pub mod member;
pub mod prayer;

pub use attendance::AttendanceRecord;
pub use event::{Event, EventPatch};
pub use member::{Member, MemberPatch, MemberRole};
pub use prayer::PrayerRequest;
