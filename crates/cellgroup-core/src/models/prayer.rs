use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrayerRequest {
    pub id: String,
    #[serde(rename = "cellId")]
    pub cell_id: String,
    #[serde(rename = "memberId")]
    pub member_id: Option<String>,
    pub content: String,
    #[serde(rename = "isPrivate", default)]
    pub is_private: bool,
}
