use chrono::DateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "cellId")]
    pub cell_id: String,
    pub title: String,
    pub description: Option<String>,
    #[serde(rename = "startsAt")]
    pub starts_at: Option<String>,
    #[serde(rename = "endsAt")]
    pub ends_at: Option<String>,
    pub location: Option<String>,
}

impl Event {
    pub fn formatted_date(&self) -> String {
        match &self.starts_at {
            Some(date) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(date) {
                    dt.format("%b %d, %Y").to_string()
                } else {
                    date.chars().take(10).collect()
                }
            }
            None => "TBD".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "startsAt", skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<String>,
    #[serde(rename = "endsAt", skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(starts_at: Option<&str>) -> Event {
        Event {
            id: "e1".to_string(),
            cell_id: "c1".to_string(),
            title: "Friday fellowship".to_string(),
            description: None,
            starts_at: starts_at.map(str::to_string),
            ends_at: None,
            location: None,
        }
    }

    #[test]
    fn test_formatted_date() {
        assert_eq!(event(Some("2026-03-06T19:00:00Z")).formatted_date(), "Mar 06, 2026");
        assert_eq!(event(Some("2026-03-06 19:00")).formatted_date(), "2026-03-06");
        assert_eq!(event(None).formatted_date(), "TBD");
    }
}
