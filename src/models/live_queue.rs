use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATUS_QUEUED: &str = "🕐 Queued";
pub const STATUS_PROCESSING: &str = "⚙️ Processing...";

/// Terminal icon for a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeIcon {
    Green,
    Orange,
    Red,
}

impl OutcomeIcon {
    /// Green when archive and export both succeeded, orange when one did.
    pub fn from_results(archive: bool, export: bool) -> Self {
        match (archive, export) {
            (true, true) => Self::Green,
            (true, false) | (false, true) => Self::Orange,
            (false, false) => Self::Red,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Green => "🟢",
            Self::Orange => "🟠",
            Self::Red => "🔴",
        }
    }

    pub fn colour(self) -> u32 {
        match self {
            Self::Green => 0x2ECC71,
            Self::Orange => 0xE67E22,
            Self::Red => 0xE74C3C,
        }
    }
}

/// One row of the live queue status display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveQueueEntry {
    pub filename: String,
    pub user: String,
    pub channel: String,
    /// ISO8601 UTC
    pub uploaded: String,
    pub status: String,
}

impl LiveQueueEntry {
    pub fn queued(filename: &str, user: &str, channel: &str, uploaded: DateTime<Utc>) -> Self {
        Self {
            filename: filename.to_string(),
            user: user.to_string(),
            channel: channel.to_string(),
            uploaded: uploaded.to_rfc3339(),
            status: STATUS_QUEUED.to_string(),
        }
    }

    pub fn is_finished(&self) -> bool {
        [OutcomeIcon::Green, OutcomeIcon::Orange, OutcomeIcon::Red]
            .iter()
            .any(|icon| self.status.starts_with(icon.as_str()))
    }

    pub fn uploaded_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.uploaded)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

pub fn finished_status(icon: OutcomeIcon, at: DateTime<Utc>) -> String {
    format!("{} {}", icon.as_str(), at.format("%Y-%m-%d %H:%M UTC"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_icon_selection() {
        assert_eq!(OutcomeIcon::from_results(true, true), OutcomeIcon::Green);
        assert_eq!(OutcomeIcon::from_results(false, true), OutcomeIcon::Orange);
        assert_eq!(OutcomeIcon::from_results(false, false), OutcomeIcon::Red);
    }

    #[test]
    fn test_finished_status_format() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 5, 0).unwrap();
        let status = finished_status(OutcomeIcon::Orange, at);
        assert_eq!(status, "🟠 2025-03-01 09:05 UTC");

        let mut entry = LiveQueueEntry::queued("stats.xlsx", "bob", "uploads", at);
        assert!(!entry.is_finished());
        entry.status = status;
        assert!(entry.is_finished());
        assert_eq!(entry.uploaded_at(), Some(at));
    }
}
