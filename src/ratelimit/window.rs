//! Fixed accounting windows for the QPM ceiling.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Requests-per-window ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QpmLimitRepr", into = "QpmLimitRepr")]
pub enum QpmLimit {
    Limited(u64),
    Unlimited,
}

impl QpmLimit {
    pub fn as_limit(&self) -> Option<u64> {
        match *self {
            QpmLimit::Limited(n) => Some(n),
            QpmLimit::Unlimited => None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, QpmLimit::Unlimited)
    }
}

impl fmt::Display for QpmLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QpmLimit::Limited(n) => write!(f, "{}", n),
            QpmLimit::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl From<u64> for QpmLimit {
    fn from(n: u64) -> Self {
        QpmLimit::Limited(n)
    }
}

/// Wire form: an integer or the string `"unlimited"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum QpmLimitRepr {
    Count(u64),
    Text(String),
}

impl TryFrom<QpmLimitRepr> for QpmLimit {
    type Error = String;

    fn try_from(repr: QpmLimitRepr) -> Result<Self, Self::Error> {
        match repr {
            QpmLimitRepr::Count(n) => Ok(QpmLimit::Limited(n)),
            QpmLimitRepr::Text(text) => {
                let text = text.trim();
                if text.eq_ignore_ascii_case("unlimited") {
                    Ok(QpmLimit::Unlimited)
                } else {
                    text.parse::<u64>().map(QpmLimit::Limited).map_err(|_| {
                        format!("qpm_limit must be an integer or 'unlimited', got '{}'", text)
                    })
                }
            }
        }
    }
}

impl From<QpmLimit> for QpmLimitRepr {
    fn from(limit: QpmLimit) -> Self {
        match limit {
            QpmLimit::Limited(n) => QpmLimitRepr::Count(n),
            QpmLimit::Unlimited => QpmLimitRepr::Text("unlimited".to_string()),
        }
    }
}

/// Calendar-aligned fixed windows: every process derives the same window id
/// from the wall clock, so they all count into the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    length: Duration,
}

/// The window a given instant falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSlot {
    /// `unix_millis / window_millis`
    pub id: i64,
    /// Time left until the next window opens.
    pub remaining: Duration,
}

impl FixedWindow {
    /// One-minute windows.
    pub const MINUTE: FixedWindow = FixedWindow {
        length: Duration::from_secs(60),
    };

    /// Windows shorter than one millisecond are rounded up to one.
    pub fn new(length: Duration) -> Self {
        Self {
            length: length.max(Duration::from_millis(1)),
        }
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    pub fn slot_at(&self, unix_millis: i64) -> WindowSlot {
        let len = self.length.as_millis() as i64;
        let id = unix_millis.div_euclid(len);
        let elapsed = unix_millis.rem_euclid(len);
        WindowSlot {
            id,
            remaining: Duration::from_millis((len - elapsed) as u64),
        }
    }

    pub fn current(&self) -> WindowSlot {
        self.slot_at(Utc::now().timestamp_millis())
    }

    /// Counters outlive their window by one length so late readers still see them.
    pub fn key_ttl(&self) -> Duration {
        self.length * 2
    }
}

impl Default for FixedWindow {
    fn default() -> Self {
        Self::MINUTE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_boundaries() {
        let window = FixedWindow::MINUTE;

        let start = window.slot_at(120_000);
        assert_eq!(start.id, 2);
        assert_eq!(start.remaining, Duration::from_secs(60));

        let late = window.slot_at(179_999);
        assert_eq!(late.id, 2);
        assert_eq!(late.remaining, Duration::from_millis(1));

        assert_eq!(window.slot_at(180_000).id, 3);
    }

    #[test]
    fn test_equal_windows_agree() {
        let a = FixedWindow::new(Duration::from_secs(60));
        let b = FixedWindow::MINUTE;
        assert_eq!(a.slot_at(1_704_067_230_000), b.slot_at(1_704_067_230_000));
    }

    #[test]
    fn test_key_ttl_covers_window() {
        assert_eq!(FixedWindow::MINUTE.key_ttl(), Duration::from_secs(120));
    }

    #[test]
    fn test_qpm_limit_parsing() {
        let limited: QpmLimit = serde_yaml::from_str("250").unwrap();
        assert_eq!(limited, QpmLimit::Limited(250));

        let unlimited: QpmLimit = serde_yaml::from_str("unlimited").unwrap();
        assert!(unlimited.is_unlimited());

        let quoted: QpmLimit = serde_yaml::from_str("'42'").unwrap();
        assert_eq!(quoted.as_limit(), Some(42));

        assert!(serde_yaml::from_str::<QpmLimit>("lots").is_err());
    }

    #[test]
    fn test_qpm_limit_serializes_back() {
        assert_eq!(serde_json::to_string(&QpmLimit::Limited(5)).unwrap(), "5");
        assert_eq!(
            serde_json::to_string(&QpmLimit::Unlimited).unwrap(),
            "\"unlimited\""
        );
    }
}
