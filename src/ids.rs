//! Canonical identifier encoding and Slack timestamp parsing.
//!
//! These helpers are bit-exact: every component that derives a portal,
//! ghost, or message id must go through them rather than re-deriving the
//! format inline.

use serde::{Deserialize, Serialize};

/// `lowercase(teamID + "-" + userID)`
pub fn make_user_id(team_id: &str, user_id: &str) -> String {
    format!("{team_id}-{user_id}").to_lowercase()
}

/// `teamID + "-" + channelID + "-" + slackTimestamp`
pub fn make_message_id(team_id: &str, channel_id: &str, slack_ts: &str) -> String {
    format!("{team_id}-{channel_id}-{slack_ts}")
}

/// `teamID` if `channel_id` is empty, else `teamID + "-" + channelID`.
pub fn make_portal_id(team_id: &str, channel_id: &str) -> String {
    if channel_id.is_empty() {
        team_id.to_string()
    } else {
        format!("{team_id}-{channel_id}")
    }
}

/// Splits a portal id back into (team_id, channel_id), tolerating the
/// team-portal two-segment-less form (channel_id empty).
pub fn split_portal_id(portal_id: &str) -> (String, String) {
    match portal_id.split_once('-') {
        Some((team, rest)) if looks_like_team_id(team) => (team.to_string(), rest.to_string()),
        _ => (portal_id.to_string(), String::new()),
    }
}

fn looks_like_team_id(s: &str) -> bool {
    s.starts_with('T') && s.len() >= 2
}

/// A Slack-style Unix timestamp, split into seconds and nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlackTimestamp {
    pub unix_seconds: i64,
    pub nanos: u32,
}

impl SlackTimestamp {
    /// Parses `"<seconds>.<fraction>"`. The fraction is right-padded with
    /// zeros (or truncated) to exactly six digits before being scaled to
    /// nanoseconds (microseconds * 1000).
    pub fn parse(raw: &str) -> Option<Self> {
        let (secs_part, frac_part) = raw.split_once('.').unwrap_or((raw, ""));
        let unix_seconds: i64 = secs_part.parse().ok()?;
        let mut frac = frac_part.to_string();
        if frac.len() > 6 {
            frac.truncate(6);
        } else {
            while frac.len() < 6 {
                frac.push('0');
            }
        }
        let micros: u32 = frac.parse().ok()?;
        Some(Self {
            unix_seconds,
            nanos: micros * 1000,
        })
    }

    pub fn to_slack_string(self, original_frac_digits: usize) -> String {
        let micros = self.nanos / 1000;
        format!(
            "{}.{:0width$}",
            self.unix_seconds,
            micros,
            width = original_frac_digits.clamp(1, 6)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_is_lowercased() {
        assert_eq!(make_user_id("T1", "U0002"), "t1-u0002");
    }

    #[test]
    fn message_id_joins_three_segments() {
        assert_eq!(
            make_message_id("T1", "C0001", "100.000005"),
            "T1-C0001-100.000005"
        );
    }

    #[test]
    fn portal_id_drops_empty_channel() {
        assert_eq!(make_portal_id("T1", ""), "T1");
        assert_eq!(make_portal_id("T1", "C0001"), "T1-C0001");
    }

    #[test]
    fn split_portal_id_roundtrips() {
        assert_eq!(
            split_portal_id("T1-C0001"),
            ("T1".to_string(), "C0001".to_string())
        );
        assert_eq!(split_portal_id("T1"), ("T1".to_string(), String::new()));
    }

    #[test]
    fn parses_exact_six_digit_fraction() {
        let ts = SlackTimestamp::parse("1234567890.123450").unwrap();
        assert_eq!(ts.unix_seconds, 1234567890);
        assert_eq!(ts.nanos, 123_450_000);
    }

    #[test]
    fn pads_short_fraction() {
        let ts = SlackTimestamp::parse("1234567890.12345").unwrap();
        assert_eq!(ts.nanos, 123_450_000);
    }

    #[test]
    fn truncates_long_fraction() {
        let ts = SlackTimestamp::parse("1234567890.1234567").unwrap();
        assert_eq!(ts.nanos, 123_456_700);
    }

    #[test]
    fn handles_missing_fraction() {
        let ts = SlackTimestamp::parse("1234567890").unwrap();
        assert_eq!(ts.unix_seconds, 1234567890);
        assert_eq!(ts.nanos, 0);
    }

    #[test]
    fn rejects_garbage() {
        assert!(SlackTimestamp::parse("not-a-timestamp").is_none());
    }
}
