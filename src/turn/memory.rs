//! Memory commands: facts, timezone and reminders
//!
//! [`capture`] is pure; [`apply`] writes what it found to the store.

use std::sync::LazyLock;

use chrono::{Duration, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::store::{FACTS, META, PersistenceStore, REMINDERS};

/// Store key holding the user's timezone
pub const TIMEZONE_KEY: &str = "timezone";

static NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:my\s+name\s+is|call\s+me)\s+([a-z][\w'\-]*)").expect("valid regex")
});

static FACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:remember|save|set)\s+(?:that\s+)?my\s+([a-z][a-z0-9 '\-]{0,40}?)\s+(?:is|are|=)\s+([^.;\n]{1,100})",
    )
    .expect("valid regex")
});

static TIMEZONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(?:my\s+)?time\s*zone\s+(?:is|=)|set\s+(?:my\s+)?time\s*zone\s+to)\s+([a-z/_\-]{2,40})",
    )
    .expect("valid regex")
});

static REMIND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bremind\s+me\s+to\s+(.+?)\s+((?:in|at|tomorrow)\b.*)$").expect("valid regex")
});

static IN_DELAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^in\s+(\d{1,3})\s*(minutes?|mins?|hours?|hrs?)\b").expect("valid regex")
});

static CLOCK_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(tomorrow\s+)?(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b").expect("valid regex")
});

/// A reminder to store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    /// What to do
    pub message: String,
    /// When, in the user's local time
    pub time: NaiveDateTime,
    /// Whether it has fired
    #[serde(default)]
    pub done: bool,
}

/// Everything found in one utterance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryCapture {
    /// `(human key, value)` pairs
    pub facts: Vec<(String, String)>,
    /// Timezone name, when one was recognized
    pub timezone: Option<String>,
    /// Reminders with resolved times
    pub reminders: Vec<Reminder>,
}

impl MemoryCapture {
    /// Whether nothing was captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty() && self.timezone.is_none() && self.reminders.is_empty()
    }
}

/// Canonical store key for a fact name ("Favorite Color" → `favorite_color`)
#[must_use]
pub fn fact_key(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

/// Resolve a spoken timezone to a zone name
#[must_use]
pub fn normalize_timezone(raw: &str) -> Option<String> {
    let key = raw.trim().to_lowercase();
    let mapped = match key.as_str() {
        "ist" | "indian" | "india" => "Asia/Kolkata",
        "pst" | "pdt" | "pacific" => "America/Los_Angeles",
        "est" | "edt" | "eastern" => "America/New_York",
        "cst" | "cdt" | "central" => "America/Chicago",
        "gmt" => "Etc/GMT",
        "utc" => "UTC",
        _ => {
            let is_zone = raw.split_once('/').is_some_and(|(area, city)| {
                !area.is_empty()
                    && !city.is_empty()
                    && raw
                        .chars()
                        .all(|c| c.is_ascii_alphabetic() || c == '/' || c == '_')
            });
            return is_zone.then(|| raw.trim().to_string());
        }
    };
    Some(mapped.to_string())
}

/// Resolve "in N minutes", "tomorrow at 9am", "at 5:30 pm" against `now`
#[must_use]
pub fn parse_when(phrase: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let phrase = phrase.trim();

    if let Some(caps) = IN_DELAY.captures(phrase) {
        let n: i64 = caps[1].parse().ok()?;
        let delay = if caps[2].to_lowercase().starts_with('h') {
            Duration::hours(n)
        } else {
            Duration::minutes(n)
        };
        return Some(now + delay);
    }

    let caps = CLOCK_TIME.captures(phrase)?;
    let tomorrow = caps.get(1).is_some();
    let meridiem = caps.get(4).map(|m| m.as_str().to_lowercase());
    // a bare number needs either "tomorrow" or am/pm to count as a time
    if !tomorrow && meridiem.is_none() && caps.get(3).is_none() {
        return None;
    }
    let mut hour: u32 = caps[2].parse().ok()?;
    let minute: u32 = caps.get(3).map_or(Some(0), |m| m.as_str().parse().ok())?;
    match meridiem.as_deref() {
        Some("pm") if hour < 12 => hour += 12,
        Some("am") if hour == 12 => hour = 0,
        _ => {}
    }
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let day = if tomorrow {
        now.date() + Duration::days(1)
    } else {
        now.date()
    };
    Some(day.and_time(time))
}

/// Find memory commands in `text`
#[must_use]
pub fn capture(text: &str, now: NaiveDateTime) -> MemoryCapture {
    let mut out = MemoryCapture::default();
    let text = text.trim();

    let mut push_fact = |key: &str, value: &str| {
        let key = key.trim_matches(|c: char| " .,'-".contains(c));
        let value = value.trim_matches(|c: char| " .,'-".contains(c));
        if key.is_empty() || value.is_empty() {
            return;
        }
        let canonical = fact_key(key);
        if canonical.contains("time_zone") || canonical == "timezone" {
            return;
        }
        if !out.facts.iter().any(|(k, _)| fact_key(k) == canonical) {
            out.facts.push((key.to_lowercase(), value.to_string()));
        }
    };

    if let Some(caps) = NAME.captures(text) {
        push_fact("name", &caps[1]);
    }
    for caps in FACT.captures_iter(text) {
        push_fact(&caps[1], &caps[2]);
    }

    out.timezone = TIMEZONE
        .captures(text)
        .and_then(|caps| normalize_timezone(&caps[1]));

    if let Some(caps) = REMIND.captures(text) {
        let message = caps[1].trim().to_string();
        match parse_when(&caps[2], now) {
            Some(time) if !message.is_empty() => out.reminders.push(Reminder {
                message,
                time,
                done: false,
            }),
            _ => tracing::debug!(phrase = &caps[2], "could not resolve reminder time"),
        }
    }

    out
}

/// Persist a capture and return human-readable acknowledgements
///
/// # Errors
///
/// Returns error if the store rejects a write
pub fn apply(store: &dyn PersistenceStore, captured: &MemoryCapture) -> Result<Vec<String>> {
    let mut acks = Vec::new();

    for (key, value) in &captured.facts {
        store.put(FACTS, &fact_key(key), value)?;
        acks.push(format!("{key} = {value}"));
    }
    if let Some(tz) = &captured.timezone {
        store.put(META, TIMEZONE_KEY, tz)?;
        acks.push(format!("timezone = {tz}"));
    }
    for reminder in &captured.reminders {
        store.append(REMINDERS, &serde_json::to_string(reminder)?)?;
        acks.push(format!(
            "reminder '{}' @ {}",
            reminder.message,
            reminder.time.format("%Y-%m-%d %H:%M")
        ));
    }

    if !acks.is_empty() {
        tracing::info!(count = acks.len(), "memory captured");
    }
    Ok(acks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use chrono::{NaiveDate, Timelike};

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_fact_capture() {
        let got = capture("Remember that my favorite color is blue.", noon());
        assert_eq!(got.facts, vec![("favorite color".to_string(), "blue".to_string())]);
        assert!(got.timezone.is_none());
    }

    #[test]
    fn test_name_capture_without_remember() {
        let got = capture("hi, my name is Asha", noon());
        assert_eq!(got.facts, vec![("name".to_string(), "Asha".to_string())]);
    }

    #[test]
    fn test_name_not_duplicated() {
        let got = capture("remember my name is Asha", noon());
        assert_eq!(got.facts.len(), 1);
    }

    #[test]
    fn test_timezone_capture() {
        let got = capture("my timezone is IST", noon());
        assert_eq!(got.timezone.as_deref(), Some("Asia/Kolkata"));
        assert!(got.facts.is_empty());

        let got = capture("set timezone to Europe/Berlin", noon());
        assert_eq!(got.timezone.as_deref(), Some("Europe/Berlin"));
    }

    #[test]
    fn test_unknown_timezone_ignored() {
        assert_eq!(normalize_timezone("martian"), None);
    }

    #[test]
    fn test_reminder_in_minutes() {
        let got = capture("remind me to stretch in 20 minutes", noon());
        assert_eq!(got.reminders.len(), 1);
        assert_eq!(got.reminders[0].message, "stretch");
        assert_eq!(got.reminders[0].time, noon() + Duration::minutes(20));
    }

    #[test]
    fn test_reminder_tomorrow_pm() {
        let got = capture("remind me to call mom tomorrow at 7:30 pm", noon());
        let expected = NaiveDate::from_ymd_opt(2026, 3, 15)
            .unwrap()
            .and_hms_opt(19, 30, 0)
            .unwrap();
        assert_eq!(got.reminders[0].time, expected);
    }

    #[test]
    fn test_parse_when_rejects_bare_number() {
        assert_eq!(parse_when("at 5", noon()), None);
        assert!(parse_when("at 12 am", noon()).is_some_and(|t| t.hour() == 0));
    }

    #[test]
    fn test_apply_writes_store() {
        let store = SqliteStore::open_in_memory().unwrap();
        let got = capture(
            "remember my favorite color is green. remind me to water plants in 2 hours",
            noon(),
        );
        let acks = apply(&store, &got).unwrap();
        assert_eq!(acks.len(), 2);
        assert_eq!(
            store.get(FACTS, "favorite_color").unwrap().as_deref(),
            Some("green")
        );
        let reminders = store.list(REMINDERS).unwrap();
        let stored: Reminder = serde_json::from_str(&reminders[0]).unwrap();
        assert_eq!(stored.message, "water plants");
    }
}
