use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer};


/// When runs happen after the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub(crate) enum Schedule {
    /// One run, then exit.
    #[default]
    Immediate,
    /// Another run this many hours after the previous one finished.
    Every {
        hours: u32
    },
    /// A run every day at a local wall-clock time written `HH:MM`.
    Daily {
        #[serde(deserialize_with = "hour_minute")]
        at: NaiveTime
    }
}


impl Schedule {
    /// How long to wait after a run that finished at `now`, or `None` to stop.
    pub(crate) fn next_delay(&self, now: NaiveDateTime) -> Option<Duration> {
        match *self {
            Schedule::Immediate => None,
            Schedule::Every { hours } => Some(Duration::from_secs(u64::from(hours) * 3600)),
            Schedule::Daily { at } => {
                let today = now.date().and_time(at);
                let next = if today > now {
                    today
                } else {
                    today + chrono::Duration::days(1)
                };
                (next - now).to_std().ok()
            }
        }
    }
}


fn hour_minute<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
    let text = String::deserialize(deserializer)?;
    NaiveTime::parse_from_str(text.trim(), "%H:%M")
        .map_err(|e| serde::de::Error::custom(format!("expected HH:MM, got {text:?}: {e}")))
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[derive(Deserialize)]
    struct Wrapper {
        schedule: Schedule
    }

    #[test]
    fn immediate_runs_once() {
        assert_eq!(Schedule::Immediate.next_delay(at(9, 0)), None);
    }

    #[test]
    fn every_waits_the_interval() {
        assert_eq!(Schedule::Every { hours: 6 }.next_delay(at(9, 0)), Some(Duration::from_secs(6 * 3600)));
    }

    #[test]
    fn daily_waits_for_today_or_tomorrow() {
        let daily = Schedule::Daily { at: NaiveTime::from_hms_opt(9, 30, 0).unwrap() };
        assert_eq!(daily.next_delay(at(8, 0)), Some(Duration::from_secs(90 * 60)));
        assert_eq!(daily.next_delay(at(9, 30)), Some(Duration::from_secs(24 * 3600)));
        assert_eq!(daily.next_delay(at(10, 30)), Some(Duration::from_secs(23 * 3600)));
    }

    #[test]
    fn parses_from_toml() {
        let parsed: Wrapper = toml::from_str("[schedule]\nkind = \"daily\"\nat = \"07:15\"").unwrap();
        assert_eq!(parsed.schedule, Schedule::Daily { at: NaiveTime::from_hms_opt(7, 15, 0).unwrap() });

        let parsed: Wrapper = toml::from_str("[schedule]\nkind = \"every\"\nhours = 4").unwrap();
        assert_eq!(parsed.schedule, Schedule::Every { hours: 4 });

        assert!(toml::from_str::<Wrapper>("[schedule]\nkind = \"daily\"\nat = \"25:00\"").is_err());
    }
}
