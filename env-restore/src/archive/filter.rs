//! Calendar filters narrowing which backups of an archive are eligible.

use crate::utils::errors::{Error, Result};
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use std::str::FromStr;

/// Every field that is set must match the file's UTC timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeFilter {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub weekday: Option<Weekday>,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub second: Option<u32>,
}

impl TimeFilter {
    pub fn is_empty(&self) -> bool {
        *self == TimeFilter::default()
    }

    pub fn matches(&self, ts: &DateTime<Utc>) -> bool {
        fn check<T: PartialEq>(want: Option<T>, got: T) -> bool {
            want.map_or(true, |w| w == got)
        }

        check(self.year, ts.year())
            && check(self.month, ts.month())
            && check(self.day, ts.day())
            && check(self.weekday, ts.weekday())
            && check(self.hour, ts.hour())
            && check(self.minute, ts.minute())
            && check(self.second, ts.second())
    }
}

impl FromStr for TimeFilter {
    type Err = Error;

    /// Parse `key=value` pairs separated by commas, e.g. `weekday=sun,hour=3`.
    fn from_str(s: &str) -> Result<Self> {
        let mut filter = TimeFilter::default();

        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::validation(s, format!("expected key=value, got {pair:?}")))?;
            let value = value.trim();
            let number = |min: u32, max: u32| -> Result<u32> {
                value
                    .parse::<u32>()
                    .ok()
                    .filter(|v| (min..=max).contains(v))
                    .ok_or_else(|| Error::validation(s, format!("{key} out of range: {value:?}")))
            };

            match key.trim() {
                "year" => {
                    filter.year = Some(value.parse().map_err(|_| {
                        Error::validation(s, format!("invalid year {value:?}"))
                    })?)
                }
                "month" => filter.month = Some(number(1, 12)?),
                "day" => filter.day = Some(number(1, 31)?),
                "weekday" => {
                    filter.weekday = Some(Weekday::from_str(value).map_err(|_| {
                        Error::validation(s, format!("invalid weekday {value:?}"))
                    })?)
                }
                "hour" => filter.hour = Some(number(0, 23)?),
                "minute" => filter.minute = Some(number(0, 59)?),
                "second" => filter.second = Some(number(0, 59)?),
                other => {
                    return Err(Error::validation(
                        s,
                        format!(
                            "unknown filter key {other:?}, expected year, month, day, weekday, hour, minute or second"
                        ),
                    ))
                }
            }
        }

        Ok(filter)
    }
}
