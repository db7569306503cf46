//! Restricted cron subset: `@hourly`, `@daily` and `*/N * * * *`.

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::TradeflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronSchedule {
    Hourly,
    Daily,
    /// Every N minutes, aligned to minute 0 of each hour
    EveryMinutes(u32),
}

impl CronSchedule {
    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let minute = after
            - Duration::seconds(after.second() as i64)
            - Duration::nanoseconds(after.nanosecond() as i64);
        match self {
            CronSchedule::Hourly => {
                minute - Duration::minutes(minute.minute() as i64) + Duration::hours(1)
            }
            CronSchedule::Daily => {
                let midnight = after
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .map(|naive| Utc.from_utc_datetime(&naive))
                    .unwrap_or(minute);
                midnight + Duration::days(1)
            }
            CronSchedule::EveryMinutes(step) => {
                let mut next = minute + Duration::minutes(1);
                while next.minute() % step != 0 {
                    next += Duration::minutes(1);
                }
                next
            }
        }
    }
}

impl FromStr for CronSchedule {
    type Err = TradeflowError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let expr = expr.trim();
        match expr {
            "@hourly" => return Ok(CronSchedule::Hourly),
            "@daily" => return Ok(CronSchedule::Daily),
            _ => {}
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if let [minutes, "*", "*", "*", "*"] = fields.as_slice() {
            if let Some(step) = minutes.strip_prefix("*/") {
                if let Ok(step) = step.parse::<u32>() {
                    if (1..=59).contains(&step) {
                        return Ok(CronSchedule::EveryMinutes(step));
                    }
                }
            }
        }
        Err(TradeflowError::Cron(expr.to_string()))
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CronSchedule::Hourly => write!(f, "@hourly"),
            CronSchedule::Daily => write!(f, "@daily"),
            CronSchedule::EveryMinutes(n) => write!(f, "*/{} * * * *", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, s).unwrap()
    }

    #[test]
    fn test_parse_supported_subset() {
        assert_eq!("@hourly".parse::<CronSchedule>().unwrap(), CronSchedule::Hourly);
        assert_eq!("@daily".parse::<CronSchedule>().unwrap(), CronSchedule::Daily);
        assert_eq!("*/5 * * * *".parse::<CronSchedule>().unwrap(), CronSchedule::EveryMinutes(5));

        for bad in ["* * * * *", "0 * * * *", "*/0 * * * *", "*/60 * * * *", "*/5 1 * * *", "@weekly", ""] {
            assert!(bad.parse::<CronSchedule>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_next_after() {
        assert_eq!(CronSchedule::EveryMinutes(5).next_after(at(10, 2, 30)), at(10, 5, 0));
        assert_eq!(CronSchedule::EveryMinutes(5).next_after(at(10, 5, 0)), at(10, 10, 0));
        assert_eq!(CronSchedule::EveryMinutes(7).next_after(at(10, 57, 0)), at(11, 0, 0));
        assert_eq!(CronSchedule::Hourly.next_after(at(10, 0, 0)), at(11, 0, 0));
        assert_eq!(CronSchedule::Hourly.next_after(at(10, 59, 59)), at(11, 0, 0));
        assert_eq!(
            CronSchedule::Daily.next_after(at(23, 59, 0)),
            Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_display_round_trip() {
        for schedule in [CronSchedule::Hourly, CronSchedule::Daily, CronSchedule::EveryMinutes(15)] {
            assert_eq!(schedule.to_string().parse::<CronSchedule>().unwrap(), schedule);
        }
    }
}
