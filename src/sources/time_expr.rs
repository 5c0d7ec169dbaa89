//! Named instants that are resolved when a query runs, e.g. `$start_of_day`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, DurationRound, NaiveTime, TimeDelta, Utc};

use crate::CollectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeExpression {
    Now,
    StartOfHour,
    StartOfDay,
}

const SUPPORTED: &[(&str, TimeExpression)] = &[
    ("$now", TimeExpression::Now),
    ("$start_of_hour", TimeExpression::StartOfHour),
    ("$start_of_day", TimeExpression::StartOfDay),
];

impl TimeExpression {
    /// The instant this expression denotes at `now`, in UTC.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeExpression::Now => now,
            TimeExpression::StartOfHour => now.duration_trunc(TimeDelta::hours(1)).unwrap_or(now),
            TimeExpression::StartOfDay => now.date_naive().and_time(NaiveTime::MIN).and_utc(),
        }
    }
}

impl FromStr for TimeExpression {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        SUPPORTED
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, expr)| *expr)
            .ok_or_else(|| {
                let names: Vec<&str> = SUPPORTED.iter().map(|(name, _)| *name).collect();
                CollectorError::Config(format!(
                    "time expression {s:?} not supported, expected one of {}",
                    names.join(", ")
                ))
            })
    }
}

impl fmt::Display for TimeExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = SUPPORTED
            .iter()
            .find(|(_, expr)| expr == self)
            .map_or("?", |(name, _)| *name);
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn resolves_named_instants() {
        let now = at("2024-05-17T13:45:12.5Z");
        assert_eq!(TimeExpression::Now.resolve(now), now);
        assert_eq!(TimeExpression::StartOfHour.resolve(now), at("2024-05-17T13:00:00Z"));
        assert_eq!(TimeExpression::StartOfDay.resolve(now), at("2024-05-17T00:00:00Z"));
    }

    #[test]
    fn parses_and_prints_names() {
        for name in ["$now", "$start_of_hour", "$start_of_day"] {
            let expr: TimeExpression = name.parse().unwrap();
            assert_eq!(expr.to_string(), name);
        }
    }

    #[test]
    fn unknown_expression_lists_the_supported_ones() {
        let err = "$yesterday".parse::<TimeExpression>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("$yesterday"));
        assert!(msg.contains("$start_of_day"));
    }
}
