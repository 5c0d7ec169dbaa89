//! Drives a collector on its configured schedule until cancelled.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{collector::Collector, config::Schedule, CollectorError, Result};

#[derive(Debug, Clone)]
pub enum Trigger {
    Interval(Duration),
    Cron(Box<cron::Schedule>),
}

impl TryFrom<&Schedule> for Trigger {
    type Error = CollectorError;

    fn try_from(schedule: &Schedule) -> Result<Self> {
        match (schedule.interval, schedule.cron.as_deref()) {
            (Some(interval), None) => Ok(Trigger::Interval(interval)),
            (None, Some(expr)) => parse_cron(expr).map(|s| Trigger::Cron(Box::new(s))),
            _ => Err(CollectorError::Config(
                "schedule needs exactly one of 'interval' or 'cron'".into(),
            )),
        }
    }
}

/// Accepts classic five-field expressions by pinning seconds to zero.
fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|err| CollectorError::Config(format!("schedule.cron {expr:?}: {err}")))
}

impl Trigger {
    /// Time until the next firing after `now`, `None` when the schedule is exhausted.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Trigger::Interval(interval) => Some(*interval),
            Trigger::Cron(schedule) => schedule
                .after(&now)
                .next()
                .map(|at| (at - now).to_std().unwrap_or_default()),
        }
    }
}

/// Invokes `collector` on every firing of `trigger` until `ctx` is cancelled.
///
/// Failed cycles are logged and the loop carries on.
pub async fn run(collector: Arc<Collector>, trigger: Trigger, ctx: CancellationToken) {
    info!(collector = collector.name(), ?trigger, "schedule started");
    match trigger {
        Trigger::Interval(period) => {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => fire(&collector, &ctx).await,
                }
            }
        }
        Trigger::Cron(_) => loop {
            let Some(delay) = trigger.next_delay(Utc::now()) else {
                warn!(collector = collector.name(), "cron schedule has no upcoming firings");
                break;
            };
            debug!(collector = collector.name(), delay = ?delay, "waiting for next firing");
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(delay) => fire(&collector, &ctx).await,
            }
        },
    }
    info!(collector = collector.name(), "schedule stopped");
}

async fn fire(collector: &Collector, ctx: &CancellationToken) {
    match collector.invoke(ctx).await {
        Ok(invocation) => info!(
            collector = collector.name(),
            invocation = %invocation.id,
            metrics = invocation.metrics.len(),
            elapsed_ms = invocation.elapsed.as_millis() as u64,
            "collection cycle finished"
        ),
        Err(CollectorError::Cancelled) => {
            debug!(collector = collector.name(), "collection cycle cancelled")
        }
        Err(err) => error!(collector = collector.name(), error = %err, "collection cycle failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cron(expr: &str) -> Schedule {
        Schedule {
            interval: None,
            cron: Some(expr.to_string()),
        }
    }

    #[test]
    fn five_field_cron_fires_on_the_minute() {
        let trigger = Trigger::try_from(&cron("*/15 * * * *")).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 30).unwrap();
        assert_eq!(trigger.next_delay(now), Some(Duration::from_secs(7 * 60 + 30)));
    }

    #[test]
    fn six_field_cron_is_taken_as_is() {
        let trigger = Trigger::try_from(&cron("30 0 * * * *")).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert_eq!(trigger.next_delay(now), Some(Duration::from_secs(30)));
    }

    #[test]
    fn malformed_cron_is_a_config_error() {
        let err = Trigger::try_from(&cron("61 * * * *")).unwrap_err();
        assert!(matches!(err, CollectorError::Config(ref m) if m.contains("schedule.cron")));
    }

    #[test]
    fn interval_delay_is_constant() {
        let trigger = Trigger::try_from(&Schedule {
            interval: Some(Duration::from_secs(60)),
            cron: None,
        })
        .unwrap();
        assert_eq!(trigger.next_delay(Utc::now()), Some(Duration::from_secs(60)));
    }
}
