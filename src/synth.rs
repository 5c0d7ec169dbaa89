//! Turns result rows into typed metrics.
//!
//! Every row must carry a numeric `value` column. An optional `ts` column
//! supplies the observation time; rows without one are stamped with the
//! collection time. A single bad row rejects the whole batch so that a cycle
//! never emits metrics computed over a partial result.

use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use crate::{
    config::MetricConfig,
    models::{Metric, Value},
    record::Row,
    CollectorError, Result,
};

/// Column holding the metric value.
pub const VALUE_COLUMN: &str = "value";
/// Column holding the observation time.
pub const TIMESTAMP_COLUMN: &str = "ts";

pub fn synthesize(
    rows: &[Row],
    metric: &MetricConfig,
    collected_at: DateTime<Utc>,
) -> Result<Vec<Metric>> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            to_metric(row, metric, collected_at).map_err(|err| match err {
                CollectorError::Decode(msg) => CollectorError::Decode(format!("row {i}: {msg}")),
                other => other,
            })
        })
        .collect()
}

fn to_metric(row: &Row, metric: &MetricConfig, collected_at: DateTime<Utc>) -> Result<Metric> {
    let value = parse_value(row.get(VALUE_COLUMN))?;
    let observed = parse_timestamp(row.get(TIMESTAMP_COLUMN))?.unwrap_or(collected_at);
    let timestamp = match metric.grain {
        Some(grain) => truncate(observed, grain)?,
        None => observed,
    };

    Ok(Metric {
        name: metric.name.clone(),
        metric_type: metric.metric_type,
        value,
        tags: metric.tags.clone(),
        timestamp,
        grain: metric.grain,
    })
}

fn parse_value(value: Option<&Value>) -> Result<f64> {
    let parsed = match value {
        None => {
            return Err(CollectorError::Decode(format!(
                "missing '{VALUE_COLUMN}' column"
            )))
        }
        Some(Value::Int(i)) => *i as f64,
        Some(Value::Float(f)) => *f,
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        Some(Value::Text(s)) => s.trim().parse::<f64>().map_err(|err| {
            CollectorError::Decode(format!("'{VALUE_COLUMN}' {s:?} is not a number: {err}"))
        })?,
        Some(other @ (Value::Null | Value::Timestamp(_))) => {
            return Err(CollectorError::Decode(format!(
                "'{VALUE_COLUMN}' {other} is not a number"
            )))
        }
    };

    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(CollectorError::Decode(format!("'{VALUE_COLUMN}' {parsed} is not finite")))
    }
}

fn parse_timestamp(value: Option<&Value>) -> Result<Option<DateTime<Utc>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Timestamp(ts)) => Ok(Some(*ts)),
        Some(Value::Int(secs)) => DateTime::from_timestamp(*secs, 0)
            .map(Some)
            .ok_or_else(|| CollectorError::Decode(format!("'{TIMESTAMP_COLUMN}' {secs} is out of range"))),
        Some(Value::Text(s)) => DateTime::parse_from_rfc3339(s.trim())
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|err| {
                CollectorError::Decode(format!("'{TIMESTAMP_COLUMN}' {s:?} is not RFC 3339: {err}"))
            }),
        Some(other) => Err(CollectorError::Decode(format!(
            "'{TIMESTAMP_COLUMN}' {other} is not a timestamp"
        ))),
    }
}

/// Floors `ts` to the start of its grain-sized bucket, counted from the Unix epoch.
pub fn truncate(ts: DateTime<Utc>, grain: Duration) -> Result<DateTime<Utc>> {
    let delta = TimeDelta::from_std(grain)
        .map_err(|err| CollectorError::Config(format!("grain {grain:?}: {err}")))?;
    ts.duration_trunc(delta)
        .map_err(|err| CollectorError::Decode(format!("cannot truncate {ts} to {grain:?}: {err}")))
}
