use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::{CollectorError, Result};

/// Self-telemetry for the agent, kept in its own registry.
pub struct Telemetry {
    registry: Registry,
    invocations: IntCounterVec,
    metrics_emitted: IntCounterVec,
    sink_failures: IntCounterVec,
    cycle_duration: HistogramVec,
    running: IntGaugeVec,
}

/// How a cycle ended, used as the `outcome` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Cancelled,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Cancelled => "cancelled",
        }
    }

    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(CollectorError::Cancelled) => Outcome::Cancelled,
            Err(_) => Outcome::Failure,
        }
    }
}

impl Telemetry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("collector".into()), None)?;

        let invocations = IntCounterVec::new(
            Opts::new("invocations_total", "Collection cycles by outcome"),
            &["collector", "outcome"],
        )?;
        let metrics_emitted = IntCounterVec::new(
            Opts::new("metrics_emitted_total", "Metrics synthesized and handed to sinks"),
            &["collector"],
        )?;
        let sink_failures = IntCounterVec::new(
            Opts::new("sink_failures_total", "Batches a sink failed to take"),
            &["collector", "sink"],
        )?;
        let cycle_duration = HistogramVec::new(
            HistogramOpts::new("cycle_duration_seconds", "Wall time of one collection cycle")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 15.0, 60.0]),
            &["collector"],
        )?;
        let running = IntGaugeVec::new(
            Opts::new("running", "Whether a cycle is in progress (1) or not (0)"),
            &["collector"],
        )?;

        registry.register(Box::new(invocations.clone()))?;
        registry.register(Box::new(metrics_emitted.clone()))?;
        registry.register(Box::new(sink_failures.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(running.clone()))?;

        Ok(Self {
            registry,
            invocations,
            metrics_emitted,
            sink_failures,
            cycle_duration,
            running,
        })
    }

    pub fn set_running(&self, collector: &str, running: bool) {
        self.running
            .with_label_values(&[collector])
            .set(i64::from(running));
    }

    pub fn record_cycle(&self, collector: &str, outcome: Outcome, elapsed: Duration) {
        self.invocations
            .with_label_values(&[collector, outcome.as_str()])
            .inc();
        self.cycle_duration
            .with_label_values(&[collector])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_emitted(&self, collector: &str, count: usize) {
        self.metrics_emitted
            .with_label_values(&[collector])
            .inc_by(count as u64);
    }

    pub fn record_sink_failure(&self, collector: &str, sink: &str) {
        self.sink_failures.with_label_values(&[collector, sink]).inc();
    }

    /// Text exposition of every series.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| CollectorError::Internal(err.to_string()))
    }
}

impl From<prometheus::Error> for CollectorError {
    fn from(err: prometheus::Error) -> Self {
        CollectorError::Internal(format!("telemetry: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_recorded_series() {
        let telemetry = Telemetry::new().unwrap();
        telemetry.record_cycle("orders", Outcome::Success, Duration::from_millis(20));
        telemetry.record_cycle("orders", Outcome::Failure, Duration::from_millis(20));
        telemetry.record_emitted("orders", 3);
        telemetry.record_sink_failure("orders", "archive");

        let text = telemetry.encode().unwrap();
        assert!(text.contains(r#"collector_invocations_total{collector="orders",outcome="success"} 1"#));
        assert!(text.contains(r#"collector_invocations_total{collector="orders",outcome="failure"} 1"#));
        assert!(text.contains(r#"collector_metrics_emitted_total{collector="orders"} 3"#));
        assert!(text.contains(r#"collector_sink_failures_total{collector="orders",sink="archive"} 1"#));
        assert!(text.contains("collector_cycle_duration_seconds_count"));
    }

    #[test]
    fn outcome_follows_the_result() {
        assert_eq!(Outcome::of(&Ok::<_, CollectorError>(())), Outcome::Success);
        assert_eq!(Outcome::of::<()>(&Err(CollectorError::Cancelled)), Outcome::Cancelled);
        assert_eq!(
            Outcome::of::<()>(&Err(CollectorError::Query("boom".into()))),
            Outcome::Failure
        );
    }
}
