//! One config's collection cycle: extract, synthesize, deliver.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use slog::{debug, info, o, warn, Logger};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::Config,
    models::Metric,
    synth,
    telemetry::{Outcome, Telemetry},
    CollectorError, Result, SinkFailure,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    Running,
}

/// Summary of a successful cycle.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub id: Uuid,
    pub metrics: Vec<Metric>,
    /// Sinks that took the batch, in name order.
    pub delivered: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

pub struct Collector {
    config: Config,
    state: RwLock<CollectorState>,
    cycle: Mutex<()>,
    telemetry: Option<Arc<Telemetry>>,
    logger: Logger,
}

/// Puts the collector back to idle however the cycle ends.
struct RunningGuard<'a> {
    collector: &'a Collector,
}

impl<'a> RunningGuard<'a> {
    fn enter(collector: &'a Collector) -> Self {
        *collector.state.write() = CollectorState::Running;
        if let Some(telemetry) = &collector.telemetry {
            telemetry.set_running(&collector.config.name, true);
        }
        Self { collector }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.collector.state.write() = CollectorState::Idle;
        if let Some(telemetry) = &self.collector.telemetry {
            telemetry.set_running(&self.collector.config.name, false);
        }
    }
}

impl Collector {
    pub fn new(config: Config, logger: Logger, telemetry: Option<Arc<Telemetry>>) -> Self {
        let logger = logger.new(o!("collector" => config.name.clone()));
        Self {
            config,
            state: RwLock::new(CollectorState::Idle),
            cycle: Mutex::new(()),
            telemetry,
            logger,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> CollectorState {
        *self.state.read()
    }

    /// Runs one cycle. Overlapping calls wait for the running cycle to finish.
    pub async fn invoke(&self, ctx: &CancellationToken) -> Result<Invocation> {
        let _cycle = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(CollectorError::Cancelled),
            guard = self.cycle.lock() => guard,
        };
        let _running = RunningGuard::enter(self);

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let logger = self.logger.new(o!("invocation" => id.to_string()));

        let result = self.run_cycle(ctx, started_at, &logger).await;
        let result = match result {
            _ if ctx.is_cancelled() => Err(CollectorError::Cancelled),
            other => other,
        };
        let elapsed = started.elapsed();

        if let Some(telemetry) = &self.telemetry {
            telemetry.record_cycle(&self.config.name, Outcome::of(&result), elapsed);
            for sink in result.as_ref().err().map(CollectorError::failed_sinks).unwrap_or_default() {
                telemetry.record_sink_failure(&self.config.name, sink);
            }
            if let Ok((metrics, _)) = &result {
                telemetry.record_emitted(&self.config.name, metrics.len());
            }
        }

        match result {
            Ok((metrics, delivered)) => {
                info!(logger, "cycle complete";
                    "metrics" => metrics.len(),
                    "sinks" => delivered.len(),
                    "elapsed_ms" => elapsed.as_millis() as u64,
                );
                Ok(Invocation {
                    id,
                    metrics,
                    delivered,
                    started_at,
                    elapsed,
                })
            }
            Err(err) => {
                warn!(logger, "cycle failed"; "error" => %err);
                Err(err)
            }
        }
    }

    async fn run_cycle(
        &self,
        ctx: &CancellationToken,
        collected_at: DateTime<Utc>,
        logger: &Logger,
    ) -> Result<(Vec<Metric>, Vec<String>)> {
        let rows = self.config.source.collect(ctx).await?;
        debug!(logger, "rows collected"; "rows" => rows.len());

        let metrics = synth::synthesize(&rows, &self.config.metric, collected_at)?;
        let delivered = self.deliver(&metrics, ctx, logger).await?;
        Ok((metrics, delivered))
    }

    /// Hands the batch to every sink at once and collects every failure.
    async fn deliver(
        &self,
        metrics: &[Metric],
        ctx: &CancellationToken,
        logger: &Logger,
    ) -> Result<Vec<String>> {
        let results = join_all(self.config.sinks.iter().map(|(name, sink)| async move {
            (name, sink.sink(metrics, ctx).await)
        }))
        .await;

        let mut delivered = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(()) => delivered.push(name.clone()),
                Err(error) => {
                    warn!(logger, "sink failed"; "sink" => name, "error" => %error);
                    failures.push(SinkFailure {
                        sink: name.clone(),
                        error,
                    });
                }
            }
        }

        if ctx.is_cancelled() {
            return Err(CollectorError::Cancelled);
        }
        if !failures.is_empty() {
            return Err(CollectorError::Delivery(failures));
        }
        Ok(delivered)
    }

    /// Releases the source and every sink. Waits for a running cycle first.
    pub async fn shutdown(&self) {
        let _cycle = self.cycle.lock().await;
        self.config.source.close().await;
        for (name, sink) in &self.config.sinks {
            if let Err(err) = sink.close().await {
                warn!(self.logger, "sink did not close cleanly"; "sink" => name, "error" => %err);
            }
        }
        debug!(self.logger, "collector shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetricConfig, Schedule};
    use crate::logging;
    use crate::models::{MetricType, Value};
    use crate::record::Row;
    use crate::sinks::Sink;
    use crate::sources::Source;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct FixedSource(Vec<Row>);

    #[async_trait]
    impl Source for FixedSource {
        fn kind(&self) -> &str {
            "fixed"
        }

        async fn collect(&self, _ctx: &CancellationToken) -> Result<Vec<Row>> {
            Ok(self.0.clone())
        }
    }

    struct CancellingSource;

    #[async_trait]
    impl Source for CancellingSource {
        fn kind(&self) -> &str {
            "cancelling"
        }

        async fn collect(&self, ctx: &CancellationToken) -> Result<Vec<Row>> {
            ctx.cancel();
            Err(CollectorError::Query("interrupted".into()))
        }
    }

    struct NullSink;

    #[async_trait]
    impl Sink for NullSink {
        fn kind(&self) -> &str {
            "null"
        }

        async fn sink(&self, _metrics: &[Metric], _ctx: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    fn config(source: Box<dyn Source>) -> Config {
        let mut sinks: BTreeMap<String, Box<dyn Sink>> = BTreeMap::new();
        sinks.insert("null".into(), Box::new(NullSink));
        Config {
            name: "unit".into(),
            metric: MetricConfig {
                name: "unit.metric".into(),
                metric_type: MetricType::Counter,
                grain: None,
                tags: Vec::new(),
            },
            schedule: Schedule {
                interval: Some(Duration::from_secs(60)),
                cron: None,
            },
            source,
            sinks,
        }
    }

    fn row(value: i64) -> Row {
        [("value", Value::Int(value))].into_iter().collect()
    }

    #[tokio::test]
    async fn successful_cycle_reports_delivery() {
        let telemetry = Arc::new(Telemetry::new().unwrap());
        let collector = Collector::new(
            config(Box::new(FixedSource(vec![row(1), row(2)]))),
            logging::discard(),
            Some(telemetry.clone()),
        );

        let invocation = collector.invoke(&CancellationToken::new()).await.unwrap();
        assert_eq!(invocation.metrics.len(), 2);
        assert_eq!(invocation.delivered, vec!["null".to_string()]);
        assert_eq!(collector.state(), CollectorState::Idle);
        assert!(telemetry
            .encode()
            .unwrap()
            .contains(r#"collector_metrics_emitted_total{collector="unit"} 2"#));
    }

    #[tokio::test]
    async fn bad_row_fails_the_cycle_and_returns_to_idle() {
        let bad: Row = [("value", Value::Text("n/a".into()))].into_iter().collect();
        let collector = Collector::new(
            config(Box::new(FixedSource(vec![row(1), bad]))),
            logging::discard(),
            None,
        );

        let err = collector.invoke(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CollectorError::Decode(ref m) if m.starts_with("row 1")));
        assert_eq!(collector.state(), CollectorState::Idle);
    }

    #[tokio::test]
    async fn cancellation_wins_over_other_errors() {
        let collector = Collector::new(config(Box::new(CancellingSource)), logging::discard(), None);
        let err = collector.invoke(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CollectorError::Cancelled));
        assert_eq!(collector.state(), CollectorState::Idle);
    }

    #[tokio::test]
    async fn already_cancelled_context_does_not_run() {
        let collector = Collector::new(
            config(Box::new(FixedSource(vec![row(1)]))),
            logging::discard(),
            None,
        );
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(matches!(collector.invoke(&ctx).await, Err(CollectorError::Cancelled)));
    }
}
