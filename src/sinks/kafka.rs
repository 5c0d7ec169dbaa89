use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rskafka::{
    client::{
        partition::{Compression, PartitionClient, UnknownTopicHandling},
        ClientBuilder,
    },
    record::Record,
};
use serde::Deserialize;
use slog::{debug, info, Logger};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    cancel::until_cancelled,
    models::Metric,
    registry::{decode_options, BuildContext},
    sinks::{Sink, SinkPlugin},
    CollectorError, Result,
};

pub const KIND: &str = "kafka";

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaOptions {
    /// Bootstrap brokers as `host:port`.
    pub brokers: Vec<String>,
    pub topic: String,
    #[serde(default)]
    pub partition: i32,
    #[serde(default = "default_connect_timeout", with = "crate::config::duration")]
    pub connect_timeout: Duration,
}

/// Produces every metric of a batch as one JSON record, keyed by metric name.
pub struct KafkaSink {
    options: KafkaOptions,
    producer: Mutex<Option<PartitionClient>>,
    logger: Logger,
}

impl KafkaSink {
    /// Connects to the brokers and resolves the partition leader. With
    /// `validate` set no broker is contacted and the sink refuses to deliver.
    pub async fn connect(options: KafkaOptions, validate: bool, logger: Logger) -> Result<Self> {
        if options.brokers.is_empty() {
            return Err(CollectorError::Config("kafka sink needs at least one broker".into()));
        }
        if options.topic.trim().is_empty() {
            return Err(CollectorError::Config("kafka sink 'topic' must not be empty".into()));
        }

        let producer = if validate {
            None
        } else {
            let producer = tokio::time::timeout(options.connect_timeout, async {
                let client = ClientBuilder::new(options.brokers.clone()).build().await?;
                client
                    .partition_client(
                        options.topic.clone(),
                        options.partition,
                        UnknownTopicHandling::Error,
                    )
                    .await
            })
            .await
            .map_err(|_| {
                CollectorError::Connection(format!(
                    "kafka {:?}: no connection within {}",
                    options.brokers,
                    humantime::format_duration(options.connect_timeout)
                ))
            })?
            .map_err(|err| CollectorError::Connection(format!("kafka {:?}: {err}", options.brokers)))?;
            info!(logger, "connected to kafka"; "topic" => &options.topic, "partition" => options.partition);
            Some(producer)
        };

        Ok(Self {
            options,
            producer: Mutex::new(producer),
            logger,
        })
    }
}

/// One record per metric, in batch order.
pub fn records(metrics: &[Metric]) -> Result<Vec<Record>> {
    metrics
        .iter()
        .map(|metric| {
            Ok(Record {
                key: Some(metric.name.clone().into_bytes()),
                value: Some(serde_json::to_vec(metric)?),
                headers: BTreeMap::new(),
                timestamp: metric.timestamp,
            })
        })
        .collect()
}

#[async_trait]
impl Sink for KafkaSink {
    fn kind(&self) -> &str {
        KIND
    }

    async fn sink(&self, metrics: &[Metric], ctx: &CancellationToken) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let records = records(metrics)?;
        let offsets = until_cancelled(ctx, async {
            let guard = self.producer.lock().await;
            let producer = guard.as_ref().ok_or_else(|| {
                CollectorError::Internal(format!(
                    "kafka sink for topic {:?} is closed or was built for validation only",
                    self.options.topic
                ))
            })?;
            producer
                .produce(records, Compression::NoCompression)
                .await
                .map_err(|err| CollectorError::Connection(format!("kafka produce: {err}")))
        })
        .await?;
        debug!(self.logger, "metrics produced"; "topic" => &self.options.topic, "records" => offsets.len());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.producer.lock().await.take();
        Ok(())
    }
}

pub struct KafkaPlugin;

#[async_trait]
impl SinkPlugin for KafkaPlugin {
    async fn build(&self, options: &serde_json::Value, ctx: &BuildContext) -> Result<Box<dyn Sink>> {
        let options: KafkaOptions = decode_options(KIND, options)?;
        Ok(Box::new(KafkaSink::connect(options, ctx.validate, ctx.logger.clone()).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use crate::models::{MetricType, Tag};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn options(brokers: Vec<&str>) -> KafkaOptions {
        KafkaOptions {
            brokers: brokers.into_iter().map(String::from).collect(),
            topic: "metrics".into(),
            partition: 0,
            connect_timeout: Duration::from_secs(1),
        }
    }

    fn metric(value: f64) -> Metric {
        Metric {
            name: "orders.count".into(),
            metric_type: MetricType::Gauge,
            value,
            tags: vec![Tag::new("env", "prod")],
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
            grain: None,
        }
    }

    #[test]
    fn options_default_partition_and_timeout() {
        let options: KafkaOptions =
            decode_options(KIND, &json!({"brokers": ["kafka:9092"], "topic": "metrics"})).unwrap();
        assert_eq!(options.partition, 0);
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn every_metric_becomes_a_json_record() {
        let batch = [metric(1.0), metric(2.0)];
        let records = records(&batch).unwrap();

        assert_eq!(records.len(), 2);
        for (record, metric) in records.iter().zip(&batch) {
            assert_eq!(record.key.as_deref(), Some("orders.count".as_bytes()));
            let decoded: Metric = serde_json::from_slice(record.value.as_deref().unwrap()).unwrap();
            assert_eq!(&decoded, metric);
            assert_eq!(record.timestamp, metric.timestamp);
        }
    }

    #[tokio::test]
    async fn validation_mode_does_not_contact_brokers() {
        let sink = KafkaSink::connect(options(vec!["127.0.0.1:1"]), true, logging::discard())
            .await
            .unwrap();
        assert_eq!(sink.kind(), KIND);

        let err = sink.sink(&[metric(1.0)], &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CollectorError::Internal(_)));
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_connection_error() {
        let err = KafkaSink::connect(options(vec!["127.0.0.1:1"]), false, logging::discard())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CollectorError::Connection(_)), "{err:?}");
    }

    #[tokio::test]
    async fn brokers_are_required() {
        let err = KafkaSink::connect(options(Vec::new()), true, logging::discard())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CollectorError::Config(_)));
    }
}
