use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Url,
};
use serde::Deserialize;
use slog::{debug, Logger};
use tokio_util::sync::CancellationToken;

use crate::{
    cancel::until_cancelled,
    models::Metric,
    registry::{decode_options, BuildContext},
    sinks::{Sink, SinkPlugin},
    CollectorError, Result,
};

pub const KIND: &str = "http";

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpOptions {
    pub uri: String,
    /// Static headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout", with = "crate::config::duration")]
    pub timeout: Duration,
}

/// POSTs each batch as a JSON array.
pub struct HttpSink {
    url: Url,
    client: reqwest::Client,
    logger: Logger,
}

impl HttpSink {
    pub fn new(options: HttpOptions, logger: Logger) -> Result<Self> {
        let url = Url::parse(&options.uri)
            .map_err(|err| CollectorError::Config(format!("http sink uri {:?}: {err}", options.uri)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| CollectorError::Config(format!("header name {name:?}: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| CollectorError::Config(format!("header {name}: {err}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| CollectorError::Internal(format!("http client: {err}")))?;

        Ok(Self { url, client, logger })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn kind(&self) -> &str {
        KIND
    }

    async fn sink(&self, metrics: &[Metric], ctx: &CancellationToken) -> Result<()> {
        let response = until_cancelled(ctx, async {
            Ok(self.client.post(self.url.clone()).json(metrics).send().await?)
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollectorError::Http(format!("POST {} returned {status}", self.url)));
        }
        debug!(self.logger, "metrics posted"; "status" => status.as_u16(), "count" => metrics.len());
        Ok(())
    }
}

pub struct HttpPlugin;

#[async_trait]
impl SinkPlugin for HttpPlugin {
    async fn build(&self, options: &serde_json::Value, ctx: &BuildContext) -> Result<Box<dyn Sink>> {
        let options: HttpOptions = decode_options(KIND, options)?;
        Ok(Box::new(HttpSink::new(options, ctx.logger.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use crate::models::{MetricType, Tag};
    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn metric() -> Metric {
        Metric {
            name: "queue.depth".into(),
            metric_type: MetricType::Gauge,
            value: 9.0,
            tags: vec![Tag::new("queue", "emails")],
            timestamp: Utc::now(),
            grain: None,
        }
    }

    fn options(uri: String) -> HttpOptions {
        HttpOptions {
            uri,
            headers: BTreeMap::from([("x-api-key".to_string(), "secret".to_string())]),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn posts_the_batch_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(header("x-api-key", "secret"))
            .and(body_partial_json(serde_json::json!([{"name": "queue.depth", "value": 9.0}])))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpSink::new(options(format!("{}/ingest", server.uri())), logging::discard()).unwrap();
        sink.sink(&[metric()], &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sink = HttpSink::new(options(server.uri()), logging::discard()).unwrap();
        let err = sink.sink(&[metric()], &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CollectorError::Http(ref m) if m.contains("503")));
    }

    #[test]
    fn invalid_header_is_a_config_error() {
        let mut opts = options("http://localhost/".into());
        opts.headers.insert("bad header".into(), "x".into());
        assert!(matches!(
            HttpSink::new(opts, logging::discard()),
            Err(CollectorError::Config(_))
        ));
    }
}
