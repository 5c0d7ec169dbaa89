use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use slog::{debug, info, Logger};
use tokio_util::sync::CancellationToken;

use crate::{
    cancel::until_cancelled,
    normalize::{DuckDbNormalizer, Normalizer, Record},
    record::Row,
    registry::{decode_options, BuildContext},
    sources::{time_expr::TimeExpression, Source, SourcePlugin},
    CollectorError, Result,
};

pub const KIND: &str = "prometheus";

/// Relation the API results are exposed as to the configured SQL.
pub const RELATION: &str = "prom_metrics";

const MAX_ERROR_BODY: usize = 512;

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusOptions {
    /// Instant query endpoint, e.g. `http://prometheus:9090/api/v1/query`.
    pub uri: String,
    /// PromQL sent as the `query` parameter.
    pub query: String,
    /// SQL run over [`RELATION`].
    pub sql: String,
    #[serde(default)]
    pub time_expression: Option<String>,
    #[serde(default = "default_timeout", with = "crate::config::duration")]
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    #[serde(default)]
    pub data: Option<ApiData>,
    #[serde(default, rename = "errorType")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiData {
    #[serde(rename = "resultType")]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<ApiSample>,
}

/// One series of an instant vector: its labels and `[timestamp, "value"]`.
#[derive(Debug, Deserialize)]
pub struct ApiSample {
    #[serde(default)]
    pub metric: serde_json::Value,
    pub value: (serde_json::Value, String),
}

/// Pulls an instant vector and answers the configured SQL over it.
pub struct PrometheusSource {
    url: Url,
    options: PrometheusOptions,
    time_expression: Option<TimeExpression>,
    client: reqwest::Client,
    normalizer: Arc<dyn Normalizer>,
    logger: Logger,
}

impl PrometheusSource {
    pub fn new(options: PrometheusOptions, logger: Logger) -> Result<Self> {
        let url = Url::parse(&options.uri)
            .map_err(|err| CollectorError::Config(format!("prometheus uri {:?}: {err}", options.uri)))?;
        let time_expression = options
            .time_expression
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(str::parse::<TimeExpression>)
            .transpose()?;
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|err| CollectorError::Internal(format!("http client: {err}")))?;

        Ok(Self {
            url,
            options,
            time_expression,
            client,
            normalizer: Arc::new(DuckDbNormalizer::new(logger.clone())),
            logger,
        })
    }

    /// Swaps the engine the API payload is normalized with.
    pub fn with_normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// The GET request for a cycle running at `now`.
    pub fn request_url(&self, now: DateTime<Utc>) -> Url {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("query", &self.options.query);
            if let Some(expr) = &self.time_expression {
                query.append_pair("time", &expr.resolve(now).timestamp().to_string());
            }
        }
        url
    }

    async fn fetch(&self, url: Url) -> Result<ApiResponse> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(CollectorError::Http(format!("prometheus returned {status}: {body}")));
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| CollectorError::Decode(format!("prometheus response: {err}")))
    }
}

/// Flattens an API envelope into normalization records.
pub fn records(response: ApiResponse) -> Result<Vec<Record>> {
    if response.status != "success" {
        return Err(CollectorError::Query(format!(
            "prometheus query failed ({}): {}",
            response.error_type.as_deref().unwrap_or("unknown"),
            response.error.as_deref().unwrap_or("no error message")
        )));
    }
    let data = response
        .data
        .ok_or_else(|| CollectorError::Decode("prometheus response has no data".into()))?;

    Ok(data
        .result
        .into_iter()
        .map(|sample| Record::new(sample.metric, sample.value.1))
        .collect())
}

#[async_trait]
impl Source for PrometheusSource {
    fn kind(&self) -> &str {
        KIND
    }

    async fn collect(&self, ctx: &CancellationToken) -> Result<Vec<Row>> {
        let url = self.request_url(Utc::now());
        info!(self.logger, "querying prometheus"; "url" => url.as_str());

        let response = until_cancelled(ctx, self.fetch(url)).await?;
        let records = records(response)?;
        debug!(self.logger, "prometheus returned series"; "series" => records.len());

        let table = self
            .normalizer
            .query(RELATION, records, &self.options.sql, ctx)
            .await?;
        table.into_rows()
    }
}

pub struct PrometheusPlugin;

#[async_trait]
impl SourcePlugin for PrometheusPlugin {
    async fn build(&self, options: &serde_json::Value, ctx: &BuildContext) -> Result<Box<dyn Source>> {
        let options: PrometheusOptions = decode_options(KIND, options)?;
        Ok(Box::new(PrometheusSource::new(options, ctx.logger.clone())?))
    }
}
