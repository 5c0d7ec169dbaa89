use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use serde::Deserialize;
use slog::{debug, info, Logger};
use sqlx::{
    postgres::{PgColumn, PgPool, PgPoolOptions, PgRow},
    types::Decimal,
    Column as _, Row as _, TypeInfo as _,
};
use tokio_util::sync::CancellationToken;

use crate::{
    cancel::until_cancelled,
    models::Value,
    record::{Row, Table},
    registry::{decode_options, BuildContext},
    sources::{Source, SourcePlugin},
    CollectorError, Result,
};

pub const KIND: &str = "postgres";

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresOptions {
    pub uri: String,
    pub sql: String,
    #[serde(default = "default_connect_timeout", with = "crate::config::duration")]
    pub connect_timeout: Duration,
}

/// Runs the configured SQL against a long-lived connection.
pub struct PostgresSource {
    options: PostgresOptions,
    pool: PgPool,
    logger: Logger,
}

impl PostgresSource {
    /// Opens the connection up front; with `validate` set nothing is dialed.
    pub async fn connect(options: PostgresOptions, validate: bool, logger: Logger) -> Result<Self> {
        let pool_options = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(options.connect_timeout);

        let pool = if validate {
            pool_options
                .connect_lazy(&options.uri)
                .map_err(|err| CollectorError::Config(format!("postgres uri: {err}")))?
        } else {
            let pool = pool_options
                .connect(&options.uri)
                .await
                .map_err(|err| match err {
                    sqlx::Error::Configuration(e) => CollectorError::Config(format!("postgres uri: {e}")),
                    other => CollectorError::Connection(format!("postgres: {other}")),
                })?;
            info!(logger, "connected to postgres");
            pool
        };

        Ok(Self {
            options,
            pool,
            logger,
        })
    }

    pub fn options(&self) -> &PostgresOptions {
        &self.options
    }

    async fn query(&self) -> Result<Table> {
        let mut stream = sqlx::query(&self.options.sql).fetch(&self.pool);
        let mut table: Option<Table> = None;

        while let Some(row) = stream.try_next().await? {
            let table = table.get_or_insert_with(|| {
                Table::new(row.columns().iter().map(|c| c.name().to_string()).collect())
            });
            table.push(decode_row(&row)?);
        }

        Ok(table.unwrap_or_default())
    }
}

#[async_trait]
impl Source for PostgresSource {
    fn kind(&self) -> &str {
        KIND
    }

    async fn collect(&self, ctx: &CancellationToken) -> Result<Vec<Row>> {
        let table = until_cancelled(ctx, self.query()).await?;
        debug!(self.logger, "query finished"; "rows" => table.len());
        table.into_rows()
    }

    async fn close(&self) {
        self.pool.close().await;
        debug!(self.logger, "connection closed");
    }
}

fn decode_row(row: &PgRow) -> Result<Vec<Value>> {
    row.columns().iter().map(|col| decode_cell(row, col)).collect()
}

fn decode_cell(row: &PgRow, col: &PgColumn) -> Result<Value> {
    let i = col.ordinal();
    let value = match col.type_info().name() {
        "BOOL" => row.try_get::<Option<bool>, _>(i)?.into(),
        "INT2" => row.try_get::<Option<i16>, _>(i)?.map(i64::from).into(),
        "INT4" => row.try_get::<Option<i32>, _>(i)?.map(i64::from).into(),
        "INT8" => row.try_get::<Option<i64>, _>(i)?.into(),
        "FLOAT4" => row.try_get::<Option<f32>, _>(i)?.map(f64::from).into(),
        "FLOAT8" => row.try_get::<Option<f64>, _>(i)?.into(),
        "NUMERIC" => match row.try_get::<Option<Decimal>, _>(i)? {
            Some(d) => {
                let text = d.to_string();
                Value::Float(text.parse().map_err(|err| {
                    CollectorError::Decode(format!("column {:?}: numeric {text}: {err}", col.name()))
                })?)
            }
            None => Value::Null,
        },
        "TIMESTAMPTZ" => row.try_get::<Option<DateTime<Utc>>, _>(i)?.into(),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(i)?
            .map(|ts| ts.and_utc())
            .into(),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(i)?
            .map(|d| d.and_time(NaiveTime::MIN).and_utc())
            .into(),
        other => row.try_get::<Option<String>, _>(i).map(Value::from).map_err(|_| {
            CollectorError::Decode(format!(
                "column {:?} has unsupported type {other}; cast it to text or a number in the query",
                col.name()
            ))
        })?,
    };
    Ok(value)
}

pub struct PostgresPlugin;

#[async_trait]
impl SourcePlugin for PostgresPlugin {
    async fn build(&self, options: &serde_json::Value, ctx: &BuildContext) -> Result<Box<dyn Source>> {
        let options: PostgresOptions = decode_options(KIND, options)?;
        let source = PostgresSource::connect(options, ctx.validate, ctx.logger.clone()).await?;
        Ok(Box::new(source))
    }
}
