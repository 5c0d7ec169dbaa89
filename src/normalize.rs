//! SQL over payloads that are not naturally relational.
//!
//! A [`Normalizer`] takes a batch of semi-structured records, materializes them
//! as a two column relation (`metric JSON`, `value VARCHAR`) in a throwaway
//! store and runs a caller query over it. Sources whose native shape is not
//! queryable adapt their payload into [`Record`]s and get the same "write SQL
//! against my data" contract as a real database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use duckdb::{
    params,
    types::{TimeUnit, Value as DuckValue},
    Connection,
};
use parking_lot::Mutex;
use slog::{debug, Logger};
use tokio_util::sync::CancellationToken;

use crate::{models::Value, record::Table, CollectorError, Result};

const INTERRUPT_RETRY: Duration = Duration::from_millis(20);

type Interrupt = Box<dyn Fn() + Send + Sync>;

/// One payload entry: a structured document plus its scalar reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub document: serde_json::Value,
    pub value: String,
}

impl Record {
    pub fn new(document: serde_json::Value, value: impl Into<String>) -> Self {
        Self {
            document,
            value: value.into(),
        }
    }
}

#[async_trait]
pub trait Normalizer: Send + Sync {
    /// Loads `records` into a fresh relation named `relation` and runs `sql` over it.
    ///
    /// Nothing survives the call: every invocation gets its own store, released
    /// before returning whether the query succeeded, failed or was cancelled.
    async fn query(
        &self,
        relation: &str,
        records: Vec<Record>,
        sql: &str,
        ctx: &CancellationToken,
    ) -> Result<Table>;
}

/// In-memory DuckDB per invocation.
#[derive(Clone)]
pub struct DuckDbNormalizer {
    logger: Logger,
}

impl DuckDbNormalizer {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl Normalizer for DuckDbNormalizer {
    async fn query(
        &self,
        relation: &str,
        records: Vec<Record>,
        sql: &str,
        ctx: &CancellationToken,
    ) -> Result<Table> {
        if ctx.is_cancelled() {
            return Err(CollectorError::Cancelled);
        }
        validate_relation_name(relation)?;

        let relation = relation.to_string();
        let sql = sql.to_string();
        let logger = self.logger.clone();
        let token = ctx.clone();
        let interrupt: Arc<Mutex<Option<Interrupt>>> = Arc::default();
        let registered = interrupt.clone();

        // The connection lives and dies inside the blocking task.
        let mut task = tokio::task::spawn_blocking(move || -> Result<Table> {
            let mut conn = Connection::open_in_memory()?;
            let handle = conn.interrupt_handle();
            *registered.lock() = Some(Box::new(move || handle.interrupt()));

            load(&mut conn, &relation, &records, &token)?;
            debug!(logger, "records materialized"; "relation" => &relation, "rows" => records.len());
            if token.is_cancelled() {
                return Err(CollectorError::Cancelled);
            }
            let table = run_query(&conn, &sql)?;
            debug!(logger, "normalized query finished"; "rows" => table.len());
            Ok(table)
        });

        tokio::select! {
            biased;
            _ = ctx.cancelled() => {}
            joined = &mut task => {
                return joined
                    .map_err(|err| CollectorError::Internal(format!("normalization task failed: {err}")))?;
            }
        }

        // An interrupt that lands between statements is lost, so repeat it
        // until the task has dropped its connection.
        loop {
            if let Some(interrupt) = interrupt.lock().as_ref() {
                interrupt();
            }
            tokio::select! {
                _ = &mut task => break,
                _ = tokio::time::sleep(INTERRUPT_RETRY) => {}
            }
        }
        debug!(self.logger, "normalization interrupted");
        Err(CollectorError::Cancelled)
    }
}

fn validate_relation_name(relation: &str) -> Result<()> {
    let valid = relation
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && relation.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CollectorError::Config(format!("invalid relation name {relation:?}")))
    }
}

fn load(conn: &mut Connection, relation: &str, records: &[Record], token: &CancellationToken) -> Result<()> {
    conn.execute_batch(&format!("CREATE TABLE {relation} (metric JSON, value VARCHAR);"))?;

    // All or nothing: a failed row drops the transaction and the cycle with it.
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&format!("INSERT INTO {relation} VALUES (CAST(? AS JSON), ?)"))?;
        for (i, record) in records.iter().enumerate() {
            if token.is_cancelled() {
                return Err(CollectorError::Cancelled);
            }
            let document = serde_json::to_string(&record.document)?;
            stmt.execute(params![document, record.value]).map_err(|err| {
                CollectorError::Query(format!("inserting record {i} into {relation}: {err}"))
            })?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn run_query(conn: &Connection, sql: &str) -> Result<Table> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;

    let columns = rows
        .as_ref()
        .map(|stmt| stmt.column_names())
        .unwrap_or_default();
    let width = columns.len();
    let mut table = Table::new(columns);

    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            let cell: DuckValue = row.get(i)?;
            cells.push(convert(cell)?);
        }
        table.push(cells);
    }
    Ok(table)
}

fn convert(cell: DuckValue) -> Result<Value> {
    let value = match cell {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::Int(i64::from(i)),
        DuckValue::SmallInt(i) => Value::Int(i64::from(i)),
        DuckValue::Int(i) => Value::Int(i64::from(i)),
        DuckValue::BigInt(i) => Value::Int(i),
        DuckValue::UTinyInt(i) => Value::Int(i64::from(i)),
        DuckValue::USmallInt(i) => Value::Int(i64::from(i)),
        DuckValue::UInt(i) => Value::Int(i64::from(i)),
        DuckValue::UBigInt(i) => i64::try_from(i).map_or(Value::Float(i as f64), Value::Int),
        DuckValue::HugeInt(i) => i64::try_from(i).map_or(Value::Float(i as f64), Value::Int),
        DuckValue::Float(f) => Value::Float(f64::from(f)),
        DuckValue::Double(f) => Value::Float(f),
        DuckValue::Decimal(d) => {
            let text = d.to_string();
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|err| CollectorError::Decode(format!("decimal {text}: {err}")))?
        }
        DuckValue::Text(s) => Value::Text(s),
        DuckValue::Timestamp(unit, raw) => Value::Timestamp(timestamp(unit, raw)?),
        DuckValue::Date32(days) => {
            let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
                .ok_or_else(|| CollectorError::Internal("epoch date".into()))?;
            let date = epoch
                .checked_add_signed(chrono::TimeDelta::days(i64::from(days)))
                .ok_or_else(|| CollectorError::Decode(format!("date {days} out of range")))?;
            Value::Timestamp(date.and_time(chrono::NaiveTime::MIN).and_utc())
        }
        other => {
            return Err(CollectorError::Decode(format!(
                "unsupported result value {other:?}; cast it to a scalar in the query"
            )))
        }
    };
    Ok(value)
}

fn timestamp(unit: TimeUnit, raw: i64) -> Result<DateTime<Utc>> {
    let ts = match unit {
        TimeUnit::Second => DateTime::from_timestamp(raw, 0),
        TimeUnit::Millisecond => DateTime::from_timestamp_millis(raw),
        TimeUnit::Microsecond => DateTime::from_timestamp_micros(raw),
        TimeUnit::Nanosecond => Some(DateTime::from_timestamp_nanos(raw)),
    };
    ts.ok_or_else(|| CollectorError::Decode(format!("timestamp {raw} ({unit:?}) out of range")))
}
