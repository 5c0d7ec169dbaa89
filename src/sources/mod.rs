//! Sources produce the rows of one collection cycle.
//!
//! Two families ship with the crate: [`postgres`] hands the configured SQL to a
//! live database, [`prometheus`] pulls an instant vector over HTTP and pushes it
//! through the [`Normalizer`](crate::normalize::Normalizer) so that the same
//! kind of SQL can be written against it.

pub mod postgres;
pub mod prometheus;
pub mod time_expr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    record::Row,
    registry::{BuildContext, Registry},
    Result,
};

#[async_trait]
pub trait Source: Send + Sync {
    /// Type tag this source was built from.
    fn kind(&self) -> &str;

    /// Runs one extraction and returns its rows in result order.
    async fn collect(&self, ctx: &CancellationToken) -> Result<Vec<Row>>;

    /// Releases long-lived handles. The source is not used afterwards.
    async fn close(&self) {}
}

/// Builds a [`Source`] from a config block's untyped options.
#[async_trait]
pub trait SourcePlugin: Send + Sync {
    async fn build(&self, options: &serde_json::Value, ctx: &BuildContext) -> Result<Box<dyn Source>>;
}

pub fn register_defaults(registry: &mut Registry<dyn SourcePlugin>) {
    registry.register(postgres::KIND, Box::new(postgres::PostgresPlugin));
    registry.register(prometheus::KIND, Box::new(prometheus::PrometheusPlugin));
}
