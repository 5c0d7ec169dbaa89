//! Delivery targets for a cycle's metric batch.

pub mod console;
pub mod file;
pub mod http;
pub mod kafka;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    models::Metric,
    registry::{BuildContext, Registry},
    Result,
};

/// A delivery target. Implementations serialize their own writes, so one sink
/// may be called from several collectors at once.
#[async_trait]
pub trait Sink: Send + Sync {
    fn kind(&self) -> &str;

    async fn sink(&self, metrics: &[Metric], ctx: &CancellationToken) -> Result<()>;

    /// Flushes and releases the delivery handle.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait SinkPlugin: Send + Sync {
    async fn build(&self, options: &serde_json::Value, ctx: &BuildContext) -> Result<Box<dyn Sink>>;
}

pub fn register_defaults(registry: &mut Registry<dyn SinkPlugin>) {
    registry.register(console::KIND, Box::new(console::ConsolePlugin));
    registry.register(file::KIND, Box::new(file::FilePlugin));
    registry.register(http::KIND, Box::new(http::HttpPlugin));
    registry.register(kafka::KIND, Box::new(kafka::KafkaPlugin));
}

/// Renders a batch as newline-delimited JSON.
pub(crate) fn json_lines(metrics: &[Metric]) -> Result<String> {
    let mut out = String::new();
    for metric in metrics {
        out.push_str(&serde_json::to_string(metric)?);
        out.push('\n');
    }
    Ok(out)
}
