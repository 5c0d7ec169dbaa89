use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    cancel::until_cancelled,
    models::Metric,
    registry::{decode_options, BuildContext},
    sinks::{json_lines, Sink, SinkPlugin},
    Result,
};

pub const KIND: &str = "console";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsoleOptions {
    /// Indented JSON instead of one line per metric.
    #[serde(default)]
    pub pretty: bool,
}

/// Writes metrics to stdout.
pub struct ConsoleSink {
    options: ConsoleOptions,
    stdout: Mutex<tokio::io::Stdout>,
}

impl ConsoleSink {
    pub fn new(options: ConsoleOptions) -> Self {
        Self {
            options,
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }

    pub fn render(&self, metrics: &[Metric]) -> Result<String> {
        if !self.options.pretty {
            return json_lines(metrics);
        }
        let mut out = String::new();
        for metric in metrics {
            out.push_str(&serde_json::to_string_pretty(metric)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn kind(&self) -> &str {
        KIND
    }

    async fn sink(&self, metrics: &[Metric], ctx: &CancellationToken) -> Result<()> {
        let rendered = self.render(metrics)?;
        until_cancelled(ctx, async {
            let mut stdout = self.stdout.lock().await;
            stdout.write_all(rendered.as_bytes()).await?;
            stdout.flush().await?;
            Ok(())
        })
        .await
    }
}

pub struct ConsolePlugin;

#[async_trait]
impl SinkPlugin for ConsolePlugin {
    async fn build(&self, options: &serde_json::Value, _ctx: &BuildContext) -> Result<Box<dyn Sink>> {
        let options: ConsoleOptions = decode_options(KIND, options)?;
        Ok(Box::new(ConsoleSink::new(options)))
    }
}
