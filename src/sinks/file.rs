use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use slog::{debug, Logger};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    cancel::until_cancelled,
    models::Metric,
    registry::{decode_options, BuildContext},
    sinks::{json_lines, Sink, SinkPlugin},
    CollectorError, Result,
};

pub const KIND: &str = "file";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileOptions {
    pub path: PathBuf,
}

/// Appends metrics as JSON lines to a file opened once at construction.
pub struct FileSink {
    options: FileOptions,
    file: Mutex<Option<File>>,
    logger: Logger,
}

impl FileSink {
    /// Opens (or creates) the file for appending. With `validate` set the file
    /// is left alone and the sink refuses to deliver.
    pub async fn open(options: FileOptions, validate: bool, logger: Logger) -> Result<Self> {
        let file = if validate {
            None
        } else {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&options.path)
                .await
                .map_err(|err| {
                    CollectorError::Connection(format!("opening {}: {err}", options.path.display()))
                })?;
            Some(file)
        };

        Ok(Self {
            options,
            file: Mutex::new(file),
            logger,
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    fn kind(&self) -> &str {
        KIND
    }

    async fn sink(&self, metrics: &[Metric], ctx: &CancellationToken) -> Result<()> {
        let lines = json_lines(metrics)?;
        until_cancelled(ctx, async {
            let mut guard = self.file.lock().await;
            let file = guard.as_mut().ok_or_else(|| {
                CollectorError::Internal(format!(
                    "file sink for {} is closed or was built for validation only",
                    self.options.path.display()
                ))
            })?;
            file.write_all(lines.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
        .await?;
        debug!(self.logger, "metrics appended"; "path" => %self.options.path.display(), "count" => metrics.len());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

pub struct FilePlugin;

#[async_trait]
impl SinkPlugin for FilePlugin {
    async fn build(&self, options: &serde_json::Value, ctx: &BuildContext) -> Result<Box<dyn Sink>> {
        let options: FileOptions = decode_options(KIND, options)?;
        Ok(Box::new(FileSink::open(options, ctx.validate, ctx.logger.clone()).await?))
    }
}
