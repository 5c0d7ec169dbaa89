//! Declarative collector configuration.
//!
//! A config document goes through three steps: environment templating, YAML
//! decoding plus validation, and finally resolution of the source and sinks
//! through the plugin registries. Validation always happens before any source
//! or sink is built, so a contradictory document never touches the network.

pub mod duration;
pub mod template;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use slog::{info, o};

use crate::{
    models::{MetricType, Tag},
    registry::{BuildContext, Plugins},
    scheduler::Trigger,
    sinks::Sink,
    sources::Source,
    CollectorError, Result,
};

/// Static description of the metric produced from every result row.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    /// Width of the time bucket a metric represents.
    #[serde(default, with = "duration::option")]
    pub grain: Option<Duration>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// When to collect. Exactly one of the two fields must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Schedule {
    #[serde(default, with = "duration::option")]
    pub interval: Option<Duration>,
    #[serde(default)]
    pub cron: Option<String>,
}

/// A type tag plus the untyped options handed to the matching plugin.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_options")]
    pub config: serde_json::Value,
}

fn empty_options() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// The decoded document, before any source or sink is resolved.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    pub name: String,
    pub metric: MetricConfig,
    pub schedule: Schedule,
    pub source: PluginSpec,
    #[serde(default)]
    pub sinks: BTreeMap<String, PluginSpec>,
}

impl ConfigDocument {
    /// Templates and decodes a YAML document without validating it.
    pub fn parse(raw: &str) -> Result<Self> {
        let expanded = template::expand(raw)?;
        Ok(serde_yaml::from_str(&expanded)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CollectorError::Config("'name' must not be empty".into()));
        }
        if self.metric.name.trim().is_empty() {
            return Err(CollectorError::Config("'metric.name' must not be empty".into()));
        }
        validate_schedule(&self.schedule)?;
        validate_grain(&self.schedule, &self.metric)?;
        if self.sinks.is_empty() {
            return Err(CollectorError::Config("at least one sink must be configured".into()));
        }
        Ok(())
    }
}

fn validate_schedule(schedule: &Schedule) -> Result<()> {
    match (&schedule.interval, &schedule.cron) {
        (None, None) => Err(CollectorError::Config(
            "must set schedule.interval or schedule.cron".into(),
        )),
        (Some(_), Some(_)) => Err(CollectorError::Config(
            "must set either schedule.interval or schedule.cron, not both".into(),
        )),
        (Some(interval), None) if interval.is_zero() => {
            Err(CollectorError::Config("'schedule.interval' must be positive".into()))
        }
        _ => Trigger::try_from(schedule).map(|_| ()),
    }
}

fn validate_grain(schedule: &Schedule, metric: &MetricConfig) -> Result<()> {
    if metric.grain.is_some_and(|g| g.is_zero()) {
        return Err(CollectorError::Config("'metric.grain' must be positive".into()));
    }
    match (schedule.interval, metric.grain) {
        (Some(interval), Some(grain)) if interval != grain => Err(CollectorError::Config(format!(
            "'schedule.interval' ({}) should match 'metric.grain' ({})",
            humantime::format_duration(interval),
            humantime::format_duration(grain)
        ))),
        _ => Ok(()),
    }
}

/// A validated config with its source and sinks resolved.
pub struct Config {
    pub name: String,
    pub metric: MetricConfig,
    pub schedule: Schedule,
    pub source: Box<dyn Source>,
    pub sinks: BTreeMap<String, Box<dyn Sink>>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("name", &self.name)
            .field("metric", &self.metric)
            .field("schedule", &self.schedule)
            .field("source", &self.source.kind())
            .field("sinks", &self.sinks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Config {
    /// Builds a config from raw YAML bytes, templating and validating first.
    pub async fn from_yaml(raw: &str, ctx: &BuildContext, plugins: &Plugins) -> Result<Self> {
        let document = ConfigDocument::parse(raw)?;
        Self::from_document(document, ctx, plugins).await
    }

    pub async fn from_document(
        document: ConfigDocument,
        ctx: &BuildContext,
        plugins: &Plugins,
    ) -> Result<Self> {
        document.validate()?;

        let ConfigDocument {
            name,
            metric,
            schedule,
            source,
            sinks,
        } = document;

        let source_ctx = ctx.child(o!("config" => name.clone(), "source" => source.kind.clone()));
        let source = plugins
            .sources
            .get(&source.kind)?
            .build(&source.config, &source_ctx)
            .await?;

        let mut resolved = BTreeMap::new();
        for (sink_name, plugin_ref) in sinks {
            let sink_ctx = ctx.child(o!(
                "config" => name.clone(),
                "sink" => sink_name.clone(),
                "sink_type" => plugin_ref.kind.clone(),
            ));
            let sink = plugins.sinks.get(&plugin_ref.kind)?.build(&plugin_ref.config, &sink_ctx).await?;
            resolved.insert(sink_name, sink);
        }

        info!(ctx.logger, "config resolved";
            "config" => &name,
            "source" => source.kind(),
            "sinks" => resolved.len(),
            "validate" => ctx.validate,
        );

        Ok(Self {
            name,
            metric,
            schedule,
            source,
            sinks: resolved,
        })
    }

    pub async fn from_file(path: impl AsRef<Path>, ctx: &BuildContext, plugins: &Plugins) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&raw, ctx, plugins)
            .await
            .map_err(|err| match err {
                CollectorError::Config(msg) => {
                    CollectorError::Config(format!("{}: {}", path.display(), msg))
                }
                other => other,
            })
    }

    /// Loads every regular file in `dir` (not recursive), in file name order.
    pub async fn load_dir(dir: impl AsRef<Path>, ctx: &BuildContext, plugins: &Plugins) -> Result<Vec<Self>> {
        let mut entries = tokio::fs::read_dir(dir.as_ref()).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();

        let mut configs = Vec::with_capacity(paths.len());
        for path in paths {
            configs.push(Self::from_file(&path, ctx, plugins).await?);
        }
        Ok(configs)
    }

    /// Loads a single file, or every file when `path` is a directory.
    pub async fn load(path: impl AsRef<Path>, ctx: &BuildContext, plugins: &Plugins) -> Result<Vec<Self>> {
        let path = path.as_ref();
        if tokio::fs::metadata(path).await?.is_dir() {
            Self::load_dir(path, ctx, plugins).await
        } else {
            Ok(vec![Self::from_file(path, ctx, plugins).await?])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(schedule: &str, grain: Option<&str>) -> String {
        let grain = grain.map(|g| format!("  grain: {g}\n")).unwrap_or_default();
        format!(
            "name: orders\n\
             metric:\n  name: orders.count\n  type: gauge\n{grain}  tags:\n    - key: env\n      value: prod\n\
             schedule:\n{schedule}\n\
             source:\n  type: postgres\n  config:\n    uri: postgres://localhost/db\n    sql: SELECT 1 AS value\n\
             sinks:\n  stdout:\n    type: console\n"
        )
    }

    #[test]
    fn decodes_a_full_document() {
        let doc: ConfigDocument =
            serde_yaml::from_str(&document("  interval: 1h", Some("1h"))).unwrap();
        assert_eq!(doc.name, "orders");
        assert_eq!(doc.metric.metric_type, MetricType::Gauge);
        assert_eq!(doc.metric.grain, Some(Duration::from_secs(3600)));
        assert_eq!(doc.metric.tags, vec![Tag::new("env", "prod")]);
        assert_eq!(doc.source.kind, "postgres");
        assert_eq!(doc.source.config["sql"], "SELECT 1 AS value");
        assert_eq!(doc.sinks["stdout"].kind, "console");
        assert!(doc.sinks["stdout"].config.as_object().unwrap().is_empty());
        doc.validate().unwrap();
    }

    #[test]
    fn interval_must_equal_grain() {
        let doc: ConfigDocument =
            serde_yaml::from_str(&document("  interval: 30m", Some("1h"))).unwrap();
        let err = doc.validate().unwrap_err();
        assert!(matches!(err, CollectorError::Config(ref m) if m.contains("metric.grain")));
    }

    #[test]
    fn interval_without_grain_is_allowed() {
        let doc: ConfigDocument = serde_yaml::from_str(&document("  interval: 30m", None)).unwrap();
        doc.validate().unwrap();
    }

    #[test]
    fn schedule_needs_exactly_one_trigger() {
        let doc: ConfigDocument = serde_yaml::from_str(&document("  {}", None)).unwrap();
        assert!(matches!(doc.validate(), Err(CollectorError::Config(_))));

        let doc: ConfigDocument =
            serde_yaml::from_str(&document("  interval: 1h\n  cron: '0 * * * *'", None)).unwrap();
        assert!(matches!(doc.validate(), Err(CollectorError::Config(_))));
    }

    #[test]
    fn cron_schedule_is_parsed_during_validation() {
        let doc: ConfigDocument =
            serde_yaml::from_str(&document("  cron: '*/5 * * * *'", Some("1h"))).unwrap();
        doc.validate().unwrap();

        let doc: ConfigDocument =
            serde_yaml::from_str(&document("  cron: 'every tuesday'", None)).unwrap();
        assert!(matches!(doc.validate(), Err(CollectorError::Config(_))));
    }

    #[test]
    fn unknown_top_level_field_is_rejected() {
        let raw = format!("{}extra: true\n", document("  interval: 1h", Some("1h")));
        assert!(serde_yaml::from_str::<ConfigDocument>(&raw).is_err());
    }

    #[test]
    fn requires_a_sink() {
        let raw = document("  interval: 1h", Some("1h")).replace(
            "sinks:\n  stdout:\n    type: console\n",
            "sinks: {}\n",
        );
        let doc: ConfigDocument = serde_yaml::from_str(&raw).unwrap();
        assert!(matches!(doc.validate(), Err(CollectorError::Config(ref m)) if m.contains("sink")));
    }
}
