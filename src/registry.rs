//! Type-tag dispatch for sources and sinks.
//!
//! A [`Registry`] maps the `type` string of a config block to the plugin that
//! knows how to decode its options and build the implementation. The default
//! [`Plugins`] carry every built-in type; callers can register their own before
//! loading configs.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use slog::{Logger, OwnedKV, SendSyncRefUnwindSafeKV};

use crate::{
    logging,
    sinks::{self, SinkPlugin},
    sources::{self, SourcePlugin},
    CollectorError, Result,
};

/// What a plugin is handed when building an implementation.
#[derive(Clone)]
pub struct BuildContext {
    /// Build without opening connections or file handles.
    pub validate: bool,
    pub logger: Logger,
}

impl BuildContext {
    pub fn new(logger: Logger) -> Self {
        Self {
            validate: false,
            logger,
        }
    }

    pub fn validate_only(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn child<T>(&self, values: OwnedKV<T>) -> Self
    where
        T: SendSyncRefUnwindSafeKV + 'static,
    {
        Self {
            validate: self.validate,
            logger: self.logger.new(values),
        }
    }
}

impl Default for BuildContext {
    fn default() -> Self {
        Self::new(logging::discard())
    }
}

impl fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext")
            .field("validate", &self.validate)
            .finish_non_exhaustive()
    }
}

/// Decodes a plugin's option bag into its typed options.
///
/// Unknown, missing or mistyped fields surface as a decode error naming the field.
pub fn decode_options<T: DeserializeOwned>(kind: &str, options: &serde_json::Value) -> Result<T> {
    let options = match options {
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        other => other.clone(),
    };
    serde_path_to_error::deserialize(options).map_err(|err| {
        let path = err.path().to_string();
        let inner = err.into_inner();
        if path == "." {
            CollectorError::Decode(format!("{kind} options: {inner}"))
        } else {
            CollectorError::Decode(format!("{kind} options: field '{path}': {inner}"))
        }
    })
}

/// Tag to plugin mapping for one family of plugins.
pub struct Registry<P: ?Sized> {
    family: &'static str,
    plugins: HashMap<String, Box<P>>,
}

impl<P: ?Sized> Registry<P> {
    pub fn new(family: &'static str) -> Self {
        Self {
            family,
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: impl Into<String>, plugin: Box<P>) {
        self.plugins.insert(kind.into(), plugin);
    }

    pub fn get(&self, kind: &str) -> Result<&P> {
        self.plugins
            .get(kind)
            .map(|p| p.as_ref())
            .ok_or_else(|| CollectorError::UnsupportedType {
                kind: self.family,
                tag: kind.to_string(),
            })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.plugins.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

/// Source and sink registries used while resolving configs.
pub struct Plugins {
    pub sources: Registry<dyn SourcePlugin>,
    pub sinks: Registry<dyn SinkPlugin>,
}

impl Plugins {
    pub fn empty() -> Self {
        Self {
            sources: Registry::new("source"),
            sinks: Registry::new("sink"),
        }
    }
}

impl Default for Plugins {
    fn default() -> Self {
        let mut plugins = Self::empty();
        sources::register_defaults(&mut plugins.sources);
        sinks::register_defaults(&mut plugins.sinks);
        plugins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Options {
        #[allow(dead_code)]
        uri: String,
    }

    #[test]
    fn default_plugins_cover_builtin_types() {
        let plugins = Plugins::default();
        assert_eq!(plugins.sources.kinds(), vec!["postgres", "prometheus"]);
        assert_eq!(plugins.sinks.kinds(), vec!["console", "file", "http", "kafka"]);
    }

    #[test]
    fn unknown_tag_names_the_tag() {
        let plugins = Plugins::default();
        let err = plugins.sources.get("unknown-type").err().unwrap();
        assert!(err.to_string().contains("unknown-type"));
        assert!(matches!(
            err,
            CollectorError::UnsupportedType { kind: "source", .. }
        ));
    }

    #[test]
    fn decode_options_names_unknown_fields() {
        let err = decode_options::<Options>(
            "postgres",
            &serde_json::json!({"uri": "x", "sqll": "SELECT 1"}),
        )
        .unwrap_err();
        assert!(matches!(err, CollectorError::Decode(ref m) if m.contains("sqll")));
    }

    #[test]
    fn decode_options_names_mistyped_fields() {
        let err = decode_options::<Options>("postgres", &serde_json::json!({"uri": 5})).unwrap_err();
        assert!(
            matches!(err, CollectorError::Decode(ref m) if m.starts_with("postgres options: field 'uri': invalid type")),
            "{err}"
        );
    }

    #[test]
    fn decode_options_names_missing_fields() {
        let err = decode_options::<Options>("postgres", &serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, CollectorError::Decode(ref m) if m.contains("missing field `uri`")));
    }
}
