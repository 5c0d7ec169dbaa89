//! Environment templating applied to config documents before they are decoded.
//!
//! Two actions are understood:
//!
//! * `{{ getEnv "NAME" }}` expands to the variable's value, or nothing when unset.
//! * `{{ getEnvOrDefault "NAME" "fallback" }}` expands to the fallback when the
//!   variable is unset or empty.
//!
//! Any other `{{ ... }}` action is rejected.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::{CollectorError, Result};

fn action_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"\{\{-?\s*(.*?)\s*-?\}\}"#).expect("action pattern is valid")
    })
}

fn call_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^(getEnv|getEnvOrDefault)((?:\s+"(?:[^"\\]|\\.)*")+)$"#)
            .expect("call pattern is valid")
    })
}

fn argument_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).expect("argument pattern is valid"))
}

/// Expands template actions against the process environment.
pub fn expand(raw: &str) -> Result<String> {
    expand_with(raw, |key| std::env::var(key).ok())
}

/// Expands template actions, resolving variables through `lookup`.
pub fn expand_with<F>(raw: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut failure = None;
    let expanded = action_pattern().replace_all(raw, |caps: &Captures<'_>| {
        match evaluate(&caps[1], &lookup) {
            Ok(value) => value,
            Err(err) => {
                failure.get_or_insert(err);
                String::new()
            }
        }
    });

    match failure {
        Some(err) => Err(err),
        None => Ok(expanded.into_owned()),
    }
}

fn evaluate<F>(action: &str, lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let call = call_pattern().captures(action).ok_or_else(|| {
        CollectorError::Config(format!("unsupported template action {{{{ {action} }}}}"))
    })?;

    let args: Vec<String> = argument_pattern()
        .captures_iter(&call[2])
        .map(|arg| arg[1].replace("\\\"", "\"").replace("\\\\", "\\"))
        .collect();

    match (&call[1], args.as_slice()) {
        ("getEnv", [key]) => Ok(lookup(key).unwrap_or_default()),
        ("getEnvOrDefault", [key, fallback]) => Ok(lookup(key)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.clone())),
        (name, args) => Err(CollectorError::Config(format!(
            "template function {name} called with {} argument(s)",
            args.len()
        ))),
    }
}
