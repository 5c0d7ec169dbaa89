pub mod api;
pub mod cancel;
pub mod collector;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod normalize;
pub mod record;
pub mod registry;
pub mod scheduler;
pub mod sinks;
pub mod sources;
pub mod synth;
pub mod telemetry;

pub use error::{CollectorError, Result, SinkFailure};
