//! Declarative job definitions.
//!
//! Intervals for recurring jobs usually belong in configuration rather than in
//! code. A [`SchedulerConfig`] is a list of [`JobSpec`]s loaded from JSON:
//!
//! ```json
//! {
//!   "jobs": [
//!     { "name": "sync-orders", "interval_ms": 60000 },
//!     { "name": "refresh-rates", "interval_ms": 3600000 }
//!   ]
//! }
//! ```
//!
//! Loading validates the list up front (non-empty unique names, non-zero
//! intervals), so a bad file fails at startup rather than at the first
//! `schedule` call.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading a [`SchedulerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid scheduler config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("job `{name}` has a zero interval")]
    ZeroInterval { name: String },

    #[error("job `{0}` is defined more than once")]
    DuplicateName(String),

    #[error("job name must not be empty")]
    EmptyName,
}

/// One recurring job: a unique name and how often it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub interval_ms: u64,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// The firing interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// A set of job definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

impl SchedulerConfig {
    /// Parses and validates a config from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON, or one of the
    /// validation variants for a well-formed but unusable job list.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a config from JSON bytes (e.g. a file's contents).
    pub fn from_json_slice(json: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks names and intervals.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.name.is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if job.interval_ms == 0 {
                return Err(ConfigError::ZeroInterval {
                    name: job.name.clone(),
                });
            }
            if !seen.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateName(job.name.clone()));
            }
        }
        Ok(())
    }

    /// Looks up a job definition by name.
    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|job| job.name == name)
    }
}
