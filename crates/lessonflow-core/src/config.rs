// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Lessonflow configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL for the branch history store
    pub database_url: String,
    /// How long to wait for a terminal reply to a service request
    pub request_timeout: Duration,
    /// Upper bound for each termination phase
    pub phase_timeout: Duration,
    /// Course to run (binary only)
    pub course_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `LESSONFLOW_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `LESSONFLOW_REQUEST_TIMEOUT_MS`: reply timeout (default: 30000)
    /// - `LESSONFLOW_PHASE_TIMEOUT_MS`: termination phase timeout (default: 5000)
    /// - `LESSONFLOW_COURSE_FILE`: course JSON file
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("LESSONFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("LESSONFLOW_DATABASE_URL"))?;

        let request_timeout_ms: u64 = std::env::var("LESSONFLOW_REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "LESSONFLOW_REQUEST_TIMEOUT_MS",
                    "must be a positive number of milliseconds",
                )
            })?;

        let phase_timeout_ms: u64 = std::env::var("LESSONFLOW_PHASE_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "LESSONFLOW_PHASE_TIMEOUT_MS",
                    "must be a positive number of milliseconds",
                )
            })?;

        if request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "LESSONFLOW_REQUEST_TIMEOUT_MS",
                "must be greater than zero",
            ));
        }
        if phase_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "LESSONFLOW_PHASE_TIMEOUT_MS",
                "must be greater than zero",
            ));
        }

        let course_file = std::env::var("LESSONFLOW_COURSE_FILE")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            database_url,
            request_timeout: Duration::from_millis(request_timeout_ms),
            phase_timeout: Duration::from_millis(phase_timeout_ms),
            course_file,
        })
    }

    /// The timeouts a session needs.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::from(self)
    }
}

/// Timeouts applied by a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// How long to wait for a terminal reply to a service request.
    pub request_timeout: Duration,
    /// Upper bound for each termination phase.
    pub phase_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            phase_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            request_timeout: config.request_timeout,
            phase_timeout: config.phase_timeout,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
