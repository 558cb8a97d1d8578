// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Startup configuration for the engine, layered defaults -> file -> env.
//!
//! Unlike a persisted service, there is no `OnceLock` global here: the
//! embedder owns the `EngineConfig` and passes it to
//! [`crate::Dispatcher::new`] explicitly, since a single process may want
//! more than one engine instance in tests.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shutdown policy for owned resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitMode {
    Cleanup,
    Keep,
    Assert,
}

impl Default for ExitMode {
    fn default() -> Self {
        ExitMode::Cleanup
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Determines AZ synthesis (`<region>a`) and DNS name formatting.
    pub region: String,
    /// Name of the data-plane network; `None` = auto-detect.
    pub instance_network: Option<String>,
    pub exit_resource_mode: ExitMode,
    #[serde(with = "humantime_secs")]
    pub spot_reclaim_after: Duration,
    #[serde(with = "humantime_secs")]
    pub spot_reclaim_notice: Duration,
    /// How long a terminated instance's record survives before
    /// [`crate::store::ResourceStore::prune_terminated`] reaps it.
    #[serde(with = "humantime_secs")]
    pub terminated_instance_retention: Duration,
    /// YAML file with rule-based fault injection.
    pub test_profile_path: Option<PathBuf>,
    /// Ambient addition: level passed to [`crate::logging::init`] by
    /// embedders that want this crate to install their subscriber.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            region: String::from("us-east-1"),
            instance_network: None,
            exit_resource_mode: ExitMode::default(),
            spot_reclaim_after: Duration::from_secs(0),
            spot_reclaim_notice: Duration::from_secs(0),
            terminated_instance_retention: Duration::from_secs(300),
            test_profile_path: None,
            log_level: String::from("info"),
        }
    }
}

impl EngineConfig {
    /// Default availability zone for the configured region, e.g. `us-east-1a`.
    pub fn default_az(&self) -> String {
        format!("{}a", self.region)
    }

    /// Load configuration from compiled-in defaults, an optional file, and
    /// environment variables prefixed `EC2EMU_` (e.g. `EC2EMU_REGION`).
    pub fn load(file: Option<&PathBuf>) -> crate::error::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default()).map_err(|e| {
                crate::error::Error::Internal(format!("default config source: {e}"))
            })?);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path.as_path()).required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("EC2EMU").separator("_"));

        let built = builder
            .build()
            .map_err(|e| crate::error::Error::Internal(format!("config build: {e}")))?;

        built
            .try_deserialize()
            .map_err(|e| crate::error::Error::Internal(format!("config deserialize: {e}")))
    }
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.region, "us-east-1");
        assert_eq!(cfg.default_az(), "us-east-1a");
        assert_eq!(cfg.exit_resource_mode, ExitMode::Cleanup);
        assert!(cfg.instance_network.is_none());
    }

    #[test]
    fn load_with_no_file_falls_back_to_defaults() {
        let cfg = EngineConfig::load(None).unwrap();
        assert_eq!(cfg.region, "us-east-1");
    }
}
