// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Rule-based fault/latency injection, loaded from the `test-profile-path`
//! config knob.
//!
//! Rules are keyed by action name and an optional instance-matching
//! predicate (by image id, since that's the one field every creation path
//! shares). RunInstances' staged transaction and the spot reclaim scheduler
//! are the only consumers.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct FaultRule {
    pub action: String,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub pre_delay_ms: Option<u64>,
    #[serde(default)]
    pub post_delay_ms: Option<u64>,
    /// Overrides a RunInstances request's resolved spot reclaim `after`,
    /// for deterministically exercising the reclaim timer without waiting
    /// on real wall-clock randomness.
    #[serde(default)]
    pub force_spot_reclaim_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FaultProfile {
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("read fault profile {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Internal(format!("parse fault profile {}: {e}", path.display())))
    }

    fn matching(&self, action: &str, image_id: Option<&str>) -> Option<&FaultRule> {
        self.rules.iter().find(|rule| {
            rule.action == action
                && rule
                    .image_id
                    .as_deref()
                    .map(|want| Some(want) == image_id)
                    .unwrap_or(true)
        })
    }

    pub fn pre_delay(&self, action: &str, image_id: Option<&str>) -> Option<Duration> {
        self.matching(action, image_id)?.pre_delay_ms.map(Duration::from_millis)
    }

    pub fn post_delay(&self, action: &str, image_id: Option<&str>) -> Option<Duration> {
        self.matching(action, image_id)?.post_delay_ms.map(Duration::from_millis)
    }

    pub fn forced_spot_reclaim_after(&self, action: &str, image_id: Option<&str>) -> Option<Duration> {
        self.matching(action, image_id)?
            .force_spot_reclaim_after_ms
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_by_action_and_optional_image() {
        let profile = FaultProfile {
            rules: vec![FaultRule {
                action: "RunInstances".to_string(),
                image_id: Some("ami-slow".to_string()),
                pre_delay_ms: Some(50),
                post_delay_ms: None,
                force_spot_reclaim_after_ms: None,
            }],
        };
        assert_eq!(
            profile.pre_delay("RunInstances", Some("ami-slow")),
            Some(Duration::from_millis(50))
        );
        assert_eq!(profile.pre_delay("RunInstances", Some("ami-fast")), None);
        assert_eq!(profile.pre_delay("StopInstances", Some("ami-slow")), None);
    }
}
