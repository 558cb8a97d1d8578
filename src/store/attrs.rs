// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Attribute key constants and typed accessors.
//!
//! Attribute values are scalar strings or JSON-encoded composites, and the
//! serializers/parsers live here so handlers never touch raw encoding.
//! Everything below is either a `&str` constant naming a scalar attribute,
//! or a pair of methods on [`super::ResourceStore`] that hide a
//! `serde_json` round trip behind a typed signature.

use serde::{Deserialize, Serialize};

use super::{ResourceId, ResourceStore};
use crate::error::{Error, Result};

/// Reserved prefix for tag attributes so `is_tag` is O(1).
pub const TAG_PREFIX: &str = "tag:";

pub fn is_tag(attr_key: &str) -> bool {
    attr_key.starts_with(TAG_PREFIX)
}

pub fn tag_key(attr_key: &str) -> &str {
    attr_key.strip_prefix(TAG_PREFIX).unwrap_or(attr_key)
}

pub fn tag_attr(tag_key: &str) -> String {
    format!("{TAG_PREFIX}{tag_key}")
}

pub mod keys {
    pub const AVAILABILITY_ZONE: &str = "availability-zone";
    pub const KEY_NAME: &str = "key-name";
    pub const USER_DATA: &str = "user-data";
    pub const INSTANCE_TYPE: &str = "instance-type";
    pub const IMAGE_ID: &str = "image-id";
    pub const STATE_NAME: &str = "instance-state-name";
    pub const STATE_CODE: &str = "state-code";
    pub const STATE_MESSAGE: &str = "state-message";
    pub const STATE_TIME: &str = "state-time";
    pub const STATE_REASON_CODE: &str = "state-reason-code";
    pub const PRIVATE_IP: &str = "private-ip-address";
    pub const PUBLIC_IP: &str = "ip-address";
    pub const PRIVATE_DNS: &str = "private-dns-name";
    pub const PUBLIC_DNS: &str = "dns-name";
    pub const ASG_NAME: &str = "asg-name";
    pub const WARM_POOL_FLAG: &str = "warm-pool";
    pub const TERMINATED_AT: &str = "terminated-at";
    pub const LAUNCH_TIME: &str = "launch-time";
    pub const BLOCK_DEVICE_MAPPINGS: &str = "block-device-mappings";
    pub const SPOT_INSTANCE: &str = "spot-instance";

    pub const VOL_SIZE_BYTES: &str = "size-bytes";
    pub const VOL_ENCRYPTED: &str = "encrypted";
    pub const VOL_IOPS: &str = "iops";
    pub const VOL_THROUGHPUT: &str = "throughput";
    pub const VOL_KMS_KEY: &str = "kms-key-id";
    pub const VOL_ATTACHED_INSTANCE: &str = "attached-instance";
    pub const VOL_ATTACHED_DEVICE: &str = "attached-device";
    pub const VOL_DELETE_ON_TERMINATION: &str = "delete-on-termination";

    pub const LT_NAME: &str = "name";
    pub const LT_DEFAULT_VERSION: &str = "default-version";
    pub const LT_VERSIONS: &str = "versions";

    pub const ASG_MIN: &str = "min";
    pub const ASG_MAX: &str = "max";
    pub const ASG_DESIRED: &str = "desired";
    pub const ASG_CREATED_TIME: &str = "created-time";
    pub const ASG_DEFAULT_COOLDOWN: &str = "default-cooldown";
    pub const ASG_HEALTH_CHECK_TYPE: &str = "health-check-type";
    pub const ASG_VPC_ZONES: &str = "vpc-zones";
    pub const ASG_LAUNCH_TEMPLATE: &str = "launch-template";
    pub const ASG_WARM_POOL: &str = "warm-pool-config";
}

/// A single block-device mapping, embedded as JSON on instances and
/// launch-template versions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockDeviceMapping {
    pub device_name: String,
    pub volume_id: Option<String>,
    pub size_bytes: u64,
    pub delete_on_termination: bool,
}

/// A launch template's per-version payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchTemplateVersion {
    pub version: u32,
    pub image_id: String,
    pub instance_type: String,
    pub user_data: String,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

/// Warm pool state a group's instances can be parked in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WarmPoolState {
    Stopped,
    Running,
    Hibernated,
}

/// Warm pool lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WarmPoolStatus {
    Active,
    PendingDelete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WarmPoolConfig {
    pub min: u32,
    pub max_prepared: Option<u32>,
    pub pool_state: WarmPoolState,
    pub status: WarmPoolStatus,
    pub reuse_on_scale_in: bool,
}

impl ResourceStore {
    /// All tags on a resource, as `(key, value)` with the `tag:` prefix
    /// already stripped.
    pub fn get_tags(&self, id: &ResourceId) -> Result<Vec<(String, String)>> {
        Ok(self
            .get_attributes(id)?
            .into_iter()
            .filter(|(k, _)| is_tag(k))
            .map(|(k, v)| (tag_key(&k).to_string(), v))
            .collect())
    }

    pub fn set_tags<I>(&mut self, id: &ResourceId, tags: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.set_attributes(id, tags.into_iter().map(|(k, v)| (tag_attr(&k), v)))
    }

    pub fn get_block_device_mappings(&self, id: &ResourceId) -> Result<Vec<BlockDeviceMapping>> {
        match self.get_attribute(id, keys::BLOCK_DEVICE_MAPPINGS) {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| Error::Internal(format!("corrupt block-device-mappings: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    pub fn set_block_device_mappings(
        &mut self,
        id: &ResourceId,
        mappings: &[BlockDeviceMapping],
    ) -> Result<()> {
        let json = serde_json::to_string(mappings)
            .map_err(|e| Error::Internal(format!("encode block-device-mappings: {e}")))?;
        self.set_attributes(id, [(keys::BLOCK_DEVICE_MAPPINGS.to_string(), json)])
    }

    pub fn get_launch_template_versions(
        &self,
        id: &ResourceId,
    ) -> Result<Vec<LaunchTemplateVersion>> {
        match self.get_attribute(id, keys::LT_VERSIONS) {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| Error::Internal(format!("corrupt launch template versions: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    pub fn set_launch_template_versions(
        &mut self,
        id: &ResourceId,
        versions: &[LaunchTemplateVersion],
    ) -> Result<()> {
        let json = serde_json::to_string(versions)
            .map_err(|e| Error::Internal(format!("encode launch template versions: {e}")))?;
        self.set_attributes(id, [(keys::LT_VERSIONS.to_string(), json)])
    }

    pub fn get_warm_pool_config(&self, id: &ResourceId) -> Result<Option<WarmPoolConfig>> {
        match self.get_attribute(id, keys::ASG_WARM_POOL) {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| Error::Internal(format!("corrupt warm pool config: {e}"))),
            None => Ok(None),
        }
    }

    pub fn set_warm_pool_config(
        &mut self,
        id: &ResourceId,
        config: Option<&WarmPoolConfig>,
    ) -> Result<()> {
        match config {
            Some(cfg) => {
                let json = serde_json::to_string(cfg)
                    .map_err(|e| Error::Internal(format!("encode warm pool config: {e}")))?;
                self.set_attributes(id, [(keys::ASG_WARM_POOL.to_string(), json)])
            }
            None => self.remove_attributes(
                id,
                &[super::AttributeRemoval::wildcard(keys::ASG_WARM_POOL)],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ResourceType;

    #[test]
    fn tag_round_trip() {
        let mut store = ResourceStore::new();
        let id = ResourceId::from("i-1");
        store.register(id.clone(), ResourceType::Instance).unwrap();
        store
            .set_tags(&id, [("Name".to_string(), "app".to_string())])
            .unwrap();
        assert_eq!(
            store.get_tags(&id).unwrap(),
            vec![("Name".to_string(), "app".to_string())]
        );
    }

    #[test]
    fn block_device_mappings_round_trip() {
        let mut store = ResourceStore::new();
        let id = ResourceId::from("vol-owner");
        store.register(id.clone(), ResourceType::Instance).unwrap();
        let bdm = vec![BlockDeviceMapping {
            device_name: "/dev/sda1".into(),
            volume_id: Some("vol-1".into()),
            size_bytes: 8 * 1024 * 1024 * 1024,
            delete_on_termination: true,
        }];
        store.set_block_device_mappings(&id, &bdm).unwrap();
        assert_eq!(store.get_block_device_mappings(&id).unwrap(), bdm);
    }

    #[test]
    fn warm_pool_config_round_trip_and_clear() {
        let mut store = ResourceStore::new();
        let id = ResourceId::from("web");
        store
            .register(id.clone(), ResourceType::AutoScalingGroup)
            .unwrap();
        assert!(store.get_warm_pool_config(&id).unwrap().is_none());

        let cfg = WarmPoolConfig {
            min: 1,
            max_prepared: None,
            pool_state: WarmPoolState::Stopped,
            status: WarmPoolStatus::Active,
            reuse_on_scale_in: false,
        };
        store.set_warm_pool_config(&id, Some(&cfg)).unwrap();
        assert_eq!(store.get_warm_pool_config(&id).unwrap(), Some(cfg));

        store.set_warm_pool_config(&id, None).unwrap();
        assert!(store.get_warm_pool_config(&id).unwrap().is_none());
    }
}
