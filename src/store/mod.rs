// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory keyed store for resources and their attributes.
//!
//! The store has no synchronization of its own: every call happens while
//! the dispatch mutex is held, so it is free to be a plain `HashMap`
//! behind `&mut self`. It also keeps no cross-resource indexes;
//! `list_by_type` and the filter engine in [`crate::dispatcher::filters`]
//! both scan and filter.

pub mod attrs;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::Utc;

use crate::error::{Error, Result};

/// The four resource kinds this store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Instance,
    Volume,
    LaunchTemplate,
    AutoScalingGroup,
}

impl ResourceType {
    pub fn id_prefix(self) -> Option<&'static str> {
        match self {
            ResourceType::Instance => Some("i-"),
            ResourceType::Volume => Some("vol-"),
            ResourceType::LaunchTemplate => Some("lt-"),
            // ASG ids are the bare group name.
            ResourceType::AutoScalingGroup => None,
        }
    }
}

/// A resource identity, unique across the whole store regardless of type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        ResourceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        ResourceId(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        ResourceId(s)
    }
}

/// An attribute removal request. `value: None` (or an empty string) is a
/// wildcard: the key is removed regardless of its current value. A
/// concrete value only removes the attribute if it currently matches,
/// mirroring DeleteTags semantics.
#[derive(Debug, Clone)]
pub struct AttributeRemoval {
    pub key: String,
    pub value: Option<String>,
}

impl AttributeRemoval {
    pub fn wildcard(key: impl Into<String>) -> Self {
        AttributeRemoval {
            key: key.into(),
            value: None,
        }
    }

    pub fn exact(key: impl Into<String>, value: impl Into<String>) -> Self {
        AttributeRemoval {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    fn is_wildcard(&self) -> bool {
        matches!(&self.value, None) || matches!(&self.value, Some(v) if v.is_empty())
    }
}

#[derive(Debug, Clone)]
struct StoredResource {
    kind: ResourceType,
    attributes: BTreeMap<String, String>,
}

/// In-memory keyed store for resources and their attributes.
#[derive(Debug, Default)]
pub struct ResourceStore {
    resources: HashMap<ResourceId, StoredResource>,
}

impl ResourceStore {
    pub fn new() -> Self {
        ResourceStore::default()
    }

    /// Register a new resource. Fails if `id` already exists so the caller
    /// (the Dispatcher) never silently clobbers an existing entity.
    pub fn register(&mut self, id: ResourceId, kind: ResourceType) -> Result<()> {
        if self.resources.contains_key(&id) {
            return Err(Error::AlreadyExists(format!(
                "resource {id} already registered"
            )));
        }
        self.resources.insert(
            id,
            StoredResource {
                kind,
                attributes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn exists(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }

    pub fn kind_of(&self, id: &ResourceId) -> Option<ResourceType> {
        self.resources.get(id).map(|r| r.kind)
    }

    /// Remove a resource entirely. Fails if it is not present.
    pub fn remove(&mut self, id: &ResourceId) -> Result<()> {
        self.resources
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::Internal(format!("resource {id} not found")))
    }

    /// All ids of a given type, sorted.
    pub fn list_by_type(&self, kind: ResourceType) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self
            .resources
            .iter()
            .filter(|(_, r)| r.kind == kind)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Upsert a batch of attributes. Never partially applies: if the
    /// resource is missing, nothing is written.
    pub fn set_attributes<I, K, V>(&mut self, id: &ResourceId, batch: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let batch: Vec<(String, String)> =
            batch.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        let resource = self
            .resources
            .get_mut(id)
            .ok_or_else(|| Error::Internal(format!("resource {id} not found")))?;
        for (k, v) in batch {
            resource.attributes.insert(k, v);
        }
        Ok(())
    }

    /// Remove attributes matching `removals`. See [`AttributeRemoval`] for
    /// wildcard-vs-exact semantics.
    pub fn remove_attributes(
        &mut self,
        id: &ResourceId,
        removals: &[AttributeRemoval],
    ) -> Result<()> {
        let resource = self
            .resources
            .get_mut(id)
            .ok_or_else(|| Error::Internal(format!("resource {id} not found")))?;
        for removal in removals {
            if removal.is_wildcard() {
                resource.attributes.remove(&removal.key);
            } else if resource.attributes.get(&removal.key) == removal.value.as_ref() {
                resource.attributes.remove(&removal.key);
            }
        }
        Ok(())
    }

    /// A stable, key-sorted attribute list.
    pub fn get_attributes(&self, id: &ResourceId) -> Result<Vec<(String, String)>> {
        let resource = self
            .resources
            .get(id)
            .ok_or_else(|| Error::Internal(format!("resource {id} not found")))?;
        Ok(resource
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    pub fn get_attribute(&self, id: &ResourceId, key: &str) -> Option<String> {
        self.resources.get(id)?.attributes.get(key).cloned()
    }

    /// Marks an instance terminated in place rather than removing it: the
    /// record (and its last-known attributes) survive until
    /// [`Self::prune_terminated`] reaps them, so a Describe shortly after
    /// termination still reports `terminated` with a reason code. Clears
    /// ASG membership immediately so the ASG loop stops counting it.
    pub fn mark_terminated(&mut self, id: &ResourceId, reason_code: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.set_attributes(
            id,
            [
                (attrs::keys::STATE_NAME.to_string(), "terminated".to_string()),
                (attrs::keys::STATE_CODE.to_string(), "48".to_string()),
                (attrs::keys::STATE_REASON_CODE.to_string(), reason_code.to_string()),
                (attrs::keys::TERMINATED_AT.to_string(), now),
            ],
        )?;
        self.remove_attributes(
            id,
            &[
                AttributeRemoval::wildcard(attrs::keys::ASG_NAME),
                AttributeRemoval::wildcard(attrs::keys::WARM_POOL_FLAG),
            ],
        )
    }

    /// Reaps instance records that have been terminated for longer than
    /// `ttl`. Called opportunistically by the Dispatcher before each
    /// handler and by the reconciler loop.
    pub fn prune_terminated(&mut self, ttl: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_default();
        let expired: Vec<ResourceId> = self
            .resources
            .iter()
            .filter(|(_, r)| r.kind == ResourceType::Instance)
            .filter(|(_, r)| {
                r.attributes.get(attrs::keys::STATE_NAME).map(String::as_str) == Some("terminated")
            })
            .filter(|(_, r)| {
                r.attributes
                    .get(attrs::keys::TERMINATED_AT)
                    .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc) < cutoff)
                    .unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.resources.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_duplicate() {
        let mut store = ResourceStore::new();
        let id = ResourceId::from("i-1");
        store.register(id.clone(), ResourceType::Instance).unwrap();
        let err = store.register(id, ResourceType::Instance).unwrap_err();
        assert_eq!(err.code(), "AlreadyExists");
    }

    #[test]
    fn set_attributes_fails_without_partial_writes() {
        let mut store = ResourceStore::new();
        let missing = ResourceId::from("i-missing");
        let err = store
            .set_attributes(&missing, vec![("k".to_string(), "v".to_string())])
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(store.get_attributes(&missing).is_err());
    }

    #[test]
    fn remove_attributes_wildcard_vs_exact() {
        let mut store = ResourceStore::new();
        let id = ResourceId::from("i-1");
        store.register(id.clone(), ResourceType::Instance).unwrap();
        store
            .set_attributes(&id, vec![("tag:Name".to_string(), "app".to_string())])
            .unwrap();

        // Exact removal with the wrong value is a no-op.
        store
            .remove_attributes(&id, &[AttributeRemoval::exact("tag:Name", "other")])
            .unwrap();
        assert_eq!(store.get_attribute(&id, "tag:Name").as_deref(), Some("app"));

        // Wildcard removal always succeeds.
        store
            .remove_attributes(&id, &[AttributeRemoval::wildcard("tag:Name")])
            .unwrap();
        assert_eq!(store.get_attribute(&id, "tag:Name"), None);
    }

    #[test]
    fn mark_terminated_clears_asg_membership_but_keeps_the_record() {
        let mut store = ResourceStore::new();
        let id = ResourceId::from("i-1");
        store.register(id.clone(), ResourceType::Instance).unwrap();
        store
            .set_attributes(&id, [(attrs::keys::ASG_NAME.to_string(), "web".to_string())])
            .unwrap();

        store.mark_terminated(&id, "Client.UserInitiatedShutdown").unwrap();

        assert_eq!(
            store.get_attribute(&id, attrs::keys::STATE_NAME).as_deref(),
            Some("terminated")
        );
        assert_eq!(store.get_attribute(&id, attrs::keys::ASG_NAME), None);
        assert!(store.exists(&id));
    }

    #[test]
    fn prune_terminated_reaps_after_ttl() {
        let mut store = ResourceStore::new();
        let id = ResourceId::from("i-1");
        store.register(id.clone(), ResourceType::Instance).unwrap();
        store.mark_terminated(&id, "scale-in").unwrap();

        store.prune_terminated(Duration::from_secs(3600));
        assert!(store.exists(&id));

        store.prune_terminated(Duration::from_secs(0));
        assert!(!store.exists(&id));
    }

    #[test]
    fn list_by_type_is_sorted() {
        let mut store = ResourceStore::new();
        for id in ["i-3", "i-1", "i-2"] {
            store
                .register(ResourceId::from(id), ResourceType::Instance)
                .unwrap();
        }
        let ids = store.list_by_type(ResourceType::Instance);
        assert_eq!(
            ids,
            vec![
                ResourceId::from("i-1"),
                ResourceId::from("i-2"),
                ResourceId::from("i-3")
            ]
        );
    }
}
