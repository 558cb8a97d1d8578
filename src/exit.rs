// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Exit Resource Manager: runs the configured shutdown policy for resources
//! this engine owns.

use crate::config::ExitMode;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::imds::ImdsState;
use crate::store::{ResourceStore, ResourceType};

/// Runs the configured shutdown policy. Called once, from
/// `Dispatcher::shutdown`.
pub async fn run(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    imds: &ImdsState,
    mode: ExitMode,
) -> Result<()> {
    match mode {
        ExitMode::Cleanup => cleanup(store, executor, imds).await,
        ExitMode::Assert => assert_clean(store, executor).await,
        ExitMode::Keep => executor.disconnect().await.map_err(Error::from),
    }
}

async fn cleanup(store: &mut ResourceStore, executor: &dyn Executor, imds: &ImdsState) -> Result<()> {
    let groups = store.list_by_type(ResourceType::AutoScalingGroup);
    for group in groups {
        crate::asg::delete_group(store, executor, imds, group.as_str(), true).await?;
    }

    let owned = executor.list_owned_instances().await.map_err(Error::from)?;
    if !owned.is_empty() {
        executor.terminate_instances(&owned).await.map_err(Error::from)?;
    }
    for id in &owned {
        imds.deregister_instance(id);
    }

    for kind in [
        ResourceType::Instance,
        ResourceType::Volume,
        ResourceType::LaunchTemplate,
        ResourceType::AutoScalingGroup,
    ] {
        for id in store.list_by_type(kind) {
            let _ = store.remove(&id);
        }
    }

    executor.close().await.map_err(Error::from)
}

async fn assert_clean(store: &ResourceStore, executor: &dyn Executor) -> Result<()> {
    let mut leftovers = Vec::new();
    for kind in [
        ResourceType::Instance,
        ResourceType::Volume,
        ResourceType::LaunchTemplate,
        ResourceType::AutoScalingGroup,
    ] {
        let count = store.list_by_type(kind).len();
        if count > 0 {
            leftovers.push(format!("{count} {kind:?} resources"));
        }
    }
    let owned = executor.list_owned_instances().await.map_err(Error::from)?;
    if !owned.is_empty() {
        leftovers.push(format!("{} runtime-owned instances", owned.len()));
    }

    if !leftovers.is_empty() {
        return Err(Error::ResourceInUse(format!(
            "assert-mode shutdown found leftover resources: {}",
            leftovers.join(", ")
        )));
    }
    executor.disconnect().await.map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::fake::FakeExecutor;
    use crate::store::ResourceId;

    #[tokio::test]
    async fn assert_mode_fails_with_leftover_instances() {
        let executor = FakeExecutor::new();
        executor.create_instances("ami", "t3.micro", 1, "").await.unwrap();
        let store = ResourceStore::new();
        let err = assert_clean(&store, &*executor).await.unwrap_err();
        assert_eq!(err.code(), "ResourceInUse");
    }

    #[tokio::test]
    async fn cleanup_terminates_owned_instances_and_clears_store() {
        let executor = FakeExecutor::new();
        let ids = executor.create_instances("ami", "t3.micro", 2, "").await.unwrap();
        let mut store = ResourceStore::new();
        for id in &ids {
            store.register(ResourceId::from(id.as_str()), ResourceType::Instance).unwrap();
        }
        let imds = ImdsState::new();

        cleanup(&mut store, &*executor, &imds).await.unwrap();

        assert!(executor.list_owned_instances().await.unwrap().is_empty());
        assert!(store.list_by_type(ResourceType::Instance).is_empty());
    }
}
