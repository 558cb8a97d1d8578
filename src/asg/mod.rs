// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Auto Scaling control loop: `scale_to`, warm-pool reconciliation, and
//! member discovery.
//!
//! Every entry point here runs with the dispatch lock held — callers are
//! either a handler in [`crate::dispatcher`] or the reconciler in
//! [`crate::lifecycle`]. Runtime truth wins: membership is re-derived from
//! an executor Describe on every call rather than trusted from the store
//! alone.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorError, HealthStatus, RuntimeInstanceState};
use crate::imds::ImdsState;
use crate::store::attrs::{keys, WarmPoolConfig, WarmPoolState, WarmPoolStatus};
use crate::store::{AttributeRemoval, ResourceId, ResourceStore, ResourceType};

use crate::dispatcher::action::{AsgMemberView, AsgView, WarmPoolView};

/// Reconcile one group's runtime population with its recorded desired
/// capacity, expressed as `scale_to(group, group.desired)`.
pub async fn reconcile(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    imds: &ImdsState,
    config: &EngineConfig,
    group: &str,
) -> Result<()> {
    let gid = ResourceId::from(group);
    let desired = read_u32(store, &gid, keys::ASG_DESIRED)?;
    scale_to(store, executor, imds, config, group, desired).await
}

/// Drives a group's live (non warm-pool) membership to exactly `desired`,
/// then reconciles the warm pool.
pub async fn scale_to(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    imds: &ImdsState,
    config: &EngineConfig,
    group: &str,
    desired: u32,
) -> Result<()> {
    let gid = ResourceId::from(group);
    if !store.exists(&gid) {
        return Err(Error::AsgNotFound(group.to_string()));
    }

    let (mut members, mut warm_members) = discover_members(store, executor, imds, group).await?;

    if (members.len() as u32) < desired {
        let shortfall = desired - members.len() as u32;
        let promoted =
            promote_warm_pool(store, executor, &mut warm_members, shortfall).await?;
        members.extend(promoted);

        let still_needed = desired.saturating_sub(members.len() as u32);
        if still_needed > 0 {
            let created =
                launch_members(store, executor, config, group, still_needed, false).await?;
            members.extend(created);
        }
    } else if (members.len() as u32) > desired {
        let excess = members.len() as u32 - desired;
        members.sort();
        let reuse = read_warm_pool_reuse(store, &gid)?;
        let to_remove: Vec<String> = members.drain(..excess as usize).collect();
        for id in &to_remove {
            if reuse {
                let pool_state = store
                    .get_warm_pool_config(&gid)?
                    .map(|c| c.pool_state)
                    .unwrap_or(WarmPoolState::Stopped);
                move_to_warm_pool(store, executor, id, pool_state).await?;
                warm_members.push(id.clone());
            } else {
                terminate_member(store, executor, imds, id, "scale-in").await?;
            }
        }
    }

    store.set_attributes(&gid, [(keys::ASG_DESIRED, desired.to_string())])?;
    reconcile_warm_pool(store, executor, imds, config, group, &warm_members).await?;
    Ok(())
}

/// Scans the store for a group's recorded membership, describes it at the
/// runtime, prunes vanished ids, and terminates any that are alive but not
/// running or reported unhealthy.
async fn discover_members(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    imds: &ImdsState,
    group: &str,
) -> Result<(Vec<String>, Vec<String>)> {
    let mut member_ids = Vec::new();
    let mut warm_ids = Vec::new();
    for id in store.list_by_type(ResourceType::Instance) {
        if store.get_attribute(&id, keys::ASG_NAME).as_deref() != Some(group) {
            continue;
        }
        if store.get_attribute(&id, keys::WARM_POOL_FLAG).as_deref() == Some("true") {
            warm_ids.push(id.as_str().to_string());
        } else {
            member_ids.push(id.as_str().to_string());
        }
    }

    let all: Vec<String> = member_ids.iter().chain(warm_ids.iter()).cloned().collect();
    let described = executor.describe_instances(&all).await.map_err(Error::from)?;
    let described: HashMap<&str, _> = described.iter().map(|d| (d.id.as_str(), d)).collect();

    let mut alive_members = Vec::new();
    for id in &member_ids {
        match described.get(id.as_str()) {
            None => {
                cleanup_instance(store, executor, imds, id, "Server.InstanceRuntimeGone").await?
            }
            Some(desc) => {
                if desc.state != RuntimeInstanceState::Running
                    || desc.health == HealthStatus::Unhealthy
                {
                    terminate_member(store, executor, imds, id, "replacement").await?;
                } else {
                    alive_members.push(id.clone());
                }
            }
        }
    }

    let mut alive_warm = Vec::new();
    for id in &warm_ids {
        match described.get(id.as_str()) {
            None => {
                cleanup_instance(store, executor, imds, id, "Server.InstanceRuntimeGone").await?
            }
            Some(_) => alive_warm.push(id.clone()),
        }
    }

    Ok((alive_members, alive_warm))
}

/// Volume delete-on-termination, terminal-state marking, and IMDS clear for
/// an instance the runtime no longer has. The store record itself survives
/// under [`ResourceStore::mark_terminated`]'s TTL, see `DESIGN.md`.
async fn cleanup_instance(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    imds: &ImdsState,
    id: &str,
    reason_code: &str,
) -> Result<()> {
    let rid = ResourceId::from(id);
    if store.exists(&rid) {
        for bdm in store.get_block_device_mappings(&rid).unwrap_or_default() {
            if bdm.delete_on_termination {
                if let Some(volume_id) = bdm.volume_id {
                    let vrid = ResourceId::from(volume_id.as_str());
                    match executor.delete_volume(&volume_id).await {
                        Ok(()) | Err(ExecutorError::VolumeNotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                    if store.exists(&vrid) {
                        store.remove(&vrid)?;
                    }
                }
            }
        }
        store.mark_terminated(&rid, reason_code)?;
    }
    imds.deregister_instance(id);
    Ok(())
}

/// `cause` is one of `scale-in`, `replacement`, `warm-pool-shrink`, or
/// `group-delete`; for `replacement` the reason code is formatted as
/// `replacement:<instance>:<cause>`, otherwise the cause is used as the
/// reason code directly.
async fn terminate_member(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    imds: &ImdsState,
    id: &str,
    cause: &str,
) -> Result<()> {
    tracing::info!(instance = id, cause, "terminating group member");
    match executor.terminate_instances(&[id.to_string()]).await {
        Ok(_) | Err(ExecutorError::InstanceNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    let reason = if cause == "replacement" {
        format!("replacement:{id}:unhealthy-or-stopped")
    } else {
        cause.to_string()
    };
    cleanup_instance(store, executor, imds, id, &reason).await
}

async fn promote_warm_pool(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    warm_ids: &mut Vec<String>,
    shortfall: u32,
) -> Result<Vec<String>> {
    warm_ids.sort();
    let take = (shortfall as usize).min(warm_ids.len());
    let promoted: Vec<String> = warm_ids.drain(..take).collect();
    if promoted.is_empty() {
        return Ok(promoted);
    }
    executor.start_instances(&promoted).await.map_err(Error::from)?;
    for id in &promoted {
        let rid = ResourceId::from(id.as_str());
        store.remove_attributes(&rid, &[AttributeRemoval::wildcard(keys::WARM_POOL_FLAG)])?;
    }
    Ok(promoted)
}

async fn move_to_warm_pool(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    id: &str,
    pool_state: WarmPoolState,
) -> Result<()> {
    let rid = ResourceId::from(id);
    store.set_attributes(&rid, [(keys::WARM_POOL_FLAG, "true")])?;
    match pool_state {
        WarmPoolState::Running => {
            executor.start_instances(&[id.to_string()]).await.map_err(Error::from)?;
        }
        WarmPoolState::Stopped | WarmPoolState::Hibernated => {
            executor
                .stop_instances(&[id.to_string()], false)
                .await
                .map_err(Error::from)?;
        }
    }
    Ok(())
}

/// Launches `count` fresh instances from the group's launch template,
/// tagging them as members (or warm-pool members when `warm` is set).
async fn launch_members(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    config: &EngineConfig,
    group: &str,
    count: u32,
    warm: bool,
) -> Result<Vec<String>> {
    let gid = ResourceId::from(group);
    let lt_id = store
        .get_attribute(&gid, keys::ASG_LAUNCH_TEMPLATE)
        .ok_or_else(|| Error::Internal(format!("group {group} has no launch template")))?;
    let lt_rid = ResourceId::from(lt_id.as_str());
    let default_version: u32 = store
        .get_attribute(&lt_rid, keys::LT_DEFAULT_VERSION)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);
    let version = store
        .get_launch_template_versions(&lt_rid)?
        .into_iter()
        .find(|v| v.version == default_version)
        .ok_or_else(|| Error::Internal(format!("launch template {lt_id} missing default version")))?;

    let ids = executor
        .create_instances(&version.image_id, &version.instance_type, count, &version.user_data)
        .await
        .map_err(Error::from)?;

    let az = config.default_az();
    for id in &ids {
        let rid = ResourceId::from(id.as_str());
        store.register(rid.clone(), ResourceType::Instance)?;
        let mut attrs = vec![
            (keys::ASG_NAME.to_string(), group.to_string()),
            (keys::AVAILABILITY_ZONE.to_string(), az.clone()),
            (keys::IMAGE_ID.to_string(), version.image_id.clone()),
            (keys::INSTANCE_TYPE.to_string(), version.instance_type.clone()),
        ];
        if warm {
            attrs.push((keys::WARM_POOL_FLAG.to_string(), "true".to_string()));
        }
        store.set_attributes(&rid, attrs)?;
        store.set_block_device_mappings(&rid, &version.block_device_mappings)?;
    }
    executor.start_instances(&ids).await.map_err(Error::from)?;
    // Pool state (running/stopped/hibernated) is applied by the caller via
    // `reconcile_warm_pool`, not here.
    Ok(ids)
}

/// Warm-pool target capacity: `max(max_prepared - desired, warm_min)` when
/// a prepared-capacity ceiling is configured. Without one,
/// reconciliation only tops the pool up to `warm_min` and never shrinks it
/// below whatever scale-in reuse has already parked there — otherwise every
/// reconcile pass would immediately terminate instances scale-in just moved
/// into the pool.
fn warm_pool_target(desired: u32, current: u32, config: &WarmPoolConfig) -> u32 {
    match config.max_prepared {
        Some(max_prepared) => max_prepared.saturating_sub(desired).max(config.min),
        None => current.max(config.min),
    }
}

async fn reconcile_warm_pool(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    imds: &ImdsState,
    config: &EngineConfig,
    group: &str,
    warm_members: &[String],
) -> Result<()> {
    let gid = ResourceId::from(group);
    let Some(pool) = store.get_warm_pool_config(&gid)? else {
        return Ok(());
    };
    let desired = read_u32(store, &gid, keys::ASG_DESIRED)?;
    let current = warm_members.len() as u32;
    let target = warm_pool_target(desired, current, &pool);

    if current < target {
        let shortfall = target - current;
        let created = launch_members(store, executor, config, group, shortfall, true).await?;
        for id in &created {
            move_to_warm_pool(store, executor, id, pool.pool_state).await?;
        }
    } else if current > target {
        let mut excess_ids = warm_members.to_vec();
        excess_ids.sort();
        let excess = (current - target) as usize;
        for id in &excess_ids[..excess] {
            terminate_member(store, executor, imds, id, "warm-pool-shrink").await?;
        }
    }
    Ok(())
}

/// Force-delete terminates every member (including warm pool) first;
/// without force a non-empty group is `ResourceInUse`.
pub async fn delete_group(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    imds: &ImdsState,
    group: &str,
    force: bool,
) -> Result<()> {
    let gid = ResourceId::from(group);
    if !store.exists(&gid) {
        return Err(Error::AsgNotFound(group.to_string()));
    }

    let members: Vec<ResourceId> = store
        .list_by_type(ResourceType::Instance)
        .into_iter()
        .filter(|id| store.get_attribute(id, keys::ASG_NAME).as_deref() == Some(group))
        .collect();

    if !members.is_empty() && !force {
        return Err(Error::ResourceInUse(format!(
            "auto scaling group {group} still has members"
        )));
    }

    for id in members {
        terminate_member(store, executor, imds, id.as_str(), "group-delete").await?;
    }
    store.remove(&gid)?;
    Ok(())
}

/// Removes group membership without terminating the instance. Never
/// touches warm-pool members.
pub async fn detach_instances(
    store: &mut ResourceStore,
    group: &str,
    ids: &[String],
    decrement_desired: bool,
) -> Result<Vec<String>> {
    let gid = ResourceId::from(group);
    if !store.exists(&gid) {
        return Err(Error::AsgNotFound(group.to_string()));
    }
    let mut detached = Vec::new();
    for id in ids {
        let rid = ResourceId::from(id.as_str());
        if store.get_attribute(&rid, keys::ASG_NAME).as_deref() == Some(group)
            && store.get_attribute(&rid, keys::WARM_POOL_FLAG).as_deref() != Some("true")
        {
            store.remove_attributes(&rid, &[AttributeRemoval::wildcard(keys::ASG_NAME)])?;
            detached.push(id.clone());
        }
    }
    if decrement_desired && !detached.is_empty() {
        let desired = read_u32(store, &gid, keys::ASG_DESIRED)?;
        let new_desired = desired.saturating_sub(detached.len() as u32);
        store.set_attributes(&gid, [(keys::ASG_DESIRED.to_string(), new_desired.to_string())])?;
    }
    Ok(detached)
}

/// Creates or replaces the pool's config, then reconciles it immediately
/// against the current desired capacity.
pub async fn put_warm_pool(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    imds: &ImdsState,
    config: &EngineConfig,
    group: &str,
    pool: WarmPoolConfig,
) -> Result<()> {
    let gid = ResourceId::from(group);
    if !store.exists(&gid) {
        return Err(Error::AsgNotFound(group.to_string()));
    }
    store.set_warm_pool_config(&gid, Some(&pool))?;
    reconcile(store, executor, imds, config, group).await
}

/// With `force`, drains and clears the pool synchronously (returns
/// `true`). Without, marks the pool pending-delete and returns `false` so
/// the caller can schedule [`try_complete_warm_pool_deletion`] as a
/// retrying background job.
pub async fn delete_warm_pool(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    imds: &ImdsState,
    group: &str,
    force: bool,
) -> Result<bool> {
    let gid = ResourceId::from(group);
    if !store.exists(&gid) {
        return Err(Error::AsgNotFound(group.to_string()));
    }
    let Some(mut cfg) = store.get_warm_pool_config(&gid)? else {
        return Ok(true);
    };

    if !force {
        cfg.status = WarmPoolStatus::PendingDelete;
        store.set_warm_pool_config(&gid, Some(&cfg))?;
        return Ok(false);
    }

    try_complete_warm_pool_deletion(store, executor, imds, group).await?;
    Ok(true)
}

/// One attempt at draining a pending-delete warm pool to empty. Idempotent;
/// the caller retries on error with backoff until this returns `true`.
pub async fn try_complete_warm_pool_deletion(
    store: &mut ResourceStore,
    executor: &dyn Executor,
    imds: &ImdsState,
    group: &str,
) -> Result<bool> {
    let gid = ResourceId::from(group);
    if !store.exists(&gid) {
        return Ok(true);
    }
    let warm_ids: Vec<ResourceId> = store
        .list_by_type(ResourceType::Instance)
        .into_iter()
        .filter(|id| {
            store.get_attribute(id, keys::ASG_NAME).as_deref() == Some(group)
                && store.get_attribute(id, keys::WARM_POOL_FLAG).as_deref() == Some("true")
        })
        .collect();
    for id in &warm_ids {
        terminate_member(store, executor, imds, id.as_str(), "warm-pool-delete").await?;
    }
    store.set_warm_pool_config(&gid, None)?;
    Ok(true)
}

fn read_u32(store: &ResourceStore, id: &ResourceId, key: &str) -> Result<u32> {
    store
        .get_attribute(id, key)
        .ok_or_else(|| Error::Internal(format!("{id} missing attribute {key}")))?
        .parse()
        .map_err(|_| Error::Internal(format!("{id} attribute {key} is not a u32")))
}

fn read_warm_pool_reuse(store: &ResourceStore, id: &ResourceId) -> Result<bool> {
    Ok(store
        .get_warm_pool_config(id)?
        .map(|c| c.reuse_on_scale_in)
        .unwrap_or(false))
}

/// Builds the describe-response view of a group. Every query path
/// reconciles first, so this is read-only over whatever membership that
/// reconciliation settled on.
pub async fn view(store: &mut ResourceStore, executor: &dyn Executor, group: &str) -> Result<AsgView> {
    let gid = ResourceId::from(group);
    if !store.exists(&gid) {
        return Err(Error::AsgNotFound(group.to_string()));
    }

    let mut member_ids = Vec::new();
    let mut warm_ids = Vec::new();
    for id in store.list_by_type(ResourceType::Instance) {
        if store.get_attribute(&id, keys::ASG_NAME).as_deref() != Some(group) {
            continue;
        }
        if store.get_attribute(&id, keys::WARM_POOL_FLAG).as_deref() == Some("true") {
            warm_ids.push(id.as_str().to_string());
        } else {
            member_ids.push(id.as_str().to_string());
        }
    }
    member_ids.sort();
    warm_ids.sort();

    let all: Vec<String> = member_ids.iter().chain(warm_ids.iter()).cloned().collect();
    let described = executor.describe_instances(&all).await.map_err(Error::from)?;
    let health_of: HashMap<&str, HealthStatus> =
        described.iter().map(|d| (d.id.as_str(), d.health)).collect();

    let instances = member_ids
        .iter()
        .map(|id| AsgMemberView {
            id: id.clone(),
            lifecycle_state: "InService",
            health: health_of.get(id.as_str()).copied().unwrap_or(HealthStatus::Unknown),
            warm_pool: false,
        })
        .collect();

    let warm_pool = match store.get_warm_pool_config(&gid)? {
        Some(cfg) => Some(WarmPoolView {
            min: cfg.min,
            max_prepared: cfg.max_prepared,
            pool_state: cfg.pool_state,
            status: cfg.status,
            instances: warm_ids
                .iter()
                .map(|id| AsgMemberView {
                    id: id.clone(),
                    lifecycle_state: "Warmed",
                    health: health_of.get(id.as_str()).copied().unwrap_or(HealthStatus::Unknown),
                    warm_pool: true,
                })
                .collect(),
        }),
        None => None,
    };

    let created_time = store
        .get_attribute(&gid, keys::ASG_CREATED_TIME)
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let default_cooldown = store
        .get_attribute(&gid, keys::ASG_DEFAULT_COOLDOWN)
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_default();

    Ok(AsgView {
        name: group.to_string(),
        min: read_u32(store, &gid, keys::ASG_MIN)?,
        max: read_u32(store, &gid, keys::ASG_MAX)?,
        desired: read_u32(store, &gid, keys::ASG_DESIRED)?,
        created_time,
        launch_template_id: store.get_attribute(&gid, keys::ASG_LAUNCH_TEMPLATE).unwrap_or_default(),
        vpc_zones: store
            .get_attribute(&gid, keys::ASG_VPC_ZONES)
            .map(|s| s.split(',').filter(|s| !s.is_empty()).map(String::from).collect())
            .unwrap_or_default(),
        default_cooldown,
        health_check_type: store.get_attribute(&gid, keys::ASG_HEALTH_CHECK_TYPE).unwrap_or_default(),
        instances,
        tags: store.get_tags(&gid)?,
        warm_pool,
    })
}
