// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! The Dispatcher: the single serialization point for every control-plane
//! mutation.
//!
//! `Dispatcher::dispatch` is the only entry point an embedder calls. It
//! holds the dispatch mutex for the duration of one action, which is also
//! what the ASG loop and the lifecycle reconciler hold while they run —
//! one single global critical section. Background tasks (the lifecycle
//! watcher/reconciler, spot reclaim timers, warm-pool delete retries) are
//! spawned once, from [`Dispatcher::new`], and share the same
//! `Arc<Mutex<DispatcherState>>`.

pub mod action;
pub mod filters;
pub mod pagination;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::executor::{Executor, HealthStatus, InstanceDescription, RuntimeInstanceState};
use crate::fault::FaultProfile;
use crate::imds::ImdsState;
use crate::lifecycle::PendingEvents;
use crate::store::attrs::{self, keys, LaunchTemplateVersion, WarmPoolConfig};
use crate::store::{AttributeRemoval, ResourceId, ResourceStore, ResourceType};

use action::{Action, InstanceTypeOffering, InstanceView, LaunchTemplateView, MarketType, Response, VolumeView};

/// Everything the dispatch mutex protects: the resource graph plus the
/// background jobs indexed by the id they were spawned for — one context
/// per job, an index of cancel functions keyed by job id, replace-and-cancel
/// on reschedule.
#[derive(Default)]
pub struct DispatcherState {
    pub store: ResourceStore,
    pub reclaim_tokens: HashMap<String, CancellationToken>,
    pub warm_pool_jobs: HashMap<String, CancellationToken>,
}

/// The dispatcher: one per running engine. Cheaply cloneable so an
/// embedder's HTTP front-end (out of scope here) can hand a clone to every
/// connection handler.
#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<Mutex<DispatcherState>>,
    executor: Arc<dyn Executor>,
    imds: ImdsState,
    config: Arc<EngineConfig>,
    pending: Arc<PendingEvents>,
    fault_profile: Option<Arc<FaultProfile>>,
    background: CancellationToken,
}

impl Dispatcher {
    /// Builds a dispatcher over `executor`, loads the fault profile if
    /// configured, and spawns the lifecycle watcher/reconciler pair.
    pub fn new(executor: Arc<dyn Executor>, config: EngineConfig) -> Result<Self> {
        let fault_profile = match &config.test_profile_path {
            Some(path) => Some(Arc::new(FaultProfile::load(path)?)),
            None => None,
        };

        let dispatcher = Dispatcher {
            state: Arc::new(Mutex::new(DispatcherState::default())),
            executor,
            imds: ImdsState::new(),
            config: Arc::new(config),
            pending: PendingEvents::new(),
            fault_profile,
            background: CancellationToken::new(),
        };

        tokio::spawn(crate::lifecycle::run_watcher(
            dispatcher.executor.clone(),
            dispatcher.pending.clone(),
            dispatcher.background.clone(),
        ));
        tokio::spawn(crate::lifecycle::run_reconciler(
            dispatcher.state.clone(),
            dispatcher.executor.clone(),
            dispatcher.imds.clone(),
            dispatcher.config.clone(),
            dispatcher.pending.clone(),
            dispatcher.background.clone(),
        ));

        Ok(dispatcher)
    }

    /// The IMDS router's shared state, for the embedder to bind alongside
    /// [`crate::imds::router`].
    pub fn imds_state(&self) -> ImdsState {
        self.imds.clone()
    }

    /// Dispatches one action under the single global critical section.
    /// Drains pending lifecycle events and reaps expired terminated-instance
    /// records first, so every handler sees settled state.
    pub async fn dispatch(&self, action: Action, dry_run: bool) -> Result<Response> {
        crate::lifecycle::reconcile_pending(&self.state, &*self.executor, &self.imds, &self.config, &self.pending)
            .await?;

        let mut guard = self.state.lock().await;
        guard.store.prune_terminated(self.config.terminated_instance_retention);

        if dry_run {
            return Err(Error::DryRun);
        }

        let name = action.name();
        tracing::info!(action = name, "dispatching action");

        match action {
            Action::RunInstances(req) => self.run_instances(&mut guard, req).await,
            Action::DescribeInstances(req) => self.describe_instances(&mut guard, req).await,
            Action::DescribeInstanceStatus(req) => self.describe_instances(&mut guard, req).await,
            Action::StartInstances { ids } => self.start_instances(&mut guard, ids).await,
            Action::StopInstances { ids, force } => self.stop_instances(&mut guard, ids, force).await,
            Action::TerminateInstances { ids } => self.terminate_instances(&mut guard, ids).await,
            Action::ModifyInstanceMetadataOptions { id, disable_imds } => {
                self.modify_instance_metadata_options(&mut guard, id, disable_imds)
            }
            Action::DescribeInstanceTypes => Ok(describe_instance_types()),
            Action::DescribeInstanceTypeOfferings { location } => {
                Ok(describe_instance_type_offerings(&self.config, location))
            }
            Action::GetInstanceTypesFromInstanceRequirements => Ok(describe_instance_types()),

            Action::CreateTags { resource_ids, tags } => {
                self.create_tags(&mut guard, resource_ids, tags)
            }
            Action::DeleteTags { resource_ids, tags } => {
                self.delete_tags(&mut guard, resource_ids, tags)
            }

            Action::CreateVolume(req) => self.create_volume(&mut guard, req).await,
            Action::DeleteVolume { id } => self.delete_volume(&mut guard, id).await,
            Action::AttachVolume { volume_id, instance_id, device } => {
                self.attach_volume(&mut guard, volume_id, instance_id, device).await
            }
            Action::DetachVolume { volume_id, instance_id } => {
                self.detach_volume(&mut guard, volume_id, instance_id).await
            }
            Action::DescribeVolumes { ids } => self.describe_volumes(&mut guard, ids).await,

            Action::CreateLaunchTemplate(req) => self.create_launch_template(&mut guard, req),
            Action::CreateLaunchTemplateVersion(req) => {
                self.create_launch_template_version(&mut guard, req)
            }
            Action::DescribeLaunchTemplates { ids } => self.describe_launch_templates(&guard, ids),
            Action::DeleteLaunchTemplate { id } => self.delete_launch_template(&mut guard, id),

            Action::CreateOrUpdateAutoScalingTags { resource_id, tags } => {
                self.create_tags(&mut guard, vec![resource_id], tags)
            }
            Action::CreateAutoScalingGroup(req) => self.create_auto_scaling_group(&mut guard, req).await,
            Action::UpdateAutoScalingGroup(req) => self.update_auto_scaling_group(&mut guard, req).await,
            Action::DeleteAutoScalingGroup { name, force_delete } => {
                crate::asg::delete_group(&mut guard.store, &*self.executor, &self.imds, &name, force_delete)
                    .await?;
                Ok(Response::Empty)
            }
            Action::DescribeAutoScalingGroups { names } => {
                self.describe_auto_scaling_groups(&mut guard, names).await
            }
            Action::SetDesiredCapacity { name, desired } => {
                self.set_desired_capacity(&mut guard, name, desired).await
            }
            Action::DetachInstances { name, ids, decrement_desired } => {
                let detached =
                    crate::asg::detach_instances(&mut guard.store, &name, &ids, decrement_desired).await?;
                Ok(Response::InstanceIds(detached))
            }
            Action::PutWarmPool(req) => self.put_warm_pool(&mut guard, req).await,
            Action::DescribeWarmPool { group } => self.describe_warm_pool(&mut guard, group).await,
            Action::DeleteWarmPool { group, force } => self.delete_warm_pool(&mut guard, group, force).await,
        }
    }

    /// Runs the Exit Resource Manager for the configured mode.
    pub async fn shutdown(&self) -> Result<()> {
        self.background.cancel();
        let mut guard = self.state.lock().await;
        crate::exit::run(&mut guard.store, &*self.executor, &self.imds, self.config.exit_resource_mode).await
    }

    // ---- instances ---------------------------------------------------

    /// RunInstances' staged transaction: validate, optional pre-allocate
    /// delay, CreateInstances, register+tag, optional
    /// post-allocate delay, StartInstances, optional pre/post-start delay,
    /// attach block devices, describe and shape the response. Any failure
    /// from CreateInstances onward rolls back exactly the instances this
    /// call created.
    async fn run_instances(
        &self,
        guard: &mut DispatcherState,
        req: action::RunInstancesRequest,
    ) -> Result<Response> {
        validate_run_instances(&req)?;

        let fault = self.fault_profile.as_deref();
        if let Some(delay) = fault.and_then(|f| f.pre_delay("RunInstances", Some(req.image_id.as_str()))) {
            tokio::time::sleep(delay).await;
        }

        let ids = self
            .executor
            .create_instances(&req.image_id, &req.instance_type, req.count, &req.user_data)
            .await
            .map_err(Error::from)?;

        if let Err(err) = self.register_and_tag(guard, &req, &ids) {
            self.rollback_run_instances(guard, &ids).await;
            return Err(err);
        }

        if let Some(delay) = fault.and_then(|f| f.post_delay("RunInstances", Some(req.image_id.as_str()))) {
            tokio::time::sleep(delay).await;
        }

        if let Err(err) = self.executor.start_instances(&ids).await.map_err(Error::from) {
            self.rollback_run_instances(guard, &ids).await;
            return Err(err);
        }

        if let Some(delay) = fault.and_then(|f| f.pre_delay("StartInstances", Some(req.image_id.as_str()))) {
            tokio::time::sleep(delay).await;
        }

        if let Err(err) = self.attach_block_devices(guard, &req, &ids).await {
            self.rollback_run_instances(guard, &ids).await;
            return Err(err);
        }

        let mut views = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.instance_view(guard, id).await {
                Ok(Some(view)) => views.push(view),
                Ok(None) | Err(_) => {
                    self.rollback_run_instances(guard, &ids).await;
                    return Err(Error::Internal(format!("{id}: lost after creation")));
                }
            }
        }

        if req.market == MarketType::Spot {
            let after = fault
                .and_then(|f| f.forced_spot_reclaim_after("RunInstances", Some(req.image_id.as_str())))
                .unwrap_or(req.spot_reclaim_after);
            if !after.is_zero() {
                for id in &ids {
                    self.schedule_spot_reclaim(guard, id.clone(), after, req.spot_reclaim_notice);
                }
            }
        }

        Ok(Response::Instances(views, None))
    }

    /// Registers the store record and attributes/tags, pushes tags into
    /// IMDS, and maps the instance's synthesized IP.
    fn register_and_tag(
        &self,
        guard: &mut DispatcherState,
        req: &action::RunInstancesRequest,
        ids: &[String],
    ) -> Result<()> {
        let az = req.availability_zone.clone().unwrap_or_else(|| self.config.default_az());
        for id in ids {
            let rid = ResourceId::from(id.as_str());
            guard.store.register(rid.clone(), ResourceType::Instance)?;
            let mut attrs = vec![
                (keys::AVAILABILITY_ZONE.to_string(), az.clone()),
                (keys::IMAGE_ID.to_string(), req.image_id.clone()),
                (keys::INSTANCE_TYPE.to_string(), req.instance_type.clone()),
                (keys::USER_DATA.to_string(), req.user_data.clone()),
                (
                    keys::SPOT_INSTANCE.to_string(),
                    (req.market == MarketType::Spot).to_string(),
                ),
            ];
            if let Some(key_name) = &req.key_name {
                attrs.push((keys::KEY_NAME.to_string(), key_name.clone()));
            }
            guard.store.set_attributes(&rid, attrs)?;
            guard.store.set_tags(&rid, req.tags.clone())?;
            guard.store.set_block_device_mappings(&rid, &req.block_device_mappings)?;

            let ip = synthesize_ip(id);
            self.imds.register_instance(id, ip, req.user_data.clone());
            let tags: std::collections::BTreeMap<String, String> = req.tags.iter().cloned().collect();
            self.imds.set_tags(id, tags);
        }
        Ok(())
    }

    async fn attach_block_devices(
        &self,
        guard: &mut DispatcherState,
        req: &action::RunInstancesRequest,
        ids: &[String],
    ) -> Result<()> {
        for bdm in &req.block_device_mappings {
            let Some(volume_id) = &bdm.volume_id else { continue };
            for id in ids {
                self.executor
                    .attach_volume(volume_id, id, &bdm.device_name)
                    .await
                    .map_err(Error::from)?;
                let vrid = ResourceId::from(volume_id.as_str());
                if guard.store.exists(&vrid) {
                    guard.store.set_attributes(
                        &vrid,
                        [
                            (keys::VOL_ATTACHED_INSTANCE.to_string(), id.clone()),
                            (keys::VOL_ATTACHED_DEVICE.to_string(), bdm.device_name.clone()),
                        ],
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Best-effort rollback for a RunInstances call that failed partway
    /// through: terminates exactly the instances this call created and
    /// clears their store record and IMDS state.
    /// Failures here are logged, not propagated.
    async fn rollback_run_instances(&self, guard: &mut DispatcherState, ids: &[String]) {
        if let Err(err) = self.executor.terminate_instances(ids).await {
            tracing::warn!(error = %err, "RunInstances rollback: terminate failed");
        }
        for id in ids {
            let rid = ResourceId::from(id.as_str());
            if guard.store.exists(&rid) {
                if let Err(err) = guard.store.remove(&rid) {
                    tracing::warn!(instance = id, error = %err, "RunInstances rollback: store remove failed");
                }
            }
            self.imds.deregister_instance(id);
        }
    }

    fn schedule_spot_reclaim(
        &self,
        guard: &mut DispatcherState,
        instance_id: String,
        after: std::time::Duration,
        notice: std::time::Duration,
    ) {
        let cancel = CancellationToken::new();
        guard.reclaim_tokens.insert(instance_id.clone(), cancel.clone());
        tokio::spawn(crate::spot::run(
            instance_id,
            after,
            notice,
            self.state.clone(),
            self.executor.clone(),
            self.imds.clone(),
            cancel,
        ));
    }

    async fn describe_instances(
        &self,
        guard: &mut DispatcherState,
        req: action::DescribeInstancesRequest,
    ) -> Result<Response> {
        let mut views = if req.ids.is_empty() {
            let mut all = Vec::new();
            for id in guard.store.list_by_type(ResourceType::Instance) {
                if let Some(view) = self.instance_view(guard, id.as_str()).await? {
                    all.push(view);
                }
            }
            all
        } else {
            let mut found = Vec::new();
            for id in &req.ids {
                match self.instance_view(guard, id).await? {
                    Some(view) => found.push(view),
                    None => return Err(Error::InstanceNotFound(id.clone())),
                }
            }
            found
        };

        let mut filtered = Vec::with_capacity(views.len());
        for view in views.drain(..) {
            if filters::matches_all(&view, &req.filters)? {
                filtered.push(view);
            }
        }
        filtered.sort_by(|a, b| a.id.cmp(&b.id));

        let (page, next) = pagination::paginate(&filtered, req.max_results, req.next_token.as_deref())?;
        Ok(Response::Instances(page, next))
    }

    /// Builds an [`InstanceView`] for one instance id, fusing a live runtime
    /// describe when the runtime still has it, or falling back to the
    /// store's last-known attributes for a TTL-retained terminated record.
    async fn instance_view(&self, guard: &mut DispatcherState, id: &str) -> Result<Option<InstanceView>> {
        let rid = ResourceId::from(id);
        if !guard.store.exists(&rid) {
            return Ok(None);
        }
        let described = self.executor.describe_instances(&[id.to_string()]).await.map_err(Error::from)?;
        match described.into_iter().next() {
            Some(desc) => Ok(Some(self.instance_view_from_live(guard, &desc)?)),
            None => Ok(self.instance_view_from_terminated(guard, &rid)?),
        }
    }

    fn instance_view_from_live(
        &self,
        guard: &mut DispatcherState,
        desc: &InstanceDescription,
    ) -> Result<InstanceView> {
        let rid = ResourceId::from(desc.id.as_str());
        let mut persisted = vec![
            (keys::PRIVATE_IP.to_string(), desc.private_ip.clone()),
            (keys::PRIVATE_DNS.to_string(), desc.private_dns.clone()),
            (keys::LAUNCH_TIME.to_string(), desc.launch_time.to_rfc3339()),
            (keys::STATE_NAME.to_string(), desc.state.name().to_string()),
            (keys::STATE_CODE.to_string(), desc.state.code().to_string()),
        ];
        if let Some(public_ip) = &desc.public_ip {
            persisted.push((keys::PUBLIC_IP.to_string(), public_ip.clone()));
        }
        if let Some(public_dns) = &desc.public_dns {
            persisted.push((keys::PUBLIC_DNS.to_string(), public_dns.clone()));
        }
        guard.store.set_attributes(&rid, persisted)?;

        Ok(InstanceView {
            id: desc.id.clone(),
            state: desc.state,
            instance_type: desc.instance_type.clone(),
            image_id: desc.image_id.clone(),
            availability_zone: guard.store.get_attribute(&rid, keys::AVAILABILITY_ZONE).unwrap_or_default(),
            key_name: guard.store.get_attribute(&rid, keys::KEY_NAME),
            private_ip: desc.private_ip.clone(),
            public_ip: desc.public_ip.clone(),
            private_dns: desc.private_dns.clone(),
            public_dns: desc.public_dns.clone(),
            launch_time: desc.launch_time,
            health: desc.health,
            state_reason_code: guard.store.get_attribute(&rid, keys::STATE_REASON_CODE),
            tags: guard.store.get_tags(&rid)?,
        })
    }

    fn instance_view_from_terminated(
        &self,
        guard: &DispatcherState,
        rid: &ResourceId,
    ) -> Result<Option<InstanceView>> {
        let Some(state_name) = guard.store.get_attribute(rid, keys::STATE_NAME) else {
            return Ok(None);
        };
        if state_name != "terminated" {
            return Ok(None);
        }
        let launch_time = guard
            .store
            .get_attribute(rid, keys::LAUNCH_TIME)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Some(InstanceView {
            id: rid.as_str().to_string(),
            state: RuntimeInstanceState::Terminated,
            instance_type: guard.store.get_attribute(rid, keys::INSTANCE_TYPE).unwrap_or_default(),
            image_id: guard.store.get_attribute(rid, keys::IMAGE_ID).unwrap_or_default(),
            availability_zone: guard.store.get_attribute(rid, keys::AVAILABILITY_ZONE).unwrap_or_default(),
            key_name: guard.store.get_attribute(rid, keys::KEY_NAME),
            private_ip: guard.store.get_attribute(rid, keys::PRIVATE_IP).unwrap_or_default(),
            public_ip: guard.store.get_attribute(rid, keys::PUBLIC_IP),
            private_dns: guard.store.get_attribute(rid, keys::PRIVATE_DNS).unwrap_or_default(),
            public_dns: guard.store.get_attribute(rid, keys::PUBLIC_DNS),
            launch_time,
            health: HealthStatus::Unknown,
            state_reason_code: guard.store.get_attribute(rid, keys::STATE_REASON_CODE),
            tags: guard.store.get_tags(rid)?,
        }))
    }

    async fn start_instances(&self, guard: &mut DispatcherState, ids: Vec<String>) -> Result<Response> {
        for id in &ids {
            require_exists(guard, id)?;
        }
        let transitions = self.executor.start_instances(&ids).await.map_err(Error::from)?;
        for id in &ids {
            let rid = ResourceId::from(id.as_str());
            guard.store.set_attributes(
                &rid,
                [(keys::STATE_NAME.to_string(), RuntimeInstanceState::Pending.name().to_string())],
            )?;
        }
        Ok(Response::InstanceTransitions(transitions))
    }

    async fn stop_instances(&self, guard: &mut DispatcherState, ids: Vec<String>, force: bool) -> Result<Response> {
        for id in &ids {
            require_exists(guard, id)?;
        }
        let transitions = self.executor.stop_instances(&ids, force).await.map_err(Error::from)?;
        for id in &ids {
            let rid = ResourceId::from(id.as_str());
            guard.store.set_attributes(
                &rid,
                [(keys::STATE_NAME.to_string(), RuntimeInstanceState::Stopping.name().to_string())],
            )?;
        }
        Ok(Response::InstanceTransitions(transitions))
    }

    async fn terminate_instances(&self, guard: &mut DispatcherState, ids: Vec<String>) -> Result<Response> {
        for id in &ids {
            require_exists(guard, id)?;
        }
        let transitions = self.executor.terminate_instances(&ids).await.map_err(Error::from)?;
        for id in &ids {
            let rid = ResourceId::from(id.as_str());
            guard.store.mark_terminated(&rid, "Client.UserInitiatedShutdown")?;
            self.imds.deregister_instance(id);
            if let Some(cancel) = guard.reclaim_tokens.remove(id) {
                cancel.cancel();
            }
        }
        Ok(Response::InstanceTransitions(transitions))
    }

    fn modify_instance_metadata_options(
        &self,
        guard: &mut DispatcherState,
        id: String,
        disable_imds: Option<bool>,
    ) -> Result<Response> {
        require_exists(guard, &id)?;
        if let Some(disabled) = disable_imds {
            self.imds.set_disabled(&id, disabled);
        }
        Ok(Response::Empty)
    }

    // ---- tags ----------------------------------------------------------

    fn create_tags(
        &self,
        guard: &mut DispatcherState,
        resource_ids: Vec<String>,
        tags: Vec<(String, String)>,
    ) -> Result<Response> {
        for id in &resource_ids {
            let rid = ResourceId::from(id.as_str());
            require_resource_exists(guard, &rid)?;
            guard.store.set_tags(&rid, tags.clone())?;
            self.resync_imds_tags(guard, &rid)?;
        }
        Ok(Response::Empty)
    }

    fn delete_tags(
        &self,
        guard: &mut DispatcherState,
        resource_ids: Vec<String>,
        tags: Vec<(String, Option<String>)>,
    ) -> Result<Response> {
        for id in &resource_ids {
            let rid = ResourceId::from(id.as_str());
            require_resource_exists(guard, &rid)?;
            let removals: Vec<AttributeRemoval> = tags
                .iter()
                .map(|(k, v)| {
                    let attr = attrs::tag_attr(k);
                    match v {
                        Some(value) => AttributeRemoval::exact(attr, value.clone()),
                        None => AttributeRemoval::wildcard(attr),
                    }
                })
                .collect();
            guard.store.remove_attributes(&rid, &removals)?;
            self.resync_imds_tags(guard, &rid)?;
        }
        Ok(Response::Empty)
    }

    fn resync_imds_tags(&self, guard: &DispatcherState, rid: &ResourceId) -> Result<()> {
        if guard.store.kind_of(rid) == Some(ResourceType::Instance) {
            let tags: std::collections::BTreeMap<String, String> =
                guard.store.get_tags(rid)?.into_iter().collect();
            self.imds.set_tags(rid.as_str(), tags);
        }
        Ok(())
    }

    // ---- volumes ---------------------------------------------------------

    async fn create_volume(&self, guard: &mut DispatcherState, req: action::CreateVolumeRequest) -> Result<Response> {
        let id = self.executor.create_volume(req.size_bytes).await.map_err(Error::from)?;
        let rid = ResourceId::from(id.as_str());
        guard.store.register(rid.clone(), ResourceType::Volume)?;
        guard.store.set_attributes(
            &rid,
            [
                (keys::VOL_SIZE_BYTES.to_string(), req.size_bytes.to_string()),
                (keys::AVAILABILITY_ZONE.to_string(), req.availability_zone.clone()),
                (keys::VOL_ENCRYPTED.to_string(), req.encrypted.to_string()),
            ],
        )?;
        if let Some(iops) = req.iops {
            guard.store.set_attributes(&rid, [(keys::VOL_IOPS.to_string(), iops.to_string())])?;
        }
        if let Some(throughput) = req.throughput {
            guard
                .store
                .set_attributes(&rid, [(keys::VOL_THROUGHPUT.to_string(), throughput.to_string())])?;
        }
        if let Some(kms_key) = &req.kms_key_id {
            guard.store.set_attributes(&rid, [(keys::VOL_KMS_KEY.to_string(), kms_key.clone())])?;
        }
        Ok(Response::VolumeId(id))
    }

    async fn delete_volume(&self, guard: &mut DispatcherState, id: String) -> Result<Response> {
        let rid = ResourceId::from(id.as_str());
        require_resource_exists(guard, &rid)?;
        self.executor.delete_volume(&id).await.map_err(Error::from)?;
        guard.store.remove(&rid)?;
        Ok(Response::Empty)
    }

    async fn attach_volume(
        &self,
        guard: &mut DispatcherState,
        volume_id: String,
        instance_id: String,
        device: String,
    ) -> Result<Response> {
        require_resource_exists(guard, &ResourceId::from(volume_id.as_str()))?;
        require_exists(guard, &instance_id)?;
        let attachment = self
            .executor
            .attach_volume(&volume_id, &instance_id, &device)
            .await
            .map_err(Error::from)?;
        let vrid = ResourceId::from(volume_id.as_str());
        guard.store.set_attributes(
            &vrid,
            [
                (keys::VOL_ATTACHED_INSTANCE.to_string(), instance_id.clone()),
                (keys::VOL_ATTACHED_DEVICE.to_string(), device.clone()),
            ],
        )?;
        Ok(Response::VolumeAttachment(attachment))
    }

    async fn detach_volume(
        &self,
        guard: &mut DispatcherState,
        volume_id: String,
        instance_id: String,
    ) -> Result<Response> {
        let vrid = ResourceId::from(volume_id.as_str());
        require_resource_exists(guard, &vrid)?;
        let attachment = self
            .executor
            .detach_volume(&volume_id, &instance_id)
            .await
            .map_err(Error::from)?;
        guard.store.remove_attributes(
            &vrid,
            &[
                AttributeRemoval::wildcard(keys::VOL_ATTACHED_INSTANCE),
                AttributeRemoval::wildcard(keys::VOL_ATTACHED_DEVICE),
            ],
        )?;
        Ok(Response::VolumeAttachment(attachment))
    }

    async fn describe_volumes(&self, guard: &mut DispatcherState, ids: Vec<String>) -> Result<Response> {
        let wanted = if ids.is_empty() {
            guard.store.list_by_type(ResourceType::Volume).iter().map(|id| id.as_str().to_string()).collect()
        } else {
            ids
        };
        let described = self.executor.describe_volumes(&wanted).await.map_err(Error::from)?;
        let mut views = Vec::with_capacity(described.len());
        for desc in described {
            let rid = ResourceId::from(desc.id.as_str());
            views.push(VolumeView {
                id: desc.id.clone(),
                size_bytes: desc.size_bytes,
                availability_zone: guard.store.get_attribute(&rid, keys::AVAILABILITY_ZONE).unwrap_or_default(),
                encrypted: guard
                    .store
                    .get_attribute(&rid, keys::VOL_ENCRYPTED)
                    .map(|s| s == "true")
                    .unwrap_or(false),
                attached_instance: desc.attachment.as_ref().map(|a| a.instance_id.clone()),
                attached_device: desc.attachment.as_ref().map(|a| a.device.clone()),
            });
        }
        views.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Response::Volumes(views))
    }

    // ---- launch templates ------------------------------------------------

    fn create_launch_template(
        &self,
        guard: &mut DispatcherState,
        req: action::CreateLaunchTemplateRequest,
    ) -> Result<Response> {
        let id = format!("lt-{}", Uuid::new_v4().simple());
        let rid = ResourceId::from(id.as_str());
        guard.store.register(rid.clone(), ResourceType::LaunchTemplate)?;
        let version = LaunchTemplateVersion {
            version: 1,
            image_id: req.image_id,
            instance_type: req.instance_type,
            user_data: req.user_data,
            block_device_mappings: req.block_device_mappings,
        };
        guard.store.set_attributes(
            &rid,
            [
                (keys::LT_NAME.to_string(), req.name.clone()),
                (keys::LT_DEFAULT_VERSION.to_string(), "1".to_string()),
            ],
        )?;
        guard.store.set_launch_template_versions(&rid, &[version.clone()])?;
        Ok(Response::LaunchTemplate(LaunchTemplateView {
            id,
            name: req.name,
            default_version: 1,
            versions: vec![version],
        }))
    }

    fn create_launch_template_version(
        &self,
        guard: &mut DispatcherState,
        req: action::CreateLaunchTemplateVersionRequest,
    ) -> Result<Response> {
        let rid = ResourceId::from(req.id.as_str());
        require_resource_exists(guard, &rid)?;
        let mut versions = guard.store.get_launch_template_versions(&rid)?;
        let next_version = versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        versions.push(LaunchTemplateVersion {
            version: next_version,
            image_id: req.image_id,
            instance_type: req.instance_type,
            user_data: req.user_data,
            block_device_mappings: req.block_device_mappings,
        });
        guard.store.set_launch_template_versions(&rid, &versions)?;
        if req.set_as_default {
            guard
                .store
                .set_attributes(&rid, [(keys::LT_DEFAULT_VERSION.to_string(), next_version.to_string())])?;
        }
        self.launch_template_view(guard, &rid)
            .map(Response::LaunchTemplate)
    }

    fn describe_launch_templates(&self, guard: &DispatcherState, ids: Vec<String>) -> Result<Response> {
        let wanted = if ids.is_empty() {
            guard.store.list_by_type(ResourceType::LaunchTemplate)
        } else {
            ids.iter().map(|id| ResourceId::from(id.as_str())).collect()
        };
        let mut views = Vec::with_capacity(wanted.len());
        for rid in wanted {
            require_resource_exists(guard, &rid)?;
            views.push(self.launch_template_view(guard, &rid)?);
        }
        Ok(Response::LaunchTemplates(views))
    }

    fn delete_launch_template(&self, guard: &mut DispatcherState, id: String) -> Result<Response> {
        let rid = ResourceId::from(id.as_str());
        require_resource_exists(guard, &rid)?;
        guard.store.remove(&rid)?;
        Ok(Response::Empty)
    }

    fn launch_template_view(&self, guard: &DispatcherState, rid: &ResourceId) -> Result<LaunchTemplateView> {
        let versions = guard.store.get_launch_template_versions(rid)?;
        let default_version = guard
            .store
            .get_attribute(rid, keys::LT_DEFAULT_VERSION)
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);
        Ok(LaunchTemplateView {
            id: rid.as_str().to_string(),
            name: guard.store.get_attribute(rid, keys::LT_NAME).unwrap_or_default(),
            default_version,
            versions,
        })
    }

    // ---- auto scaling groups -----------------------------------------------

    async fn create_auto_scaling_group(
        &self,
        guard: &mut DispatcherState,
        req: action::CreateAutoScalingGroupRequest,
    ) -> Result<Response> {
        if req.min > req.desired || req.desired > req.max {
            return Err(Error::Validation(format!(
                "{}: min <= desired <= max required (min={}, desired={}, max={})",
                req.name, req.min, req.desired, req.max
            )));
        }
        let lt_rid = ResourceId::from(req.launch_template_id.as_str());
        require_resource_exists(guard, &lt_rid)?;

        let gid = ResourceId::from(req.name.as_str());
        guard.store.register(gid.clone(), ResourceType::AutoScalingGroup)?;
        guard.store.set_attributes(
            &gid,
            [
                (keys::ASG_MIN.to_string(), req.min.to_string()),
                (keys::ASG_MAX.to_string(), req.max.to_string()),
                (keys::ASG_DESIRED.to_string(), "0".to_string()),
                (keys::ASG_CREATED_TIME.to_string(), Utc::now().to_rfc3339()),
                (keys::ASG_DEFAULT_COOLDOWN.to_string(), req.default_cooldown.as_secs().to_string()),
                (keys::ASG_HEALTH_CHECK_TYPE.to_string(), req.health_check_type.clone()),
                (keys::ASG_VPC_ZONES.to_string(), req.vpc_zones.join(",")),
                (keys::ASG_LAUNCH_TEMPLATE.to_string(), req.launch_template_id.clone()),
            ],
        )?;
        guard.store.set_tags(&gid, req.tags.clone())?;

        crate::asg::scale_to(&mut guard.store, &*self.executor, &self.imds, &self.config, &req.name, req.desired)
            .await?;

        let view = crate::asg::view(&mut guard.store, &*self.executor, &req.name).await?;
        Ok(Response::AutoScalingGroup(view))
    }

    async fn update_auto_scaling_group(
        &self,
        guard: &mut DispatcherState,
        req: action::UpdateAutoScalingGroupRequest,
    ) -> Result<Response> {
        let gid = ResourceId::from(req.name.as_str());
        require_resource_exists(guard, &gid)?;

        let min = req.min.unwrap_or(read_u32(guard, &gid, keys::ASG_MIN)?);
        let max = req.max.unwrap_or(read_u32(guard, &gid, keys::ASG_MAX)?);
        let current_desired = read_u32(guard, &gid, keys::ASG_DESIRED)?;
        let desired = req.desired.unwrap_or(current_desired).clamp(min, max);
        if min > desired || desired > max {
            return Err(Error::Validation(format!(
                "{}: min <= desired <= max required (min={min}, desired={desired}, max={max})",
                req.name
            )));
        }

        guard.store.set_attributes(
            &gid,
            [
                (keys::ASG_MIN.to_string(), min.to_string()),
                (keys::ASG_MAX.to_string(), max.to_string()),
            ],
        )?;
        if let Some(lt_id) = &req.launch_template_id {
            require_resource_exists(guard, &ResourceId::from(lt_id.as_str()))?;
            guard
                .store
                .set_attributes(&gid, [(keys::ASG_LAUNCH_TEMPLATE.to_string(), lt_id.clone())])?;
        }

        crate::asg::scale_to(&mut guard.store, &*self.executor, &self.imds, &self.config, &req.name, desired)
            .await?;

        let view = crate::asg::view(&mut guard.store, &*self.executor, &req.name).await?;
        Ok(Response::AutoScalingGroup(view))
    }

    async fn describe_auto_scaling_groups(
        &self,
        guard: &mut DispatcherState,
        names: Vec<String>,
    ) -> Result<Response> {
        let wanted = if names.is_empty() {
            guard
                .store
                .list_by_type(ResourceType::AutoScalingGroup)
                .iter()
                .map(|id| id.as_str().to_string())
                .collect()
        } else {
            names
        };

        let mut views = Vec::with_capacity(wanted.len());
        for name in &wanted {
            crate::asg::reconcile(&mut guard.store, &*self.executor, &self.imds, &self.config, name).await?;
            views.push(crate::asg::view(&mut guard.store, &*self.executor, name).await?);
        }
        views.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Response::AutoScalingGroups(views))
    }

    async fn set_desired_capacity(&self, guard: &mut DispatcherState, name: String, desired: u32) -> Result<Response> {
        let gid = ResourceId::from(name.as_str());
        require_resource_exists(guard, &gid)?;
        let min = read_u32(guard, &gid, keys::ASG_MIN)?;
        let max = read_u32(guard, &gid, keys::ASG_MAX)?;
        if desired < min || desired > max {
            return Err(Error::Validation(format!(
                "{name}: desired {desired} outside [{min}, {max}]"
            )));
        }
        crate::asg::scale_to(&mut guard.store, &*self.executor, &self.imds, &self.config, &name, desired).await?;
        Ok(Response::Empty)
    }

    async fn put_warm_pool(&self, guard: &mut DispatcherState, req: action::PutWarmPoolRequest) -> Result<Response> {
        let gid = ResourceId::from(req.group.as_str());
        require_resource_exists(guard, &gid)?;
        let config = WarmPoolConfig {
            min: req.min,
            max_prepared: req.max_prepared,
            pool_state: req.pool_state,
            status: crate::store::attrs::WarmPoolStatus::Active,
            reuse_on_scale_in: req.reuse_on_scale_in,
        };
        crate::asg::put_warm_pool(&mut guard.store, &*self.executor, &self.imds, &self.config, &req.group, config)
            .await?;
        self.describe_warm_pool(guard, req.group).await
    }

    async fn describe_warm_pool(&self, guard: &mut DispatcherState, group: String) -> Result<Response> {
        require_resource_exists(guard, &ResourceId::from(group.as_str()))?;
        crate::asg::reconcile(&mut guard.store, &*self.executor, &self.imds, &self.config, &group).await?;
        let view = crate::asg::view(&mut guard.store, &*self.executor, &group).await?;
        Ok(Response::WarmPool(view.warm_pool))
    }

    async fn delete_warm_pool(&self, guard: &mut DispatcherState, group: String, force: bool) -> Result<Response> {
        let drained =
            crate::asg::delete_warm_pool(&mut guard.store, &*self.executor, &self.imds, &group, force).await?;
        if !drained {
            self.spawn_warm_pool_drain(guard, group);
        }
        Ok(Response::Empty)
    }

    /// Spawns the retrying drain job for an async (non-force)
    /// `DeleteWarmPool`: backoff 250ms -> 2s, cancelable and replaced if
    /// the same group is deleted again.
    fn spawn_warm_pool_drain(&self, guard: &mut DispatcherState, group: String) {
        let cancel = CancellationToken::new();
        if let Some(previous) = guard.warm_pool_jobs.insert(group.clone(), cancel.clone()) {
            previous.cancel();
        }
        let state = self.state.clone();
        let executor = self.executor.clone();
        let imds = self.imds.clone();
        tokio::spawn(async move {
            const INITIAL: std::time::Duration = std::time::Duration::from_millis(250);
            const MAX: std::time::Duration = std::time::Duration::from_secs(2);
            let mut backoff = INITIAL;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                let mut guard = state.lock().await;
                match crate::asg::try_complete_warm_pool_deletion(&mut guard.store, &*executor, &imds, &group).await
                {
                    Ok(true) => {
                        guard.warm_pool_jobs.remove(&group);
                        return;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(group = %group, error = %err, "warm pool drain attempt failed, retrying");
                    }
                }
                drop(guard);
                backoff = (backoff * 2).min(MAX);
            }
        });
    }
}

fn require_exists(guard: &DispatcherState, id: &str) -> Result<()> {
    let rid = ResourceId::from(id);
    if guard.store.exists(&rid) {
        Ok(())
    } else {
        Err(Error::InstanceNotFound(id.to_string()))
    }
}

fn require_resource_exists(guard: &DispatcherState, rid: &ResourceId) -> Result<()> {
    if guard.store.exists(rid) {
        Ok(())
    } else {
        match guard.store.kind_of(rid) {
            Some(ResourceType::Volume) => Err(Error::VolumeNotFound(rid.as_str().to_string())),
            Some(ResourceType::LaunchTemplate) => Err(Error::LaunchTemplateNotFound(rid.as_str().to_string())),
            Some(ResourceType::AutoScalingGroup) => Err(Error::AsgNotFound(rid.as_str().to_string())),
            _ => Err(Error::InstanceNotFound(rid.as_str().to_string())),
        }
    }
}

fn read_u32(guard: &DispatcherState, id: &ResourceId, key: &str) -> Result<u32> {
    guard
        .store
        .get_attribute(id, key)
        .ok_or_else(|| Error::Internal(format!("{id} missing attribute {key}")))?
        .parse()
        .map_err(|_| Error::Internal(format!("{id} attribute {key} is not a u32")))
}

fn validate_run_instances(req: &action::RunInstancesRequest) -> Result<()> {
    if req.count == 0 {
        return Err(Error::Validation("count must be at least 1".to_string()));
    }
    if req.image_id.is_empty() {
        return Err(Error::Validation("image id must not be empty".to_string()));
    }
    if req.instance_type.is_empty() {
        return Err(Error::Validation("instance type must not be empty".to_string()));
    }
    for (key, _) in &req.tags {
        if key.is_empty() {
            return Err(Error::Validation("tag key must not be empty".to_string()));
        }
    }
    for bdm in &req.block_device_mappings {
        if bdm.device_name.is_empty() {
            return Err(Error::Validation("block device mapping device name must not be empty".to_string()));
        }
    }
    Ok(())
}

/// Synthesizes a stable loopback-range IP for an instance id so IMDS has
/// something to key its source-IP lookup on without a real container
/// network. Instance networking itself is out of scope here; IMDS keys off
/// whatever IP the embedder's network mapper assigns. Embedders with a
/// real network overwrite this via `ImdsState::register_instance` through
/// their own wrapper; this default keeps the crate self-contained for
/// tests and examples.
fn synthesize_ip(instance_id: &str) -> IpAddr {
    let mut hash: u32 = 2_166_136_261;
    for byte in instance_id.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    let octets = hash.to_be_bytes();
    IpAddr::from([10, octets[1], octets[2], octets[3].max(1)])
}

const INSTANCE_TYPE_CATALOG: &[&str] =
    &["t3.micro", "t3.small", "t3.medium", "m5.large", "m5.xlarge", "c5.large"];

fn describe_instance_types() -> Response {
    Response::InstanceTypeOfferings(
        INSTANCE_TYPE_CATALOG
            .iter()
            .map(|instance_type| InstanceTypeOffering {
                instance_type: instance_type.to_string(),
                location: String::new(),
            })
            .collect(),
    )
}

fn describe_instance_type_offerings(config: &EngineConfig, location: Option<String>) -> Response {
    let location = location.unwrap_or_else(|| config.default_az());
    Response::InstanceTypeOfferings(
        INSTANCE_TYPE_CATALOG
            .iter()
            .map(|instance_type| InstanceTypeOffering {
                instance_type: instance_type.to_string(),
                location: location.clone(),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::EngineConfig;
    use crate::executor::fake::FakeExecutor;
    use crate::store::attrs::WarmPoolState;
    use action::{CreateAutoScalingGroupRequest, CreateLaunchTemplateRequest, PutWarmPoolRequest};

    async fn dispatcher() -> (Dispatcher, std::sync::Arc<FakeExecutor>) {
        let executor = FakeExecutor::new();
        let dispatcher = Dispatcher::new(executor.clone(), EngineConfig::default()).unwrap();
        (dispatcher, executor)
    }

    fn run_instances_req(count: u32, market: MarketType) -> action::RunInstancesRequest {
        action::RunInstancesRequest {
            image_id: "ami-test".to_string(),
            instance_type: "t3.micro".to_string(),
            count,
            user_data: String::new(),
            key_name: None,
            tags: vec![("Name".to_string(), "app".to_string())],
            block_device_mappings: vec![],
            availability_zone: None,
            market,
            spot_reclaim_after: Duration::from_secs(0),
            spot_reclaim_notice: Duration::from_secs(0),
        }
    }

    async fn create_launch_template(d: &Dispatcher) -> String {
        let resp = d
            .dispatch(
                Action::CreateLaunchTemplate(CreateLaunchTemplateRequest {
                    name: "web-lt".to_string(),
                    image_id: "ami-test".to_string(),
                    instance_type: "t3.micro".to_string(),
                    user_data: String::new(),
                    block_device_mappings: vec![],
                }),
                false,
            )
            .await
            .unwrap();
        let Response::LaunchTemplate(lt) = resp else { panic!("expected LaunchTemplate") };
        lt.id
    }

    async fn create_asg(d: &Dispatcher, lt_id: &str, min: u32, max: u32, desired: u32) {
        d.dispatch(
            Action::CreateAutoScalingGroup(CreateAutoScalingGroupRequest {
                name: "web".to_string(),
                min,
                max,
                desired,
                launch_template_id: lt_id.to_string(),
                vpc_zones: vec![],
                default_cooldown: Duration::from_secs(0),
                health_check_type: "EC2".to_string(),
                tags: vec![],
            }),
            false,
        )
        .await
        .unwrap();
    }

    async fn asg_view(d: &Dispatcher, name: &str) -> action::AsgView {
        let resp = d
            .dispatch(Action::DescribeAutoScalingGroups { names: vec![name.to_string()] }, false)
            .await
            .unwrap();
        let Response::AutoScalingGroups(mut groups) = resp else {
            panic!("expected AutoScalingGroups")
        };
        groups.remove(0)
    }

    // S1: RunInstances produces running instances with the requested AZ and tags.
    #[tokio::test]
    async fn s1_run_instances_are_running_with_tags_and_az() {
        let (d, _executor) = dispatcher().await;
        let resp = d
            .dispatch(Action::RunInstances(run_instances_req(2, MarketType::OnDemand)), false)
            .await
            .unwrap();
        let Response::Instances(views, _) = resp else { panic!("expected Instances") };
        assert_eq!(views.len(), 2);
        for view in &views {
            assert!(view.id.starts_with("i-"));
            assert_eq!(view.state.name(), "running");
            assert_eq!(view.availability_zone, "us-east-1a");
            assert_eq!(view.tags, vec![("Name".to_string(), "app".to_string())]);
        }
    }

    // S2: DescribeASG shows members sorted by id; scaling up adds the largest id.
    #[tokio::test]
    async fn s2_asg_scales_to_desired_and_new_member_has_largest_id() {
        let (d, _executor) = dispatcher().await;
        let lt_id = create_launch_template(&d).await;
        create_asg(&d, &lt_id, 1, 3, 2).await;

        let group = asg_view(&d, "web").await;
        assert_eq!(group.instances.len(), 2);
        let ids: Vec<String> = group.instances.iter().map(|m| m.id.clone()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        let max_before = ids.into_iter().max().unwrap();

        d.dispatch(Action::SetDesiredCapacity { name: "web".to_string(), desired: 3 }, false)
            .await
            .unwrap();

        let group = asg_view(&d, "web").await;
        assert_eq!(group.instances.len(), 3);
        let max_after = group.instances.iter().map(|m| m.id.clone()).max().unwrap();
        assert!(max_after > max_before);
    }

    // S3: warm pool reconciles to its floor, and scale-in reuse parks members
    // in the pool without a later reconcile shrinking them back out.
    #[tokio::test]
    async fn s3_warm_pool_reconciles_and_scale_in_reuse_does_not_shrink_it_back() {
        let (d, executor) = dispatcher().await;
        let lt_id = create_launch_template(&d).await;
        create_asg(&d, &lt_id, 1, 3, 2).await;

        d.dispatch(
            Action::PutWarmPool(PutWarmPoolRequest {
                group: "web".to_string(),
                min: 1,
                max_prepared: None,
                pool_state: WarmPoolState::Stopped,
                reuse_on_scale_in: true,
            }),
            false,
        )
        .await
        .unwrap();

        let resp = d
            .dispatch(Action::DescribeWarmPool { group: "web".to_string() }, false)
            .await
            .unwrap();
        let Response::WarmPool(Some(pool)) = resp else { panic!("expected a warm pool") };
        assert_eq!(pool.instances.len(), 1);
        let described = executor.describe_instances(&[pool.instances[0].id.clone()]).await.unwrap();
        assert_eq!(described[0].state.name(), "stopped");

        let mut live_ids: Vec<String> =
            asg_view(&d, "web").await.instances.into_iter().map(|m| m.id).collect();
        live_ids.sort();
        let smallest_live = live_ids[0].clone();

        d.dispatch(Action::SetDesiredCapacity { name: "web".to_string(), desired: 3 }, false)
            .await
            .unwrap();
        d.dispatch(Action::SetDesiredCapacity { name: "web".to_string(), desired: 2 }, false)
            .await
            .unwrap();

        let group = asg_view(&d, "web").await;
        assert_eq!(group.instances.len(), 2);
        let warm = group.warm_pool.expect("warm pool still configured");
        assert_eq!(warm.instances.len(), 2);
        assert!(warm.instances.iter().any(|m| m.id == smallest_live));
    }

    // S4: spot reclaim terminates at `after` with the spot reason code, not before.
    #[tokio::test(start_paused = true)]
    async fn s4_spot_instance_reclaimed_after_after_elapses() {
        let (d, _executor) = dispatcher().await;
        let mut req = run_instances_req(1, MarketType::Spot);
        req.spot_reclaim_after = Duration::from_secs(2);
        req.spot_reclaim_notice = Duration::from_millis(500);
        let resp = d.dispatch(Action::RunInstances(req), false).await.unwrap();
        let Response::Instances(views, _) = resp else { panic!("expected Instances") };
        let id = views[0].id.clone();

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1500)).await;
        tokio::task::yield_now().await;

        let resp = d
            .dispatch(
                Action::DescribeInstances(action::DescribeInstancesRequest {
                    ids: vec![id.clone()],
                    ..Default::default()
                }),
                false,
            )
            .await
            .unwrap();
        let Response::Instances(views, _) = resp else { panic!("expected Instances") };
        assert_eq!(views[0].state.name(), "running");

        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        let resp = d
            .dispatch(
                Action::DescribeInstances(action::DescribeInstancesRequest {
                    ids: vec![id.clone()],
                    ..Default::default()
                }),
                false,
            )
            .await
            .unwrap();
        let Response::Instances(views, _) = resp else { panic!("expected Instances") };
        assert_eq!(views[0].state.name(), "terminated");
        assert_eq!(views[0].state_reason_code.as_deref(), Some("Server.SpotInstanceTermination"));
    }

    // S5: deleting a non-empty group without force is ResourceInUse; force
    // succeeds and the group is then gone.
    #[tokio::test]
    async fn s5_delete_group_requires_force_when_nonempty() {
        let (d, _executor) = dispatcher().await;
        let lt_id = create_launch_template(&d).await;
        create_asg(&d, &lt_id, 1, 3, 2).await;

        let err = d
            .dispatch(Action::DeleteAutoScalingGroup { name: "web".to_string(), force_delete: false }, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ResourceInUse");

        d.dispatch(Action::DeleteAutoScalingGroup { name: "web".to_string(), force_delete: true }, false)
            .await
            .unwrap();

        let err = d
            .dispatch(Action::DescribeAutoScalingGroups { names: vec!["web".to_string()] }, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ResourceNotFound");
    }

    // S6: an IMDS token authenticates the owning instance until it's terminated.
    #[tokio::test]
    async fn s6_imds_token_round_trips_then_denies_after_terminate() {
        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use tower::ServiceExt;

        let (d, _executor) = dispatcher().await;
        let resp = d
            .dispatch(Action::RunInstances(run_instances_req(1, MarketType::OnDemand)), false)
            .await
            .unwrap();
        let Response::Instances(views, _) = resp else { panic!("expected Instances") };
        let id = views[0].id.clone();

        let peer = std::net::SocketAddr::new(synthesize_ip(&id), 4567);
        let router = crate::imds::router(d.imds_state());

        let mut token_req = Request::builder()
            .method("PUT")
            .uri("/latest/api/token")
            .header("x-aws-ec2-metadata-token-ttl-seconds", "60")
            .body(Body::empty())
            .unwrap();
        token_req.extensions_mut().insert(axum::extract::ConnectInfo(peer));
        let resp = router.clone().oneshot(token_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let token = String::from_utf8(
            axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec(),
        )
        .unwrap();

        let mut id_req = Request::builder()
            .uri("/latest/meta-data/instance-id")
            .header("x-aws-ec2-metadata-token", token.as_str())
            .body(Body::empty())
            .unwrap();
        id_req.extensions_mut().insert(axum::extract::ConnectInfo(peer));
        let resp = router.clone().oneshot(id_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = String::from_utf8(
            axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec(),
        )
        .unwrap();
        assert_eq!(body, id);

        d.dispatch(Action::TerminateInstances { ids: vec![id.clone()] }, false).await.unwrap();

        let mut id_req_again = Request::builder()
            .uri("/latest/meta-data/instance-id")
            .header("x-aws-ec2-metadata-token", token.as_str())
            .body(Body::empty())
            .unwrap();
        id_req_again.extensions_mut().insert(axum::extract::ConnectInfo(peer));
        let resp = router.oneshot(id_req_again).await.unwrap();
        assert!(resp.status() == StatusCode::NOT_FOUND || resp.status() == StatusCode::UNAUTHORIZED);
    }

    // Invariant 4: CreateTags then DeleteTags(exact value) is the identity;
    // DeleteTags with an empty/omitted value wildcards the key.
    #[tokio::test]
    async fn create_then_delete_tags_is_identity_and_wildcard_clears_key() {
        let (d, _executor) = dispatcher().await;
        let resp = d
            .dispatch(Action::RunInstances(run_instances_req(1, MarketType::OnDemand)), false)
            .await
            .unwrap();
        let Response::Instances(views, _) = resp else { panic!("expected Instances") };
        let id = views[0].id.clone();
        let base_tags = vec![("Name".to_string(), "app".to_string())];

        d.dispatch(
            Action::CreateTags { resource_ids: vec![id.clone()], tags: vec![("Env".to_string(), "prod".to_string())] },
            false,
        )
        .await
        .unwrap();
        d.dispatch(
            Action::DeleteTags {
                resource_ids: vec![id.clone()],
                tags: vec![("Env".to_string(), Some("prod".to_string()))],
            },
            false,
        )
        .await
        .unwrap();
        let resp = d
            .dispatch(
                Action::DescribeInstances(action::DescribeInstancesRequest { ids: vec![id.clone()], ..Default::default() }),
                false,
            )
            .await
            .unwrap();
        let Response::Instances(views, _) = resp else { panic!("expected Instances") };
        assert_eq!(views[0].tags, base_tags);

        d.dispatch(
            Action::CreateTags { resource_ids: vec![id.clone()], tags: vec![("Env".to_string(), "prod".to_string())] },
            false,
        )
        .await
        .unwrap();
        d.dispatch(
            Action::DeleteTags { resource_ids: vec![id.clone()], tags: vec![("Env".to_string(), None)] },
            false,
        )
        .await
        .unwrap();
        let resp = d
            .dispatch(
                Action::DescribeInstances(action::DescribeInstancesRequest { ids: vec![id], ..Default::default() }),
                false,
            )
            .await
            .unwrap();
        let Response::Instances(views, _) = resp else { panic!("expected Instances") };
        assert_eq!(views[0].tags, base_tags);
    }

    // Invariant 5: adding a filter never enlarges the DescribeInstances result.
    #[tokio::test]
    async fn adding_a_filter_never_enlarges_describe_instances_result() {
        let (d, _executor) = dispatcher().await;
        d.dispatch(Action::RunInstances(run_instances_req(3, MarketType::OnDemand)), false)
            .await
            .unwrap();

        let resp = d
            .dispatch(Action::DescribeInstances(action::DescribeInstancesRequest::default()), false)
            .await
            .unwrap();
        let Response::Instances(all_views, _) = resp else { panic!("expected Instances") };

        let resp = d
            .dispatch(
                Action::DescribeInstances(action::DescribeInstancesRequest {
                    filters: vec![filters::Filter {
                        name: "instance-state-name".to_string(),
                        values: vec!["stopped".to_string()],
                    }],
                    ..Default::default()
                }),
                false,
            )
            .await
            .unwrap();
        let Response::Instances(filtered_views, _) = resp else { panic!("expected Instances") };

        assert!(filtered_views.len() <= all_views.len());
        assert!(filtered_views.is_empty());
    }

    // Invariant 6: repeated paginated calls partition the full ordered result
    // with no overlaps or gaps.
    #[tokio::test]
    async fn pagination_partitions_describe_instances_with_no_overlap_or_gaps() {
        let (d, _executor) = dispatcher().await;
        d.dispatch(Action::RunInstances(run_instances_req(5, MarketType::OnDemand)), false)
            .await
            .unwrap();

        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let resp = d
                .dispatch(
                    Action::DescribeInstances(action::DescribeInstancesRequest {
                        max_results: Some(2),
                        next_token: token.clone(),
                        ..Default::default()
                    }),
                    false,
                )
                .await
                .unwrap();
            let Response::Instances(page, next) = resp else { panic!("expected Instances") };
            seen.extend(page.into_iter().map(|v| v.id));
            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        let mut sorted_seen = seen.clone();
        sorted_seen.sort();
        sorted_seen.dedup();
        assert_eq!(sorted_seen.len(), 5);
        assert_eq!(seen.len(), 5);
    }
}
