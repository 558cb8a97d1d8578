// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! The decoded-request/response vocabulary: a tagged request variant
//! routed by an action enum.
//!
//! Embedders decode the AWS wire protocol themselves (an external
//! collaborator, not this crate's concern) and construct one of these
//! directly.

use chrono::{DateTime, Utc};

use crate::executor::HealthStatus;
use crate::store::attrs::{BlockDeviceMapping, WarmPoolState};

use super::filters::Filter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketType {
    OnDemand,
    Spot,
}

#[derive(Debug, Clone)]
pub struct RunInstancesRequest {
    pub image_id: String,
    pub instance_type: String,
    pub count: u32,
    pub user_data: String,
    pub key_name: Option<String>,
    pub tags: Vec<(String, String)>,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub availability_zone: Option<String>,
    pub market: MarketType,
    /// Only meaningful when `market == Spot`; `after == 0` disables
    /// scheduling a reclaim timer.
    pub spot_reclaim_after: std::time::Duration,
    pub spot_reclaim_notice: std::time::Duration,
}

#[derive(Debug, Clone, Default)]
pub struct DescribeInstancesRequest {
    pub ids: Vec<String>,
    pub filters: Vec<Filter>,
    pub max_results: Option<u32>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateVolumeRequest {
    pub size_bytes: u64,
    pub availability_zone: String,
    pub encrypted: bool,
    pub iops: Option<u32>,
    pub throughput: Option<u32>,
    pub kms_key_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateLaunchTemplateRequest {
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub user_data: String,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

#[derive(Debug, Clone)]
pub struct CreateLaunchTemplateVersionRequest {
    pub id: String,
    pub image_id: String,
    pub instance_type: String,
    pub user_data: String,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub set_as_default: bool,
}

#[derive(Debug, Clone)]
pub struct CreateAutoScalingGroupRequest {
    pub name: String,
    pub min: u32,
    pub max: u32,
    pub desired: u32,
    pub launch_template_id: String,
    pub vpc_zones: Vec<String>,
    pub default_cooldown: std::time::Duration,
    pub health_check_type: String,
    pub tags: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateAutoScalingGroupRequest {
    pub name: String,
    pub min: Option<u32>,
    pub max: Option<u32>,
    pub desired: Option<u32>,
    pub launch_template_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PutWarmPoolRequest {
    pub group: String,
    pub min: u32,
    pub max_prepared: Option<u32>,
    pub pool_state: WarmPoolState,
    pub reuse_on_scale_in: bool,
}

/// A decoded, already-authenticated control-plane request.
#[derive(Debug, Clone)]
pub enum Action {
    RunInstances(RunInstancesRequest),
    DescribeInstances(DescribeInstancesRequest),
    DescribeInstanceStatus(DescribeInstancesRequest),
    StartInstances { ids: Vec<String> },
    StopInstances { ids: Vec<String>, force: bool },
    TerminateInstances { ids: Vec<String> },
    ModifyInstanceMetadataOptions { id: String, disable_imds: Option<bool> },
    DescribeInstanceTypes,
    DescribeInstanceTypeOfferings { location: Option<String> },
    GetInstanceTypesFromInstanceRequirements,

    CreateTags { resource_ids: Vec<String>, tags: Vec<(String, String)> },
    DeleteTags { resource_ids: Vec<String>, tags: Vec<(String, Option<String>)> },

    CreateVolume(CreateVolumeRequest),
    DeleteVolume { id: String },
    AttachVolume { volume_id: String, instance_id: String, device: String },
    DetachVolume { volume_id: String, instance_id: String },
    DescribeVolumes { ids: Vec<String> },

    CreateLaunchTemplate(CreateLaunchTemplateRequest),
    CreateLaunchTemplateVersion(CreateLaunchTemplateVersionRequest),
    DescribeLaunchTemplates { ids: Vec<String> },
    DeleteLaunchTemplate { id: String },

    CreateOrUpdateAutoScalingTags { resource_id: String, tags: Vec<(String, String)> },
    CreateAutoScalingGroup(CreateAutoScalingGroupRequest),
    UpdateAutoScalingGroup(UpdateAutoScalingGroupRequest),
    DeleteAutoScalingGroup { name: String, force_delete: bool },
    DescribeAutoScalingGroups { names: Vec<String> },
    SetDesiredCapacity { name: String, desired: u32 },
    DetachInstances { name: String, ids: Vec<String>, decrement_desired: bool },
    PutWarmPool(PutWarmPoolRequest),
    DescribeWarmPool { group: String },
    DeleteWarmPool { group: String, force: bool },
}

impl Action {
    /// Name used for fault-profile rule matching and tracing spans; not a
    /// wire name since the wire codec is an external collaborator.
    pub fn name(&self) -> &'static str {
        match self {
            Action::RunInstances(_) => "RunInstances",
            Action::DescribeInstances(_) => "DescribeInstances",
            Action::DescribeInstanceStatus(_) => "DescribeInstanceStatus",
            Action::StartInstances { .. } => "StartInstances",
            Action::StopInstances { .. } => "StopInstances",
            Action::TerminateInstances { .. } => "TerminateInstances",
            Action::ModifyInstanceMetadataOptions { .. } => "ModifyInstanceMetadataOptions",
            Action::DescribeInstanceTypes => "DescribeInstanceTypes",
            Action::DescribeInstanceTypeOfferings { .. } => "DescribeInstanceTypeOfferings",
            Action::GetInstanceTypesFromInstanceRequirements => {
                "GetInstanceTypesFromInstanceRequirements"
            }
            Action::CreateTags { .. } => "CreateTags",
            Action::DeleteTags { .. } => "DeleteTags",
            Action::CreateVolume(_) => "CreateVolume",
            Action::DeleteVolume { .. } => "DeleteVolume",
            Action::AttachVolume { .. } => "AttachVolume",
            Action::DetachVolume { .. } => "DetachVolume",
            Action::DescribeVolumes { .. } => "DescribeVolumes",
            Action::CreateLaunchTemplate(_) => "CreateLaunchTemplate",
            Action::CreateLaunchTemplateVersion(_) => "CreateLaunchTemplateVersion",
            Action::DescribeLaunchTemplates { .. } => "DescribeLaunchTemplates",
            Action::DeleteLaunchTemplate { .. } => "DeleteLaunchTemplate",
            Action::CreateOrUpdateAutoScalingTags { .. } => "CreateOrUpdateAutoScalingTags",
            Action::CreateAutoScalingGroup(_) => "CreateAutoScalingGroup",
            Action::UpdateAutoScalingGroup(_) => "UpdateAutoScalingGroup",
            Action::DeleteAutoScalingGroup { .. } => "DeleteAutoScalingGroup",
            Action::DescribeAutoScalingGroups { .. } => "DescribeAutoScalingGroups",
            Action::SetDesiredCapacity { .. } => "SetDesiredCapacity",
            Action::DetachInstances { .. } => "DetachInstances",
            Action::PutWarmPool(_) => "PutWarmPool",
            Action::DescribeWarmPool { .. } => "DescribeWarmPool",
            Action::DeleteWarmPool { .. } => "DeleteWarmPool",
        }
    }
}

/// An instance reshaped for responses: runtime description fused with
/// stored attributes, runtime truth winning on conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceView {
    pub id: String,
    pub state: crate::executor::RuntimeInstanceState,
    pub instance_type: String,
    pub image_id: String,
    pub availability_zone: String,
    pub key_name: Option<String>,
    pub private_ip: String,
    pub public_ip: Option<String>,
    pub private_dns: String,
    pub public_dns: Option<String>,
    pub launch_time: DateTime<Utc>,
    pub health: HealthStatus,
    pub state_reason_code: Option<String>,
    pub tags: Vec<(String, String)>,
}

impl super::filters::Filterable for InstanceView {
    fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "instance-state-name" => Some(self.state.name().to_string()),
            "instance-type" => Some(self.instance_type.clone()),
            "availability-zone" => Some(self.availability_zone.clone()),
            "instance-id" => Some(self.id.clone()),
            "private-ip-address" => Some(self.private_ip.clone()),
            "ip-address" => self.public_ip.clone(),
            "private-dns-name" => Some(self.private_dns.clone()),
            "dns-name" => self.public_dns.clone(),
            _ => None,
        }
    }

    fn tags(&self) -> &[(String, String)] {
        &self.tags
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeView {
    pub id: String,
    pub size_bytes: u64,
    pub availability_zone: String,
    pub encrypted: bool,
    pub attached_instance: Option<String>,
    pub attached_device: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchTemplateView {
    pub id: String,
    pub name: String,
    pub default_version: u32,
    pub versions: Vec<crate::store::attrs::LaunchTemplateVersion>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsgMemberView {
    pub id: String,
    pub lifecycle_state: &'static str,
    pub health: HealthStatus,
    pub warm_pool: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WarmPoolView {
    pub min: u32,
    pub max_prepared: Option<u32>,
    pub pool_state: WarmPoolState,
    pub status: crate::store::attrs::WarmPoolStatus,
    pub instances: Vec<AsgMemberView>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsgView {
    pub name: String,
    pub min: u32,
    pub max: u32,
    pub desired: u32,
    pub created_time: DateTime<Utc>,
    pub launch_template_id: String,
    pub vpc_zones: Vec<String>,
    pub default_cooldown: std::time::Duration,
    pub health_check_type: String,
    pub instances: Vec<AsgMemberView>,
    pub tags: Vec<(String, String)>,
    pub warm_pool: Option<WarmPoolView>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceTypeOffering {
    pub instance_type: String,
    pub location: String,
}

/// The response to a dispatched [`Action`]. One variant per handler family
/// rather than per action, since several actions share a shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Empty,
    InstanceIds(Vec<String>),
    Instances(Vec<InstanceView>, Option<String>),
    InstanceTransitions(Vec<crate::executor::InstanceTransition>),
    VolumeId(String),
    VolumeAttachment(crate::executor::VolumeAttachment),
    Volumes(Vec<VolumeView>),
    Tags(Vec<(String, String, String)>),
    LaunchTemplate(LaunchTemplateView),
    LaunchTemplates(Vec<LaunchTemplateView>),
    AutoScalingGroup(AsgView),
    AutoScalingGroups(Vec<AsgView>),
    WarmPool(Option<WarmPoolView>),
    InstanceTypeOfferings(Vec<InstanceTypeOffering>),
}
