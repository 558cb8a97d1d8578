// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Contract over the container/volume runtime collaborator.
//!
//! The real backend (pull image, create, start, stop, remove, inspect,
//! list, subscribe to events) is an external collaborator — this module
//! only defines the trait an embedder implements, plus
//! [`fake::FakeExecutor`], an in-memory double complete enough to drive
//! the full control loop and test suite.

pub mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors the executor can report. Anything other than the two "not
/// found" variants is surfaced by the dispatcher as a wrapped transport
/// failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("volume not found: {0}")]
    VolumeNotFound(String),
    #[error("runtime error: {0}")]
    Other(String),
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeInstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl RuntimeInstanceState {
    /// The well-known EC2 state code paired with this state's name.
    pub fn code(self) -> u16 {
        match self {
            RuntimeInstanceState::Pending => 0,
            RuntimeInstanceState::Running => 16,
            RuntimeInstanceState::ShuttingDown => 32,
            RuntimeInstanceState::Terminated => 48,
            RuntimeInstanceState::Stopping => 64,
            RuntimeInstanceState::Stopped => 80,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RuntimeInstanceState::Pending => "pending",
            RuntimeInstanceState::Running => "running",
            RuntimeInstanceState::ShuttingDown => "shutting-down",
            RuntimeInstanceState::Terminated => "terminated",
            RuntimeInstanceState::Stopping => "stopping",
            RuntimeInstanceState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// One instance's runtime-observed facts.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDescription {
    pub id: String,
    pub state: RuntimeInstanceState,
    pub instance_type: String,
    pub image_id: String,
    pub architecture: String,
    pub launch_time: DateTime<Utc>,
    pub private_ip: String,
    pub public_ip: Option<String>,
    pub private_dns: String,
    pub public_dns: Option<String>,
    pub health: HealthStatus,
}

/// The result of a Start/Stop/Terminate call on one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceTransition {
    pub id: String,
    pub previous_state: RuntimeInstanceState,
    pub current_state: RuntimeInstanceState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeAttachment {
    pub device: String,
    pub instance_id: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeDescription {
    pub id: String,
    pub size_bytes: u64,
    pub attachment: Option<VolumeAttachment>,
}

/// A runtime lifecycle event. Only the four kinds the watcher treats as
/// reconciliation triggers are modeled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEventKind {
    Destroy,
    Die,
    Stop,
    HealthUnhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub kind: RuntimeEventKind,
    /// `None` when the event carried no instance-id label; the watcher
    /// logs and drops these.
    pub instance_id: Option<String>,
}

/// Contract over the container/volume runtime. All operations are
/// `async` since the only blocking work a handler does is this call,
/// bounded by the runtime's own timeouts.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn create_instances(
        &self,
        image: &str,
        instance_type: &str,
        count: u32,
        user_data: &str,
    ) -> ExecutorResult<Vec<String>>;

    async fn start_instances(&self, ids: &[String]) -> ExecutorResult<Vec<InstanceTransition>>;

    async fn stop_instances(
        &self,
        ids: &[String],
        force: bool,
    ) -> ExecutorResult<Vec<InstanceTransition>>;

    async fn terminate_instances(
        &self,
        ids: &[String],
    ) -> ExecutorResult<Vec<InstanceTransition>>;

    /// Nonexistent ids are silently dropped from the result.
    async fn describe_instances(&self, ids: &[String]) -> ExecutorResult<Vec<InstanceDescription>>;

    async fn list_owned_instances(&self) -> ExecutorResult<Vec<String>>;

    async fn create_volume(&self, size_bytes: u64) -> ExecutorResult<String>;

    async fn delete_volume(&self, id: &str) -> ExecutorResult<()>;

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> ExecutorResult<VolumeAttachment>;

    /// Returns the detached attachment (device/instance/time).
    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
    ) -> ExecutorResult<VolumeAttachment>;

    async fn describe_volumes(&self, ids: &[String]) -> ExecutorResult<Vec<VolumeDescription>>;

    /// A channel of lifecycle events for containers labelled as ours.
    /// Closing the returned receiver signals stream termination; the
    /// watcher reconnects with backoff.
    async fn subscribe_events(&self) -> ExecutorResult<tokio::sync::mpsc::Receiver<RuntimeEvent>>;

    /// Full teardown path used by [`crate::exit::ExitMode::Cleanup`].
    async fn close(&self) -> ExecutorResult<()>;

    /// Lightweight disconnect used by [`crate::exit::ExitMode::Keep`] and
    /// [`crate::exit::ExitMode::Assert`].
    async fn disconnect(&self) -> ExecutorResult<()>;
}
