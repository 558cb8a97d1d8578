// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory [`Executor`] double. Good enough to drive the full control
//! loop and test suite without a real container daemon; a real backend is
//! an external collaborator this crate does not provide.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};

use super::{
    Executor, ExecutorError, ExecutorResult, HealthStatus, InstanceDescription,
    InstanceTransition, RuntimeEvent, RuntimeInstanceState, VolumeAttachment, VolumeDescription,
};

#[derive(Debug, Clone)]
struct FakeInstance {
    state: RuntimeInstanceState,
    instance_type: String,
    image_id: String,
    health: HealthStatus,
    launch_time: chrono::DateTime<Utc>,
    private_ip: String,
}

#[derive(Debug, Clone)]
struct FakeVolume {
    size_bytes: u64,
    attachment: Option<VolumeAttachment>,
}

#[derive(Default)]
struct FakeState {
    instances: HashMap<String, FakeInstance>,
    volumes: HashMap<String, FakeVolume>,
}

/// An in-memory stand-in for a container/volume runtime.
///
/// Instance and volume ids are monotonically assigned (`i-1`, `i-2`, ...,
/// `vol-1`, ...) so tests can assert on exact ids deterministically.
pub struct FakeExecutor {
    state: Mutex<FakeState>,
    next_instance: AtomicU64,
    next_volume: AtomicU64,
    events_tx: mpsc::Sender<RuntimeEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<RuntimeEvent>>>,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(256);
        Arc::new(FakeExecutor {
            state: Mutex::new(FakeState::default()),
            next_instance: AtomicU64::new(1),
            next_volume: AtomicU64::new(1),
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
        })
    }

    /// Test/driver hook: push a lifecycle event as if the runtime emitted
    /// it, for exercising [`crate::lifecycle`].
    pub async fn inject_event(&self, event: RuntimeEvent) {
        let _ = self.events_tx.send(event).await;
    }

    /// Test/driver hook: kill an instance out from under the store, the
    /// way a crashed container would, then emit the matching `die` event.
    pub async fn kill_instance(&self, id: &str) {
        {
            let mut state = self.state.lock().await;
            state.instances.remove(id);
        }
        self.inject_event(RuntimeEvent {
            kind: super::RuntimeEventKind::Die,
            instance_id: Some(id.to_string()),
        })
        .await;
    }

    /// Test/driver hook: flip an instance's reported health without
    /// removing it, to exercise the ASG loop's unhealthy-replacement path.
    pub async fn mark_unhealthy(&self, id: &str) {
        let mut state = self.state.lock().await;
        if let Some(instance) = state.instances.get_mut(id) {
            instance.health = HealthStatus::Unhealthy;
        }
    }

    fn alloc_instance_id(&self) -> String {
        format!("i-{:016x}", self.next_instance.fetch_add(1, Ordering::SeqCst))
    }

    fn alloc_volume_id(&self) -> String {
        format!("vol-{:016x}", self.next_volume.fetch_add(1, Ordering::SeqCst))
    }

    fn describe_one(id: &str, inst: &FakeInstance) -> InstanceDescription {
        InstanceDescription {
            id: id.to_string(),
            state: inst.state,
            instance_type: inst.instance_type.clone(),
            image_id: inst.image_id.clone(),
            architecture: "x86_64".to_string(),
            launch_time: inst.launch_time,
            private_ip: inst.private_ip.clone(),
            public_ip: None,
            private_dns: format!("ip-{}.ec2.internal", inst.private_ip.replace('.', "-")),
            public_dns: None,
            health: inst.health,
        }
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn create_instances(
        &self,
        image: &str,
        instance_type: &str,
        count: u32,
        _user_data: &str,
    ) -> ExecutorResult<Vec<String>> {
        let mut state = self.state.lock().await;
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = self.alloc_instance_id();
            let octet = (state.instances.len() + 1) % 255;
            state.instances.insert(
                id.clone(),
                FakeInstance {
                    state: RuntimeInstanceState::Pending,
                    instance_type: instance_type.to_string(),
                    image_id: image.to_string(),
                    health: HealthStatus::Unknown,
                    launch_time: Utc::now(),
                    private_ip: format!("10.0.0.{octet}"),
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn start_instances(&self, ids: &[String]) -> ExecutorResult<Vec<InstanceTransition>> {
        let mut state = self.state.lock().await;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let inst = state
                .instances
                .get_mut(id)
                .ok_or_else(|| ExecutorError::InstanceNotFound(id.clone()))?;
            let previous_state = inst.state;
            inst.state = RuntimeInstanceState::Running;
            inst.health = HealthStatus::Healthy;
            out.push(InstanceTransition {
                id: id.clone(),
                previous_state,
                current_state: inst.state,
            });
        }
        Ok(out)
    }

    async fn stop_instances(
        &self,
        ids: &[String],
        _force: bool,
    ) -> ExecutorResult<Vec<InstanceTransition>> {
        let mut state = self.state.lock().await;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let inst = state
                .instances
                .get_mut(id)
                .ok_or_else(|| ExecutorError::InstanceNotFound(id.clone()))?;
            let previous_state = inst.state;
            inst.state = RuntimeInstanceState::Stopped;
            out.push(InstanceTransition {
                id: id.clone(),
                previous_state,
                current_state: inst.state,
            });
        }
        Ok(out)
    }

    async fn terminate_instances(
        &self,
        ids: &[String],
    ) -> ExecutorResult<Vec<InstanceTransition>> {
        let mut state = self.state.lock().await;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let previous_state = state
                .instances
                .get(id)
                .map(|i| i.state)
                .ok_or_else(|| ExecutorError::InstanceNotFound(id.clone()))?;
            state.instances.remove(id);
            out.push(InstanceTransition {
                id: id.clone(),
                previous_state,
                current_state: RuntimeInstanceState::Terminated,
            });
        }
        Ok(out)
    }

    async fn describe_instances(&self, ids: &[String]) -> ExecutorResult<Vec<InstanceDescription>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.instances.get(id).map(|inst| Self::describe_one(id, inst)))
            .collect())
    }

    async fn list_owned_instances(&self) -> ExecutorResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state.instances.keys().cloned().collect())
    }

    async fn create_volume(&self, size_bytes: u64) -> ExecutorResult<String> {
        let mut state = self.state.lock().await;
        let id = self.alloc_volume_id();
        state.volumes.insert(
            id.clone(),
            FakeVolume {
                size_bytes,
                attachment: None,
            },
        );
        Ok(id)
    }

    async fn delete_volume(&self, id: &str) -> ExecutorResult<()> {
        let mut state = self.state.lock().await;
        state
            .volumes
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ExecutorError::VolumeNotFound(id.to_string()))
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> ExecutorResult<VolumeAttachment> {
        let mut state = self.state.lock().await;
        if !state.instances.contains_key(instance_id) {
            return Err(ExecutorError::InstanceNotFound(instance_id.to_string()));
        }
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| ExecutorError::VolumeNotFound(volume_id.to_string()))?;
        let attachment = VolumeAttachment {
            device: device.to_string(),
            instance_id: instance_id.to_string(),
            time: Utc::now(),
        };
        volume.attachment = Some(attachment.clone());
        Ok(attachment)
    }

    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
    ) -> ExecutorResult<VolumeAttachment> {
        let mut state = self.state.lock().await;
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| ExecutorError::VolumeNotFound(volume_id.to_string()))?;
        match volume.attachment.take() {
            Some(mut attachment) if attachment.instance_id == instance_id => {
                attachment.time = Utc::now();
                Ok(attachment)
            }
            Some(other) => {
                volume.attachment = Some(other);
                Err(ExecutorError::Other(format!(
                    "volume {volume_id} is not attached to {instance_id}"
                )))
            }
            None => Err(ExecutorError::Other(format!("volume {volume_id} is not attached"))),
        }
    }

    async fn describe_volumes(&self, ids: &[String]) -> ExecutorResult<Vec<VolumeDescription>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                state.volumes.get(id).map(|v| VolumeDescription {
                    id: id.clone(),
                    size_bytes: v.size_bytes,
                    attachment: v.attachment.clone(),
                })
            })
            .collect())
    }

    async fn subscribe_events(&self) -> ExecutorResult<mpsc::Receiver<RuntimeEvent>> {
        self.events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ExecutorError::Other("event stream already subscribed".to_string()))
    }

    async fn close(&self) -> ExecutorResult<()> {
        let mut state = self.state.lock().await;
        state.instances.clear();
        state.volumes.clear();
        Ok(())
    }

    async fn disconnect(&self) -> ExecutorResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_start_describe_round_trip() {
        let executor = FakeExecutor::new();
        let ids = executor
            .create_instances("ami-test", "t3.micro", 2, "")
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        executor.start_instances(&ids).await.unwrap();
        let described = executor.describe_instances(&ids).await.unwrap();
        assert_eq!(described.len(), 2);
        assert!(described
            .iter()
            .all(|d| d.state == RuntimeInstanceState::Running));
    }

    #[tokio::test]
    async fn describe_silently_drops_missing_ids() {
        let executor = FakeExecutor::new();
        let ids = executor
            .create_instances("ami-test", "t3.micro", 1, "")
            .await
            .unwrap();
        let described = executor
            .describe_instances(&[ids[0].clone(), "i-ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(described.len(), 1);
    }

    #[tokio::test]
    async fn attach_detach_volume() {
        let executor = FakeExecutor::new();
        let ids = executor
            .create_instances("ami-test", "t3.micro", 1, "")
            .await
            .unwrap();
        let vol = executor.create_volume(8_000_000_000).await.unwrap();
        let attachment = executor
            .attach_volume(&vol, &ids[0], "/dev/sdf")
            .await
            .unwrap();
        assert_eq!(attachment.instance_id, ids[0]);

        let detached = executor.detach_volume(&vol, &ids[0]).await.unwrap();
        assert_eq!(detached.device, "/dev/sdf");
    }

    #[tokio::test]
    async fn kill_instance_emits_die_event() {
        let executor = FakeExecutor::new();
        let ids = executor
            .create_instances("ami-test", "t3.micro", 1, "")
            .await
            .unwrap();
        let mut rx = executor.subscribe_events().await.unwrap();
        executor.kill_instance(&ids[0]).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.instance_id, Some(ids[0].clone()));
        assert_eq!(event.kind, super::super::RuntimeEventKind::Die);
    }
}
