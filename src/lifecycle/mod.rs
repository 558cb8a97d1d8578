// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle event watcher and reconciler.
//!
//! Two cooperating tasks: the watcher subscribes to the executor's event
//! stream and posts affected instance ids into a deduplicated pending set;
//! the reconciler wakes on that set filling up, drains it under the
//! dispatch lock, and reconciles every ASG the pending instances belong to.
//! Neither task ever mutates state without the dispatch lock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::executor::{Executor, RuntimeEventKind};
use crate::imds::ImdsState;
use crate::store::attrs::keys;
use crate::dispatcher::DispatcherState;
use crate::store::ResourceId;

const MAX_BACKOFF: Duration = Duration::from_secs(5);
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Deduplicated set of instance ids awaiting reconciliation, plus the
/// signal that wakes the reconciler. Guarded by its own mutex, never the
/// dispatch lock, to keep lock ordering consistent.
#[derive(Default)]
pub struct PendingEvents {
    set: std::sync::Mutex<HashSet<String>>,
    notify: Notify,
}

impl PendingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(PendingEvents::default())
    }

    fn add(&self, instance_id: String) {
        self.set.lock().expect("pending-events lock poisoned").insert(instance_id);
        self.notify.notify_one();
    }

    /// Drains the set. Called both before each dispatched action and by
    /// the reconciler task.
    pub fn drain(&self) -> Vec<String> {
        self.set
            .lock()
            .expect("pending-events lock poisoned")
            .drain()
            .collect()
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Runs the watcher loop: subscribe, read events, reconnect with backoff
/// on stream termination. Exits when `cancel` fires.
pub async fn run_watcher(
    executor: Arc<dyn Executor>,
    pending: Arc<PendingEvents>,
    cancel: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let mut events = match executor.subscribe_events().await {
            Ok(rx) => rx,
            Err(err) => {
                tracing::warn!(error = %err, backoff_ms = backoff.as_millis(), "event subscribe failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    match event {
                        Some(event) => handle_event(&pending, event),
                        None => break,
                    }
                }
            }
        }

        tracing::info!(backoff_ms = backoff.as_millis(), "event stream ended, reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn handle_event(pending: &PendingEvents, event: crate::executor::RuntimeEvent) {
    let is_trigger = matches!(
        event.kind,
        RuntimeEventKind::Destroy
            | RuntimeEventKind::Die
            | RuntimeEventKind::Stop
            | RuntimeEventKind::HealthUnhealthy
    );
    if !is_trigger {
        return;
    }
    match event.instance_id {
        Some(id) => pending.add(id),
        None => tracing::debug!("lifecycle event carried no instance id, dropping"),
    }
}

/// Runs the reconciler loop: wait for a notify or cancellation, then
/// acquire the dispatch lock, drain pending ids, and reconcile every ASG
/// they belong to.
pub async fn run_reconciler(
    state: Arc<Mutex<DispatcherState>>,
    executor: Arc<dyn Executor>,
    imds: ImdsState,
    config: Arc<EngineConfig>,
    pending: Arc<PendingEvents>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = pending.notified() => {}
        }
        if let Err(err) = reconcile_pending(&state, &*executor, &imds, &config, &pending).await {
            tracing::warn!(error = %err, "reconcile pass failed");
        }
    }
}

pub async fn reconcile_pending(
    state: &Mutex<DispatcherState>,
    executor: &dyn Executor,
    imds: &ImdsState,
    config: &EngineConfig,
    pending: &PendingEvents,
) -> crate::error::Result<()> {
    let ids = pending.drain();
    if ids.is_empty() {
        return Ok(());
    }
    let mut guard = state.lock().await;
    let mut groups = HashSet::new();
    for id in &ids {
        let rid = ResourceId::from(id.as_str());
        if let Some(group) = guard.store.get_attribute(&rid, keys::ASG_NAME) {
            groups.insert(group);
        }
    }
    for group in groups {
        crate::asg::reconcile(&mut guard.store, executor, imds, config, &group).await?;
    }
    Ok(())
}
