// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-instance spot reclaim timer.
//!
//! One task per instance, cancelable via a [`CancellationToken`] the
//! Dispatcher indexes by instance id: one context per job, an index of
//! cancel functions keyed by instance id, replace-and-cancel on
//! reschedule.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::DispatcherState;
use crate::executor::{Executor, ExecutorError};
use crate::imds::{ImdsState, SpotNotice};
use crate::store::ResourceId;

/// Sleeps until `after - notice`, posts an IMDS interruption notice, then
/// sleeps the remaining `notice` and terminates the instance with
/// `Server.SpotInstanceTermination`. Cancellable at either sleep.
pub async fn run(
    instance_id: String,
    after: Duration,
    notice: Duration,
    state: Arc<Mutex<DispatcherState>>,
    executor: Arc<dyn Executor>,
    imds: ImdsState,
    cancel: CancellationToken,
) {
    let notice = notice.min(after);
    let pre_notice = after.saturating_sub(notice);

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(pre_notice) => {}
    }

    let reclaim_at = chrono::Utc::now()
        + chrono::Duration::from_std(notice).unwrap_or_else(|_| chrono::Duration::zero());
    imds.set_spot_notice(
        &instance_id,
        Some(SpotNotice {
            action: "terminate",
            time: reclaim_at,
        }),
    );

    tokio::select! {
        _ = cancel.cancelled() => {
            imds.set_spot_notice(&instance_id, None);
            return;
        }
        _ = tokio::time::sleep(notice) => {}
    }

    let mut guard = state.lock().await;
    if let Err(err) = reclaim(&mut guard, &*executor, &imds, &instance_id).await {
        tracing::warn!(instance = %instance_id, error = %err, "spot reclaim termination failed");
    }
}

async fn reclaim(
    state: &mut DispatcherState,
    executor: &dyn Executor,
    imds: &ImdsState,
    instance_id: &str,
) -> crate::error::Result<()> {
    match executor.terminate_instances(&[instance_id.to_string()]).await {
        Ok(_) | Err(ExecutorError::InstanceNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    let rid = ResourceId::from(instance_id);
    if state.store.exists(&rid) {
        state.store.mark_terminated(&rid, "Server.SpotInstanceTermination")?;
    }
    imds.set_spot_notice(instance_id, None);
    imds.deregister_instance(instance_id);
    state.reclaim_tokens.remove(instance_id);
    Ok(())
}
