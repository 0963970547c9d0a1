//! Coordinator: claims segments, drives the upstream stream, and serializes
//! segment-lifecycle control tasks against live dispatch.

mod command;
mod run;
mod state;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::ProcessorConfig;
use crate::status::ProcessingStatus;

pub(crate) use command::ControlTask;
pub(crate) use state::CoordinatorState;

/// Handle held by the façade to a running coordinator task.
pub(crate) struct CoordinatorHandle {
    tasks_tx: mpsc::UnboundedSender<ControlTask>,
    status: Arc<RwLock<HashMap<u64, ProcessingStatus>>>,
    state: Arc<RwLock<CoordinatorState>>,
    join: JoinHandle<()>,
}

/// Spawn the coordinator's main-loop task for `config`.
pub(crate) fn spawn(config: ProcessorConfig) -> CoordinatorHandle {
    let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
    let status = Arc::new(RwLock::new(HashMap::new()));
    let state = Arc::new(RwLock::new(CoordinatorState::Starting));
    let notify = Arc::new(Notify::new());

    let coordinator = run::Coordinator::new(config, tasks_rx, status.clone(), state.clone(), notify);
    let join = tokio::spawn(coordinator.run());

    CoordinatorHandle {
        tasks_tx,
        status,
        state,
        join,
    }
}

impl CoordinatorHandle {
    pub(crate) async fn processing_status(&self) -> HashMap<u64, ProcessingStatus> {
        self.status.read().await.clone()
    }

    pub(crate) async fn is_error(&self) -> bool {
        matches!(*self.state.read().await, CoordinatorState::PausedError)
    }

    pub(crate) fn release_segment(&self, segment_id: u64) {
        let _ = self.tasks_tx.send(ControlTask::ReleaseSegment { segment_id });
    }

    pub(crate) async fn split_segment(&self, segment_id: u64) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tasks_tx
            .send(ControlTask::SplitSegment {
                segment_id,
                reply: reply_tx,
            })
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    pub(crate) async fn merge_segment(&self, segment_id: u64) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tasks_tx
            .send(ControlTask::MergeSegment {
                segment_id,
                reply: reply_tx,
            })
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Signal shutdown and wait for the main loop to exit, having released
    /// every claim it held.
    pub(crate) async fn shutdown(self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tasks_tx.send(ControlTask::Shutdown { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
        let _ = self.join.await;
    }
}
