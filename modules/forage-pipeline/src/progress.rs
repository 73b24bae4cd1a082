//! Live run progress for SSE subscribers.
//!
//! Each run that has subscribers owns one `broadcast` channel of run snapshots.
//! A subscription is two tasks writing into one `mpsc` channel: a forwarder that
//! emits `init`, an `update` per snapshot and `done` on a terminal status, and a
//! heartbeat timer. The forwarder stops the heartbeat when it finishes, so the
//! stream closes after `done`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use forage_common::DiscoveryRun;

const SNAPSHOT_CAPACITY: usize = 64;
const STREAM_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Init(DiscoveryRun),
    Update(DiscoveryRun),
    Done(DiscoveryRun),
    Heartbeat,
}

impl ProgressEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Update(_) => "update",
            Self::Done(_) => "done",
            Self::Heartbeat => "heartbeat",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            Self::Init(run) | Self::Update(run) | Self::Done(run) => {
                serde_json::to_value(run).unwrap_or(Value::Null)
            }
            Self::Heartbeat => Value::Null,
        }
    }
}

#[derive(Clone)]
pub struct RunProgressHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<DiscoveryRun>>>>,
    heartbeat: Duration,
}

impl RunProgressHub {
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            heartbeat,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<DiscoveryRun>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to raw snapshots. Call before reading the run's current state so
    /// no update falls between the read and the subscription.
    pub fn receiver(&self, run_id: &str) -> broadcast::Receiver<DiscoveryRun> {
        self.lock()
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(SNAPSHOT_CAPACITY).0)
            .subscribe()
    }

    /// Fan a snapshot out to subscribers. Runs nobody watches cost nothing.
    pub fn publish(&self, run: &DiscoveryRun) {
        let mut channels = self.lock();
        let Some(tx) = channels.get(&run.id) else {
            return;
        };
        // Err only means nobody is listening.
        let _ = tx.send(run.clone());
        if run.status.is_terminal() || tx.receiver_count() == 0 {
            channels.remove(&run.id);
        }
    }

    /// Drop a run's channel if nobody is subscribed to it.
    pub fn prune(&self, run_id: &str) {
        let mut channels = self.lock();
        if channels.get(run_id).is_some_and(|tx| tx.receiver_count() == 0) {
            channels.remove(run_id);
        }
    }

    pub fn active_channels(&self) -> usize {
        self.lock().len()
    }

    /// Turn a snapshot receiver plus the run's current state into an event stream.
    pub fn stream(
        &self,
        initial: DiscoveryRun,
        mut snapshots: broadcast::Receiver<DiscoveryRun>,
    ) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let run_id = initial.id.clone();

        let events = tx.clone();
        tokio::spawn(async move {
            // Dropped on exit, which stops the heartbeat.
            let _stop = stop_tx;
            let terminal = initial.status.is_terminal();
            if events.send(ProgressEvent::Init(initial.clone())).await.is_err() {
                return;
            }
            if terminal {
                let _ = events.send(ProgressEvent::Done(initial)).await;
                return;
            }
            loop {
                let snapshot = tokio::select! {
                    _ = events.closed() => break,
                    received = snapshots.recv() => received,
                };
                match snapshot {
                    Ok(run) => {
                        let done = run.status.is_terminal();
                        let event = if done {
                            ProgressEvent::Done(run)
                        } else {
                            ProgressEvent::Update(run)
                        };
                        if events.send(event).await.is_err() || done {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(run_id = %run_id, skipped, "Progress subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let heartbeat = self.heartbeat;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if tx.send(ProgressEvent::Heartbeat).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        rx
    }
}
