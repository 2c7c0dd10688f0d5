//! Link health supervision.
//!
//! While disconnected the supervisor attempts a reconnect every
//! `reconnect_interval`; while connected it pings every `ping_interval` and
//! treats a missing `PONG` as a disconnect. A run suspends it for its whole
//! duration: a suspended tick never touches the link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{DeviceManager, HealthRecord, LinkSlot, LinkState};
use crate::config::HealthSettings;

struct SupervisorTask {
    handle: JoinHandle<()>,
    stop_tx: mpsc::Sender<()>,
}

pub struct HealthSupervisor {
    manager: Arc<DeviceManager>,
    settings: HealthSettings,
    suspended: AtomicBool,
    record: StdMutex<HealthRecord>,
    task: Mutex<Option<SupervisorTask>>,
}

/// Keeps the supervisor suspended until dropped.
#[must_use = "the supervisor resumes as soon as the guard is dropped"]
pub struct SuspendGuard<'a> {
    supervisor: &'a HealthSupervisor,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.supervisor.resume();
    }
}

impl HealthSupervisor {
    pub fn new(manager: Arc<DeviceManager>, settings: HealthSettings) -> Arc<Self> {
        Arc::new(Self {
            manager,
            settings,
            suspended: AtomicBool::new(false),
            record: StdMutex::new(HealthRecord::default()),
            task: Mutex::new(None),
        })
    }

    pub fn manager(&self) -> &Arc<DeviceManager> {
        &self.manager
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Stop touching the link until the returned guard is dropped.
    ///
    /// Returns only after any tick already in progress has finished, so no
    /// ping can be issued once this resolves.
    pub async fn suspend(&self) -> SuspendGuard<'_> {
        self.suspended.store(true, Ordering::SeqCst);
        drop(self.manager.lock_link().await);
        log::debug!("Health supervisor suspended");
        SuspendGuard { supervisor: self }
    }

    pub fn resume(&self) {
        if self.suspended.swap(false, Ordering::SeqCst) {
            log::debug!("Health supervisor resumed");
        }
    }

    pub fn record(&self) -> HealthRecord {
        self.with_record(|r| r.clone())
    }

    fn with_record<R>(&self, f: impl FnOnce(&mut HealthRecord) -> R) -> R {
        let mut guard = match self.record.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// One scheduling step: reconnect when down, ping when up, nothing when suspended.
    pub async fn tick(&self) -> LinkState {
        let slot = self.manager.lock_link().await;
        self.tick_locked(slot).await
    }

    async fn tick_locked(&self, mut slot: LinkSlot<'_>) -> LinkState {
        // Checked under the link lock so a run that suspended us first always wins
        if self.is_suspended() {
            return self.manager.state();
        }

        let ping = match slot.as_mut() {
            Some(protocol) => Some(protocol.ping(self.settings.ping_timeout()).await),
            None => None,
        };

        match ping {
            Some(Ok(())) => {
                self.with_record(HealthRecord::record_success);
                self.manager.set_state(LinkState::Connected);
            }
            Some(Err(e)) => {
                self.with_record(HealthRecord::record_failure);
                self.manager.drop_link(&mut slot, &format!("ping failed: {}", e));
            }
            None => match self.manager.establish(&mut slot).await {
                Ok(()) => self.with_record(HealthRecord::record_success),
                Err(e) => {
                    let failures = self.with_record(|r| {
                        r.record_failure();
                        r.consecutive_failures
                    });
                    log::debug!("Reconnect attempt {} failed: {}", failures, e);
                }
            },
        }

        self.manager.state()
    }

    fn next_delay(&self) -> Duration {
        if self.manager.state().is_connected() {
            self.settings.ping_interval()
        } else {
            self.settings.reconnect_interval()
        }
    }

    /// Spawn the periodic scheduler. A second call while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            log::warn!("Health supervisor already running");
            return;
        }

        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            log::info!("Health supervisor started");
            supervisor.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(supervisor.next_delay()) => {}
                }
                // A run may hold the link for minutes; stay stoppable while queued on it
                let slot = tokio::select! {
                    _ = stop_rx.recv() => break,
                    slot = supervisor.manager.lock_link() => slot,
                };
                supervisor.tick_locked(slot).await;
            }
            log::info!("Health supervisor stopped");
        });

        *task = Some(SupervisorTask { handle, stop_tx });
    }

    /// Stop the scheduler and wait (bounded) for its current tick to finish.
    pub async fn shutdown(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.stop_tx.send(()).await;
            if timeout(Duration::from_secs(2), task.handle).await.is_err() {
                log::warn!("Health supervisor did not stop within 2s");
            }
        }
    }
}
