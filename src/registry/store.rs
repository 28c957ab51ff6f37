//! Session registry implementation
//!
//! The central registry that maps cameras to their live sessions, starts a
//! transcoder for the first subscriber and tears it down after the last one
//! leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::config::RegistryConfig;
use super::entry::{epoch_millis, SessionEntry, SessionSnapshot};
use super::error::RegistryError;
use super::key::{CameraId, SessionKey, Variant};
use crate::directory::CameraDirectory;
use crate::error::Result;
use crate::notify::{ControlEvent, ControlNotifier};
use crate::session::{SessionEvent, SessionState};
use crate::sink::{FanoutSink, Subscriber, SubscriberId};
use crate::transcode::{ExitReport, ProcessHandle, ProcessStatus, Supervisor};

/// Sessions of one camera, one per variant
#[derive(Default)]
struct CameraSlot {
    sessions: HashMap<Variant, SessionEntry>,
}

struct RegistryInner {
    /// Per-camera slots; the slot mutex serializes session decisions
    cameras: DashMap<CameraId, Arc<Mutex<CameraSlot>>>,
    supervisor: Supervisor,
    directory: Arc<dyn CameraDirectory>,
    notifier: ControlNotifier,
    config: RegistryConfig,
    next_session_id: AtomicU64,
    /// Administrative lease subscribers per session
    leases: DashMap<SessionKey, Vec<SubscriberId>>,
}

/// Registry of live stream sessions
///
/// Cheap to clone. Subscribe and unsubscribe calls for the same camera are
/// serialized by a per-camera lock; different cameras never contend.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        config: RegistryConfig,
        supervisor: Supervisor,
        directory: Arc<dyn CameraDirectory>,
        notifier: ControlNotifier,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                cameras: DashMap::new(),
                supervisor,
                directory,
                notifier,
                config,
                next_session_id: AtomicU64::new(1),
                leases: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn notifier(&self) -> &ControlNotifier {
        &self.inner.notifier
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    fn sink(&self) -> &FanoutSink {
        self.inner.supervisor.sink()
    }

    fn slot(&self, camera: CameraId) -> Arc<Mutex<CameraSlot>> {
        self.inner.cameras.entry(camera).or_default().value().clone()
    }

    fn existing_slot(&self, camera: CameraId) -> Option<Arc<Mutex<CameraSlot>>> {
        self.inner.cameras.get(&camera).map(|slot| slot.value().clone())
    }

    /// Attach a subscriber to a session, starting the session if needed
    ///
    /// With no live session for the key this looks up the camera's source,
    /// starts the transcoder and attaches the subscriber; the session turns
    /// active once output is observed. A start failure leaves no session
    /// behind and is reported as [`Error::SourceUnavailable`](crate::Error).
    pub async fn subscribe(&self, key: SessionKey, subscriber: Subscriber) -> Result<SessionSnapshot> {
        let slot = self.slot(key.camera);
        let mut slot = slot.lock().await;
        let subscriber_id = subscriber.id();

        if let Some(entry) = slot.sessions.get_mut(&key.variant) {
            if !entry.state.accepts_subscribers() {
                return Err(RegistryError::SessionStopping(key).into());
            }
            entry.idle_since = None;
            self.sink().attach(&key, subscriber);

            tracing::info!(
                session = %key,
                subscriber = %subscriber_id,
                subscribers = self.sink().subscriber_count(&key),
                "Subscriber added"
            );
            return Ok(self.describe(entry));
        }

        let source_url = self.inner.directory.source_url(key.camera).await?;

        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let mut entry = SessionEntry::new(session_id, key);
        entry.apply(SessionEvent::StartRequested);
        self.sink().attach(&key, subscriber);

        match self.inner.supervisor.start(key, &source_url).await {
            Ok(handle) => {
                entry.apply(SessionEvent::Spawned);
                entry.started_at = Some(handle.started_wall());
                entry.driver = Some(self.spawn_driver(session_id, key, handle.watch()));
                entry.process = Some(handle);

                let snapshot = self.describe(&entry);
                slot.sessions.insert(key.variant, entry);

                tracing::info!(
                    session = %key,
                    subscriber = %subscriber_id,
                    pid = ?snapshot.pid,
                    "Session starting"
                );
                Ok(snapshot)
            }
            Err(err) => {
                entry.apply(SessionEvent::Exited);
                let message = err.to_string();
                entry.last_error = Some(message.clone());
                self.sink().close(&key);

                tracing::warn!(session = %key, error = %message, "Session failed to start");
                self.inner.notifier.broadcast(&ControlEvent::SessionError {
                    camera_id: key.camera,
                    variant: key.variant,
                    message,
                });
                Err(err)
            }
        }
    }

    /// Detach a subscriber from a session
    ///
    /// When the subscriber set empties the session is torn down, either at
    /// once or after the configured idle grace interval.
    pub async fn unsubscribe(&self, key: SessionKey, subscriber: SubscriberId) -> Result<()> {
        let Some(slot) = self.existing_slot(key.camera) else {
            return Err(RegistryError::NotSubscribed {
                camera: key.camera,
                subscriber,
            }
            .into());
        };
        let mut slot = slot.lock().await;

        let detached = self.sink().detach(&key, subscriber);
        let remaining = self.sink().subscriber_count(&key);

        let Some(entry) = slot.sessions.get_mut(&key.variant) else {
            if detached {
                return Ok(());
            }
            return Err(RegistryError::NotSubscribed {
                camera: key.camera,
                subscriber,
            }
            .into());
        };

        if detached {
            tracing::info!(
                session = %key,
                subscriber = %subscriber,
                subscribers = remaining,
                "Subscriber removed"
            );
        } else {
            tracing::debug!(session = %key, subscriber = %subscriber, "Subscriber not attached");
        }

        // The sink may already have dropped the last subscriber on its own
        if remaining == 0 && entry.idle_since.is_none() {
            let grace = self.inner.config.idle_grace;
            if grace.is_zero() {
                self.teardown(&mut slot, key, "last subscriber left").await;
            } else {
                entry.idle_since = Some(Instant::now());
                self.spawn_grace_timer(key, entry.id);
                tracing::debug!(session = %key, grace = ?grace, "Session idle");
            }
        }

        if detached {
            Ok(())
        } else {
            Err(RegistryError::NotSubscribed {
                camera: key.camera,
                subscriber,
            }
            .into())
        }
    }

    /// Start a session on behalf of an administrative client
    ///
    /// The session is held open by a lease subscriber until [`stop`](Self::stop).
    pub async fn start(&self, key: SessionKey) -> Result<SessionSnapshot> {
        let lease = Subscriber::lease();
        let lease_id = lease.id();
        let snapshot = self.subscribe(key, lease).await?;
        self.inner.leases.entry(key).or_default().push(lease_id);
        Ok(snapshot)
    }

    /// Release one administrative lease
    ///
    /// The session stops like any other once its last subscriber is gone.
    pub async fn stop(&self, key: SessionKey) -> Result<()> {
        let lease = self
            .inner
            .leases
            .get_mut(&key)
            .and_then(|mut leases| leases.pop());
        self.inner.leases.remove_if(&key, |_, leases| leases.is_empty());

        if let Some(id) = lease {
            return self.unsubscribe(key, id).await;
        }
        if self.state(key).await.is_none() {
            return Err(RegistryError::SessionNotFound(key).into());
        }
        tracing::debug!(session = %key, "Stop without an administrative lease");
        Ok(())
    }

    /// Current state of a session
    pub async fn state(&self, key: SessionKey) -> Option<SessionState> {
        let slot = self.existing_slot(key.camera)?;
        let slot = slot.lock().await;
        slot.sessions.get(&key.variant).map(|entry| entry.state)
    }

    /// Snapshot of a single session
    pub async fn session(&self, key: SessionKey) -> Option<SessionSnapshot> {
        let slot = self.existing_slot(key.camera)?;
        let slot = slot.lock().await;
        slot.sessions.get(&key.variant).map(|entry| self.describe(entry))
    }

    /// Snapshot of every live session, ordered by camera
    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut slots: Vec<(CameraId, Arc<Mutex<CameraSlot>>)> = self
            .inner
            .cameras
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        slots.sort_by_key(|(camera, _)| *camera);

        let mut sessions = Vec::new();
        for (_, slot) in slots {
            let slot = slot.lock().await;
            let mut entries: Vec<&SessionEntry> = slot.sessions.values().collect();
            entries.sort_by_key(|entry| entry.key.variant.as_str());
            sessions.extend(entries.into_iter().map(|entry| self.describe(entry)));
        }
        sessions
    }

    /// Status event sent to newly connected control clients
    pub async fn status_event(&self) -> ControlEvent {
        ControlEvent::StatusSnapshot {
            sessions: self.snapshot().await,
        }
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.inner.supervisor.running_count()
    }

    /// Run the idle sweep once
    ///
    /// Tears down sessions whose subscriber set has been empty for longer
    /// than the grace interval, and starts the clock for empty sessions
    /// that have not been marked idle yet (subscribers dropped by the sink).
    pub async fn cleanup(&self) {
        let grace = self.inner.config.idle_grace;
        let slots: Vec<Arc<Mutex<CameraSlot>>> = self
            .inner
            .cameras
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for slot in slots {
            let mut slot = slot.lock().await;
            let now = Instant::now();

            let mut expired = Vec::new();
            for entry in slot.sessions.values_mut() {
                if self.sink().subscriber_count(&entry.key) > 0 {
                    continue;
                }
                match entry.idle_since {
                    Some(since) if now.duration_since(since) >= grace => expired.push(entry.key),
                    Some(_) => {}
                    None => entry.idle_since = Some(now),
                }
            }

            for key in expired {
                self.teardown(&mut slot, key, "idle sweep").await;
            }
        }

        self.inner.cameras.retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot
                    .try_lock()
                    .map(|slot| !slot.sessions.is_empty())
                    .unwrap_or(true)
        });
    }

    /// Spawn background cleanup task
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn_cleanup_task(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let interval = registry.inner.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.cleanup().await;
            }
        })
    }

    /// Tear down every session
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<Mutex<CameraSlot>>> = self
            .inner
            .cameras
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for slot in slots {
            let mut slot = slot.lock().await;
            let keys: Vec<SessionKey> = slot.sessions.values().map(|entry| entry.key).collect();
            for key in keys {
                self.teardown(&mut slot, key, "shutdown").await;
            }
        }
        self.inner.supervisor.stop_all().await;
    }

    /// Stop a session while holding its camera lock
    async fn teardown(&self, slot: &mut CameraSlot, key: SessionKey, reason: &'static str) {
        let Some(mut entry) = slot.sessions.remove(&key.variant) else {
            return;
        };

        entry.apply(SessionEvent::KillRequested);
        if let Some(driver) = entry.driver.take() {
            driver.abort();
        }
        let closed = self.sink().close(&key);
        self.inner.leases.remove(&key);

        let report = match entry.process.take() {
            Some(handle) => Some(self.inner.supervisor.stop(&handle).await),
            None => None,
        };
        entry.apply(SessionEvent::Exited);

        tracing::info!(
            session = %key,
            reason = reason,
            closed_subscribers = closed,
            code = ?report.as_ref().and_then(|r| r.code),
            "Session stopped"
        );
        self.inner.notifier.broadcast(&ControlEvent::SessionStopped {
            camera_id: key.camera,
            variant: key.variant,
        });
    }

    fn describe(&self, entry: &SessionEntry) -> SessionSnapshot {
        let key = entry.key;
        SessionSnapshot {
            camera_id: key.camera,
            variant: key.variant,
            state: entry.state,
            subscribers: self.sink().subscriber_count(&key),
            started_at_ms: entry.started_at.and_then(epoch_millis),
            pid: entry.process.as_ref().and_then(ProcessHandle::pid),
            last_error: entry.last_error.clone(),
            stats: self.sink().stats(&key).unwrap_or_default(),
        }
    }

    fn spawn_driver(
        &self,
        session_id: u64,
        key: SessionKey,
        mut status: watch::Receiver<ProcessStatus>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                let current = status.borrow_and_update().clone();
                match current {
                    ProcessStatus::Running => {}
                    ProcessStatus::Producing => {
                        let Some(registry) = upgrade(&weak) else { return };
                        registry.on_first_output(session_id, key).await;
                    }
                    ProcessStatus::Exited(report) => {
                        if let Some(registry) = upgrade(&weak) {
                            registry.on_exit(session_id, key, report).await;
                        }
                        return;
                    }
                }
                if status.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    fn spawn_grace_timer(&self, key: SessionKey, session_id: u64) {
        let weak = Arc::downgrade(&self.inner);
        let grace = self.inner.config.idle_grace;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = upgrade(&weak) {
                registry.reap_if_idle(key, session_id).await;
            }
        });
    }

    async fn on_first_output(&self, session_id: u64, key: SessionKey) {
        let Some(slot) = self.existing_slot(key.camera) else {
            return;
        };
        let mut slot = slot.lock().await;
        let Some(entry) = slot.sessions.get_mut(&key.variant) else {
            return;
        };
        if entry.id != session_id || entry.state != SessionState::Starting {
            return;
        }

        entry.apply(SessionEvent::FirstOutput);
        tracing::info!(session = %key, "Session active");
        self.inner.notifier.broadcast(&ControlEvent::SessionStarted {
            camera_id: key.camera,
            variant: key.variant,
        });
    }

    /// Transcoder exited without a teardown request
    async fn on_exit(&self, session_id: u64, key: SessionKey, report: ExitReport) {
        let Some(slot) = self.existing_slot(key.camera) else {
            return;
        };
        let mut slot = slot.lock().await;
        match slot.sessions.get(&key.variant) {
            Some(entry) if entry.id == session_id => {}
            _ => return,
        }
        let Some(mut entry) = slot.sessions.remove(&key.variant) else {
            return;
        };

        // Dropping our own handle detaches this task instead of aborting it
        entry.driver.take();
        entry.apply(SessionEvent::Exited);
        let message = report.describe();
        entry.last_error = Some(message.clone());

        let closed = self.sink().close(&key);
        self.inner.leases.remove(&key);

        tracing::warn!(
            session = %key,
            code = ?report.code,
            closed_subscribers = closed,
            error = %message,
            "Session errored"
        );
        self.inner.notifier.broadcast(&ControlEvent::SessionError {
            camera_id: key.camera,
            variant: key.variant,
            message,
        });
    }

    async fn reap_if_idle(&self, key: SessionKey, session_id: u64) {
        let Some(slot) = self.existing_slot(key.camera) else {
            return;
        };
        let mut slot = slot.lock().await;
        let grace = self.inner.config.idle_grace;

        let expired = match slot.sessions.get(&key.variant) {
            Some(entry) if entry.id == session_id => entry
                .idle_since
                .map(|since| since.elapsed() >= grace)
                .unwrap_or(false),
            _ => false,
        };

        if expired && self.sink().subscriber_count(&key) == 0 {
            self.teardown(&mut slot, key, "idle grace elapsed").await;
        }
    }
}

fn upgrade(weak: &Weak<RegistryInner>) -> Option<SessionRegistry> {
    weak.upgrade().map(|inner| SessionRegistry { inner })
}
