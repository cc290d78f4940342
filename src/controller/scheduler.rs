//! # Scheduler
//!
//! Drives reconciliation passes:
//!
//! - One timer per descriptor, re-armed after every pass with the delay the
//!   pass reported (refresh interval or backoff)
//! - An explicit work queue consumed by a fixed pool of workers
//! - A descriptor is queued at most once and never runs two passes at the
//!   same time; triggers arriving while it is queued or in flight are
//!   coalesced
//! - Configuration changes force an immediate pass; a change arriving during
//!   a pass schedules one more pass right after it
//! - Removal cancels the timer and the in-flight pass, then cleans up the
//!   destination object according to the creation policy
//!
//! A poisoned registry stops every worker; [`Scheduler::stopped`] resolves
//! when that happens so the process can exit.

use crate::controller::descriptor::{ObjectIdentity, SecretDescriptor, SyncPhase};
use crate::controller::reconciler::{cleanup_target, Reconciler};
use crate::controller::registry::{Change, RegistryError};
use crate::observability::metrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of asking for a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerResult {
    Enqueued,
    /// Already queued or running; no extra pass was added
    Coalesced,
    /// No such descriptor
    Unknown,
}

#[derive(Debug)]
struct Entry {
    queued: bool,
    in_flight: bool,
    /// Spec changed while a pass was running
    rerun: bool,
    timer: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    /// Held for the duration of a pass
    pass_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Entry {
    fn new() -> Self {
        Self {
            queued: false,
            in_flight: false,
            rerun: false,
            timer: None,
            cancel: CancellationToken::new(),
            pass_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug)]
struct Inner {
    reconciler: Arc<Reconciler>,
    entries: Mutex<HashMap<ObjectIdentity, Entry>>,
    queue_tx: mpsc::UnboundedSender<ObjectIdentity>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ObjectIdentity>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<ObjectIdentity, Entry>> {
        // A panic while holding this lock leaves only scheduling flags behind
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn enqueue(&self, id: &ObjectIdentity, entry: &mut Entry) {
        entry.stop_timer();
        entry.queued = true;
        if self.queue_tx.send(id.clone()).is_err() {
            entry.queued = false;
            debug!(descriptor = %id, "Work queue closed, pass not enqueued");
            return;
        }
        // Synced or Error descriptors wait in Pending until a worker picks them up
        if let Err(e) = self.reconciler.registry().set_phase(id, SyncPhase::Pending) {
            error!(descriptor = %id, error = %e, "Fatal registry error, stopping scheduler");
            self.shutdown.cancel();
        }
    }

    fn trigger(&self, id: &ObjectIdentity) -> TriggerResult {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(id) else {
            return TriggerResult::Unknown;
        };
        if entry.queued || entry.in_flight {
            metrics::increment_coalesced_triggers();
            debug!(
                descriptor = %id,
                queued = entry.queued,
                in_flight = entry.in_flight,
                "Trigger coalesced"
            );
            return TriggerResult::Coalesced;
        }
        self.enqueue(id, entry);
        TriggerResult::Enqueued
    }

    fn arm_timer(self: &Arc<Self>, id: ObjectIdentity, delay: Duration) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.trigger(&id);
            }
        })
    }

    async fn run(self: &Arc<Self>, id: ObjectIdentity) {
        let (cancel, pass_lock) = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            entry.queued = false;
            entry.in_flight = true;
            entry.stop_timer();
            (entry.cancel.clone(), Arc::clone(&entry.pass_lock))
        };

        let result = {
            let _pass = pass_lock.lock().await;
            self.reconciler.reconcile(&id, &cancel).await
        };

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                error!(descriptor = %id, error = %e, "Fatal registry error, stopping scheduler");
                self.shutdown.cancel();
                return;
            }
        };

        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };
        entry.in_flight = false;
        if entry.rerun {
            entry.rerun = false;
            self.enqueue(&id, entry);
        } else if let Some(delay) = report.next_delay {
            debug!(descriptor = %id, next_in_secs = delay.as_secs(), "Next pass scheduled");
            entry.timer = Some(self.arm_timer(id.clone(), delay));
        }
    }

    async fn work(self: Arc<Self>, worker: usize) {
        debug!(worker, "Reconciliation worker started");
        loop {
            let next = {
                let mut queue = self.queue_rx.lock().await;
                tokio::select! {
                    id = queue.recv() => id,
                    () = self.shutdown.cancelled() => None,
                }
            };
            let Some(id) = next else {
                break;
            };
            self.run(id).await;
        }
        debug!(worker, "Reconciliation worker stopped");
    }
}

/// Destination cleanup left over after [`Scheduler::detach`]
#[derive(Debug)]
pub struct Removal {
    descriptor: SecretDescriptor,
    pass_lock: Option<Arc<tokio::sync::Mutex<()>>>,
    reconciler: Arc<Reconciler>,
}

impl Removal {
    #[must_use]
    pub fn id(&self) -> &ObjectIdentity {
        &self.descriptor.id
    }

    /// Wait for the cancelled pass, then clean up the destination object
    ///
    /// Skipped when a descriptor with the same identity was registered again
    /// in the meantime; the destination now belongs to it.
    pub async fn finish(self) {
        let id = &self.descriptor.id;
        let settings = self.reconciler.settings();
        if let Some(pass_lock) = &self.pass_lock {
            if tokio::time::timeout(settings.pass_timeout, pass_lock.lock())
                .await
                .is_err()
            {
                warn!(descriptor = %id, "In-flight pass did not stop in time, cleaning up anyway");
            }
        }

        match self.reconciler.registry().contains(id) {
            Ok(false) => {}
            Ok(true) => {
                debug!(descriptor = %id, "Descriptor registered again, skipping cleanup");
                return;
            }
            Err(e) => {
                error!(descriptor = %id, error = %e, "Registry unavailable, skipping cleanup");
                return;
            }
        }

        let store = self.reconciler.store();
        if let Err(e) = cleanup_target(store.as_ref(), &self.descriptor, settings.store_timeout).await {
            warn!(descriptor = %id, target = %self.descriptor.target, error = %e, "Cleanup of destination object failed");
        }
    }
}

/// Timer and worker-pool front end of the reconciler
#[derive(Debug, Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                reconciler,
                entries: Mutex::new(HashMap::new()),
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn `workers` reconciliation workers
    pub fn start(&self, workers: usize) {
        let mut handles = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for worker in 0..workers.max(1) {
            handles.push(tokio::spawn(Arc::clone(&self.inner).work(worker)));
        }
        info!(workers = workers.max(1), "Scheduler started");
    }

    #[must_use]
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.inner.reconciler
    }

    /// Register or update a descriptor
    ///
    /// A new descriptor, or one whose spec or interval changed, gets an
    /// immediate pass.
    ///
    /// # Errors
    /// `RegistryError::Invalid` if the descriptor is rejected (any previous
    /// version stays registered), `RegistryError::Poisoned` if the registry is
    /// corrupted.
    pub fn apply_descriptor(&self, descriptor: SecretDescriptor) -> Result<Change, RegistryError> {
        let id = descriptor.id.clone();
        let registry = self.inner.reconciler.registry();
        let change = registry.upsert(descriptor)?;
        metrics::set_descriptors_managed(registry.len()?);

        let mut entries = self.inner.entries();
        let entry = entries.entry(id.clone()).or_insert_with(Entry::new);
        if change.requires_resync() {
            if entry.in_flight {
                entry.rerun = true;
            } else if !entry.queued {
                self.inner.enqueue(&id, entry);
            }
        }
        Ok(change)
    }

    /// Ask for an out-of-cycle pass
    pub fn trigger(&self, id: &ObjectIdentity) -> TriggerResult {
        self.inner.trigger(id)
    }

    /// Forget a descriptor
    ///
    /// Cancels its timer and any in-flight pass, waits for that pass to reach
    /// a checkpoint, then applies the creation policy's cleanup. Returns
    /// whether the descriptor was registered.
    ///
    /// # Errors
    /// `RegistryError::Poisoned` if the registry is corrupted.
    pub async fn remove(&self, id: &ObjectIdentity) -> Result<bool, RegistryError> {
        match self.detach(id)? {
            Some(removal) => {
                removal.finish().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Unregister a descriptor without waiting for its in-flight pass
    ///
    /// The registry, timer and metrics are updated before this returns; the
    /// returned [`Removal`] finishes the cleanup of the destination object.
    ///
    /// # Errors
    /// `RegistryError::Poisoned` if the registry is corrupted.
    pub fn detach(&self, id: &ObjectIdentity) -> Result<Option<Removal>, RegistryError> {
        let pass_lock = self.inner.entries().remove(id).map(|mut entry| {
            entry.cancel.cancel();
            entry.stop_timer();
            entry.pass_lock
        });

        let reconciler = &self.inner.reconciler;
        let removed = reconciler.registry().remove(id)?;
        reconciler.forget(id);
        metrics::remove_descriptor_metrics(id);
        metrics::set_descriptors_managed(reconciler.registry().len()?);

        let Some(descriptor) = removed else {
            return Ok(None);
        };
        info!(descriptor = %id, "Descriptor removed");

        Ok(Some(Removal {
            descriptor,
            pass_lock,
            reconciler: Arc::clone(reconciler),
        }))
    }

    /// Whether a pass for `id` is currently running
    #[must_use]
    pub fn is_in_flight(&self, id: &ObjectIdentity) -> bool {
        self.inner.entries().get(id).is_some_and(|e| e.in_flight)
    }

    /// Whether a timer is armed for `id`
    #[must_use]
    pub fn has_timer(&self, id: &ObjectIdentity) -> bool {
        self.inner
            .entries()
            .get(id)
            .is_some_and(|e| e.timer.as_ref().is_some_and(|t| !t.is_finished()))
    }

    /// Token cancelled on shutdown or after a fatal registry error
    #[must_use]
    pub fn stopped(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Cancel every pass and timer and stop the workers
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for entry in self.inner.entries().values_mut() {
            entry.cancel.cancel();
            entry.stop_timer();
        }

        let workers: Vec<_> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Reconciliation worker ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }
}
