//! ResourceManager: the single resource slot and its state transitions.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::lease::Lease;
use super::watchdog;
use super::{LoadError, Loader, ResidentResource};
use crate::device::{Device, DeviceProbe, SystemProbe, select_device};
use crate::status::{ResidencyState, StatusSnapshot};

/// Outcome of a load episode, broadcast to everyone waiting on it.
type LoadOutcome = Option<Result<(), LoadError>>;

#[derive(Clone)]
pub struct ManagerConfig {
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub probe: Arc<dyn DeviceProbe>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(30),
            probe: Arc::new(SystemProbe),
        }
    }
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("idle_timeout", &self.idle_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl ManagerConfig {
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
        self.probe = probe;
        self
    }
}

/// A loaded model plus the device binding it was loaded for.
///
/// Field order matters: the resource drops before the residency permit is
/// returned, so the next load cannot overlap with this instance.
pub(crate) struct Resident<R> {
    pub(crate) resource: R,
    pub(crate) device: Device,
    pub(crate) episode: u64,
    _permit: OwnedSemaphorePermit,
}

pub(crate) struct Loaded<R> {
    resident: Arc<Resident<R>>,
    last_used: Instant,
    loaded_at: DateTime<Utc>,
}

impl<R> Loaded<R> {
    fn touch(&mut self) {
        self.last_used = self.last_used.max(Instant::now());
    }

    /// Leases currently handed out on this instance.
    ///
    /// New leases are only created under the slot lock, so a zero read under
    /// the lock cannot race with a caller about to start using the instance.
    fn leases(&self) -> usize {
        Arc::strong_count(&self.resident) - 1
    }

    fn device(&self) -> Device {
        self.resident.device
    }
}

enum SlotState<R> {
    Empty,
    Loading {
        outcome: watch::Receiver<LoadOutcome>,
    },
    Loaded(Loaded<R>),
}

pub(crate) struct Slot<R> {
    state: SlotState<R>,
    watchdog: Option<JoinHandle<()>>,
    load_episodes: u64,
    closed: bool,
}

impl<R> Slot<R> {
    fn take_loaded(&mut self) -> Option<Loaded<R>> {
        match std::mem::replace(&mut self.state, SlotState::Empty) {
            SlotState::Loaded(loaded) => Some(loaded),
            other => {
                self.state = other;
                None
            }
        }
    }

    fn watchdog_running(&self) -> bool {
        self.watchdog.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// What the watchdog found on one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleCheck {
    Empty,
    Active,
    Leased,
    Evicted,
}

pub(crate) struct Inner<R> {
    slot: StdMutex<Slot<R>>,
    config: ManagerConfig,
    /// One permit: held by the live instance until it is dropped.
    residency: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl<R> Drop for Inner<R> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<R: ResidentResource> Inner<R> {
    /// Lock the slot. On poison, recover: every transition leaves the slot consistent.
    fn lock_slot(&self) -> MutexGuard<'_, Slot<R>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Resource slot mutex poisoned - recovering");
                self.slot.clear_poison();
                poisoned.into_inner()
            }
        }
    }

    fn begin_load<L>(self: &Arc<Self>, slot: &mut Slot<R>, loader: Arc<L>) -> watch::Receiver<LoadOutcome>
    where
        L: Loader<R> + ?Sized + 'static,
    {
        let (tx, rx) = watch::channel(None);
        slot.load_episodes += 1;
        let episode = slot.load_episodes;
        slot.state = SlotState::Loading {
            outcome: rx.clone(),
        };

        // The load runs in its own task so a caller that goes away (client
        // disconnect, timeout) cannot leave the slot stuck in Loading.
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.run_load(episode, loader, tx).await;
        });
        rx
    }

    async fn run_load<L>(self: Arc<Self>, episode: u64, loader: Arc<L>, tx: watch::Sender<LoadOutcome>)
    where
        L: Loader<R> + ?Sized + 'static,
    {
        let mut guard = LoadGuard {
            inner: Arc::clone(&self),
            armed: true,
        };

        let permit = match Arc::clone(&self.residency).try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => {
                tracing::info!(
                    episode,
                    "Waiting for the previous model instance to be returned by its last lease"
                );
                Arc::clone(&self.residency).acquire_owned().await
            }
            Err(TryAcquireError::Closed) => Arc::clone(&self.residency).acquire_owned().await,
        };
        let Ok(permit) = permit else {
            guard.disarm();
            let outcome = self.abandon_load(LoadError::ShutDown);
            let _ = tx.send(Some(outcome));
            return;
        };

        let device = select_device(self.config.probe.as_ref());
        tracing::info!(%device, episode, "Loading model");
        let started = Instant::now();
        let result = loader.load(device).await;
        let outcome = self.finish_load(episode, device, permit, result, started.elapsed());

        guard.disarm();
        let _ = tx.send(Some(outcome));
    }

    fn finish_load(
        self: &Arc<Self>,
        episode: u64,
        device: Device,
        permit: OwnedSemaphorePermit,
        result: Result<R, LoadError>,
        elapsed: Duration,
    ) -> Result<(), LoadError> {
        let mut slot = self.lock_slot();
        match result {
            Ok(resource) if slot.closed => {
                slot.state = SlotState::Empty;
                drop(slot);
                tracing::info!(%device, episode, "Discarding model loaded during shutdown");
                drop(resource);
                Err(LoadError::ShutDown)
            }
            Ok(resource) => {
                slot.state = SlotState::Loaded(Loaded {
                    resident: Arc::new(Resident {
                        resource,
                        device,
                        episode,
                        _permit: permit,
                    }),
                    last_used: Instant::now(),
                    loaded_at: Utc::now(),
                });
                self.ensure_watchdog(&mut slot);
                tracing::info!(
                    %device,
                    episode,
                    load_secs = elapsed.as_secs_f64(),
                    "Model loaded"
                );
                Ok(())
            }
            Err(e) => {
                slot.state = SlotState::Empty;
                tracing::warn!(%device, episode, error = %e, "Model load failed");
                Err(e)
            }
        }
    }

    fn abandon_load(&self, error: LoadError) -> Result<(), LoadError> {
        let mut slot = self.lock_slot();
        if matches!(slot.state, SlotState::Loading { .. }) {
            slot.state = SlotState::Empty;
        }
        Err(error)
    }

    /// Start the idle watchdog unless one is already running.
    fn ensure_watchdog(self: &Arc<Self>, slot: &mut Slot<R>) {
        if slot.watchdog_running() {
            return;
        }
        let handle = tokio::spawn(watchdog::watch_idle(
            Arc::downgrade(self),
            self.config.poll_interval,
            self.shutdown.child_token(),
        ));
        slot.watchdog = Some(handle);
        tracing::debug!(
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            "Idle watchdog started"
        );
    }

    /// One watchdog poll: evict if loaded, unleased and idle past the timeout.
    pub(crate) fn check_idle(&self) -> IdleCheck {
        let evicted = {
            let mut slot = self.lock_slot();
            let SlotState::Loaded(loaded) = &slot.state else {
                return IdleCheck::Empty;
            };

            let idle = loaded.last_used.elapsed();
            if idle <= self.config.idle_timeout {
                return IdleCheck::Active;
            }

            let leases = loaded.leases();
            let device = loaded.device();
            if leases > 0 {
                tracing::debug!(%device, leases, idle_secs = idle.as_secs(), "Idle timeout reached but model is leased, deferring");
                return IdleCheck::Leased;
            }

            tracing::info!(%device, idle_secs = idle.as_secs(), "Model idle timeout, offloading");
            // Terminating: the next load starts a fresh watchdog.
            slot.watchdog = None;
            slot.take_loaded()
        };

        // Tear down outside the lock; dropping a model can take a while.
        drop(evicted);
        IdleCheck::Evicted
    }

    pub(crate) fn lease_returned(&self, resident: &Arc<Resident<R>>) {
        let mut slot = self.lock_slot();
        if let SlotState::Loaded(loaded) = &mut slot.state
            && Arc::ptr_eq(&loaded.resident, resident)
        {
            loaded.touch();
        }
    }
}

/// Resets the slot to Empty if the load task unwinds before reporting.
struct LoadGuard<R: ResidentResource> {
    inner: Arc<Inner<R>>,
    armed: bool,
}

impl<R: ResidentResource> LoadGuard<R> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<R: ResidentResource> Drop for LoadGuard<R> {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!("Model load task aborted - resetting resource slot");
            let _ = self.inner.abandon_load(LoadError::Lost);
        }
    }
}

/// Handle to the process's resource slot. Cheap to clone.
///
/// Constructed once by the composition root and shared with every front-end.
pub struct ResourceManager<R: ResidentResource> {
    inner: Arc<Inner<R>>,
}

impl<R: ResidentResource> Clone for ResourceManager<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: ResidentResource> ResourceManager<R> {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: StdMutex::new(Slot {
                    state: SlotState::Empty,
                    watchdog: None,
                    load_episodes: 0,
                    closed: false,
                }),
                config,
                residency: Arc::new(Semaphore::new(1)),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.config.idle_timeout
    }

    /// Get a lease on the model, loading it first if the slot is empty.
    ///
    /// Concurrent callers share a single load episode: `loader` runs once and
    /// every caller receives either a lease on the same instance or the same error.
    pub async fn acquire<L>(&self, loader: &Arc<L>) -> Result<Lease<R>, LoadError>
    where
        L: Loader<R> + ?Sized + 'static,
    {
        loop {
            let mut outcome = {
                let mut slot = self.inner.lock_slot();
                if slot.closed {
                    return Err(LoadError::ShutDown);
                }

                if let SlotState::Loaded(loaded) = &mut slot.state {
                    loaded.touch();
                    return Ok(Lease::new(
                        Arc::clone(&loaded.resident),
                        Arc::downgrade(&self.inner),
                    ));
                }

                let in_flight = match &slot.state {
                    SlotState::Loading { outcome } => Some(outcome.clone()),
                    _ => None,
                };
                match in_flight {
                    Some(outcome) => outcome,
                    None => self.inner.begin_load(&mut slot, Arc::clone(loader)),
                }
            };

            let result = match outcome.wait_for(Option::is_some).await {
                Ok(done) => done.clone().unwrap_or(Err(LoadError::Lost)),
                Err(_) => Err(LoadError::Lost),
            };
            // Loaded: take the lease under the lock on the next pass.
            result?;
        }
    }

    /// Evict the model now. No-op when nothing is loaded.
    ///
    /// A leased instance is detached immediately and dropped when its last
    /// lease is returned. The watchdog keeps running. Returns whether an
    /// instance was detached.
    pub fn force_release(&self) -> bool {
        let released = self.inner.lock_slot().take_loaded();
        let Some(loaded) = released else {
            tracing::debug!("Offload requested with no model loaded");
            return false;
        };

        let leases = loaded.leases();
        if leases > 0 {
            tracing::warn!(
                leases,
                "Model offloaded while leased; it is dropped when the last lease is returned"
            );
        }
        tracing::info!(device = %loaded.device(), "Model offloaded");
        drop(loaded);
        true
    }

    /// Evict the instance `lease` points at, if it is still the resident one.
    ///
    /// For callers that found the instance unusable; a newer instance loaded
    /// in the meantime is left alone.
    pub fn release_instance(&self, lease: &Lease<R>) -> bool {
        let released = {
            let mut slot = self.inner.lock_slot();
            let resident = matches!(
                &slot.state,
                SlotState::Loaded(loaded) if Arc::ptr_eq(&loaded.resident, lease.resident())
            );
            if resident { slot.take_loaded() } else { None }
        };
        let Some(loaded) = released else {
            return false;
        };
        tracing::warn!(
            device = %loaded.device(),
            episode = lease.episode(),
            "Releasing unusable model instance"
        );
        drop(loaded);
        true
    }

    pub fn status(&self) -> StatusSnapshot {
        let slot = self.inner.lock_slot();
        let mut snapshot = StatusSnapshot {
            model_loaded: false,
            state: ResidencyState::Empty,
            device: None,
            idle_timeout: self.inner.config.idle_timeout.as_secs(),
            idle_seconds: None,
            loaded_at: None,
            active_leases: 0,
            watchdog_running: slot.watchdog_running(),
            memory: None,
        };

        match &slot.state {
            SlotState::Empty => {}
            SlotState::Loading { .. } => snapshot.state = ResidencyState::Loading,
            SlotState::Loaded(loaded) => {
                let device = loaded.device();
                snapshot.model_loaded = true;
                snapshot.state = ResidencyState::Loaded;
                snapshot.device = Some(device);
                snapshot.idle_seconds = Some(loaded.last_used.elapsed().as_secs_f64());
                snapshot.loaded_at = Some(loaded.loaded_at.to_rfc3339());
                snapshot.active_leases = loaded.leases();
                if device.reports_memory() {
                    snapshot.memory = loaded.resident.resource.memory_usage();
                }
            }
        }
        snapshot
    }

    /// Stop the watchdog, release the model and refuse further acquires.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let (watchdog, released) = {
            let mut slot = self.inner.lock_slot();
            slot.closed = true;
            (slot.watchdog.take(), slot.take_loaded())
        };

        if let Some(handle) = watchdog
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Idle watchdog task failed");
        }

        if let Some(loaded) = released {
            tracing::info!(device = %loaded.device(), "Releasing model on shutdown");
            drop(loaded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PinnedProbe;
    use crate::residency::loader_fn;
    use crate::status::MemoryUsage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeModel {
        dropped: Arc<AtomicUsize>,
    }

    impl ResidentResource for FakeModel {
        fn memory_usage(&self) -> Option<MemoryUsage> {
            Some(MemoryUsage {
                allocated_mb: 10.0,
                reserved_mb: 20.0,
            })
        }
    }

    impl Drop for FakeModel {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingLoader {
        loads: AtomicUsize,
        dropped: Arc<AtomicUsize>,
        delay: Duration,
        fail: bool,
    }

    impl CountingLoader {
        fn new() -> Self {
            Self {
                loads: AtomicUsize::new(0),
                dropped: Arc::new(AtomicUsize::new(0)),
                delay: Duration::ZERO,
                fail: false,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new()
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }

        fn dropped(&self) -> usize {
            self.dropped.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Loader<FakeModel> for CountingLoader {
        async fn load(&self, _device: Device) -> Result<FakeModel, LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(LoadError::failed("checkpoint download failed"));
            }
            Ok(FakeModel {
                dropped: Arc::clone(&self.dropped),
            })
        }
    }

    fn manager(idle: u64, poll: u64) -> ResourceManager<FakeModel> {
        ResourceManager::new(
            ManagerConfig::default()
                .with_idle_timeout(Duration::from_secs(idle))
                .with_poll_interval(Duration::from_secs(poll))
                .with_probe(Arc::new(PinnedProbe(Device::Cpu))),
        )
    }

    #[tokio::test]
    async fn starts_empty() {
        let mgr = manager(300, 30);
        let status = mgr.status();
        assert!(!status.model_loaded);
        assert_eq!(status.state, ResidencyState::Empty);
        assert_eq!(status.device, None);
        assert_eq!(status.idle_timeout, 300);
        assert!(!status.watchdog_running);
    }

    #[tokio::test]
    async fn acquire_loads_once_and_reuses_instance() {
        let mgr = manager(300, 30);
        let loader = Arc::new(CountingLoader::new());

        let first = mgr.acquire(&loader).await.unwrap();
        let second = mgr.acquire(&loader).await.unwrap();

        assert_eq!(loader.loads(), 1);
        assert!(first.same_instance(&second));
        assert_eq!(first.device(), Device::Cpu);

        let status = mgr.status();
        assert!(status.model_loaded);
        assert_eq!(status.device, Some(Device::Cpu));
        assert_eq!(status.active_leases, 2);
        assert!(status.watchdog_running);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_share_one_load() {
        let mgr = manager(300, 30);
        let loader = Arc::new(CountingLoader::slow(Duration::from_secs(5)));

        let leases = futures::future::join_all((0..16).map(|_| mgr.acquire(&loader))).await;

        assert_eq!(loader.loads(), 1);
        let leases: Vec<_> = leases.into_iter().map(Result::unwrap).collect();
        assert!(leases.iter().all(|l| l.same_instance(&leases[0])));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_share_one_failure() {
        let mgr = manager(300, 30);
        let loader = Arc::new(CountingLoader {
            delay: Duration::from_secs(1),
            ..CountingLoader::failing()
        });

        let results = futures::future::join_all((0..8).map(|_| mgr.acquire(&loader))).await;

        assert_eq!(loader.loads(), 1);
        for result in results {
            assert_eq!(
                result.err(),
                Some(LoadError::Failed("checkpoint download failed".to_string()))
            );
        }
        assert!(!mgr.status().model_loaded);
    }

    #[tokio::test]
    async fn failed_load_leaves_slot_empty_for_retry() {
        let mgr = manager(300, 30);

        let bad = Arc::new(CountingLoader::failing());
        assert!(matches!(mgr.acquire(&bad).await, Err(LoadError::Failed(_))));
        assert_eq!(mgr.status().state, ResidencyState::Empty);

        let good = Arc::new(CountingLoader::new());
        assert!(mgr.acquire(&good).await.is_ok());
        assert!(mgr.status().model_loaded);
    }

    #[tokio::test]
    async fn force_release_is_idempotent() {
        let mgr = manager(300, 30);
        let loader = Arc::new(CountingLoader::new());
        drop(mgr.acquire(&loader).await.unwrap());

        assert!(mgr.force_release());
        assert!(!mgr.status().model_loaded);
        assert_eq!(mgr.status().device, None);
        assert_eq!(loader.dropped(), 1);

        assert!(!mgr.force_release());
        assert!(!mgr.status().model_loaded);
    }

    #[tokio::test]
    async fn force_release_keeps_watchdog_running() {
        let mgr = manager(300, 30);
        let loader = Arc::new(CountingLoader::new());
        drop(mgr.acquire(&loader).await.unwrap());

        mgr.force_release();
        assert!(mgr.status().watchdog_running);

        drop(mgr.acquire(&loader).await.unwrap());
        assert_eq!(loader.loads(), 2);
        assert!(mgr.status().model_loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_evicts_after_idle_timeout() {
        let mgr = manager(2, 1);
        let loader = Arc::new(CountingLoader::new());
        drop(mgr.acquire(&loader).await.unwrap());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(mgr.status().model_loaded);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let status = mgr.status();
        assert!(!status.model_loaded);
        assert!(!status.watchdog_running);
        assert_eq!(loader.dropped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_poll_interval_is_clamped_to_a_day() {
        let mgr = manager(2, u64::MAX);
        let loader = Arc::new(CountingLoader::new());
        drop(mgr.acquire(&loader).await.unwrap());

        tokio::task::yield_now().await;
        assert!(mgr.status().watchdog_running);

        tokio::time::sleep(Duration::from_secs(24 * 60 * 60 + 1)).await;
        let status = mgr.status();
        assert!(!status.model_loaded);
        assert_eq!(loader.dropped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_after_idle_eviction_restarts_watchdog() {
        let mgr = manager(2, 1);
        let loader = Arc::new(CountingLoader::new());

        drop(mgr.acquire(&loader).await.unwrap());
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!mgr.status().model_loaded);

        drop(mgr.acquire(&loader).await.unwrap());
        let status = mgr.status();
        assert!(status.model_loaded);
        assert!(status.watchdog_running);
        assert_eq!(loader.loads(), 2);

        // The restarted watchdog evicts again.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!mgr.status().model_loaded);
        assert_eq!(loader.dropped(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_defers_eviction_while_leased() {
        let mgr = manager(2, 1);
        let loader = Arc::new(CountingLoader::new());
        let lease = mgr.acquire(&loader).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(mgr.status().model_loaded);
        assert_eq!(mgr.status().active_leases, 1);

        // Returning the lease counts as use; idle time restarts from here.
        drop(lease);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(mgr.status().model_loaded);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!mgr.status().model_loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_waits_for_released_instance_to_drop() {
        let mgr = manager(300, 30);
        let loader = Arc::new(CountingLoader::new());
        let held = mgr.acquire(&loader).await.unwrap();

        assert!(mgr.force_release());
        assert_eq!(loader.dropped(), 0);

        let waiting = {
            let mgr = mgr.clone();
            let loader = Arc::clone(&loader);
            tokio::spawn(async move { mgr.acquire(&loader).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());
        assert_eq!(loader.loads(), 1);
        assert_eq!(mgr.status().state, ResidencyState::Loading);

        drop(held);
        let fresh = waiting.await.unwrap().unwrap();
        assert_eq!(loader.dropped(), 1);
        assert_eq!(loader.loads(), 2);
        assert_eq!(fresh.episode(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_loading_without_waiting() {
        let mgr = manager(300, 30);
        let loader = Arc::new(CountingLoader::slow(Duration::from_secs(60)));

        let pending = {
            let mgr = mgr.clone();
            let loader = Arc::clone(&loader);
            tokio::spawn(async move { mgr.acquire(&loader).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let status = mgr.status();
        assert_eq!(status.state, ResidencyState::Loading);
        assert!(!status.model_loaded);
        // Nothing to release mid-load.
        assert!(!mgr.force_release());

        pending.await.unwrap().unwrap();
        assert!(mgr.status().model_loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_caller_does_not_strand_the_load() {
        let mgr = manager(300, 30);
        let loader = Arc::new(CountingLoader::slow(Duration::from_secs(5)));

        let caller = {
            let mgr = mgr.clone();
            let loader = Arc::clone(&loader);
            tokio::spawn(async move { mgr.acquire(&loader).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(mgr.status().model_loaded);
        assert_eq!(loader.loads(), 1);
    }

    #[tokio::test]
    async fn panicking_loader_resets_slot() {
        let mgr = manager(300, 30);
        let panicking = Arc::new(loader_fn(|_device: Device| async move {
            if true {
                panic!("loader exploded");
            }
            Ok::<FakeModel, LoadError>(FakeModel {
                dropped: Arc::new(AtomicUsize::new(0)),
            })
        }));

        assert_eq!(mgr.acquire(&panicking).await.err(), Some(LoadError::Lost));
        assert_eq!(mgr.status().state, ResidencyState::Empty);

        let loader = Arc::new(CountingLoader::new());
        assert!(mgr.acquire(&loader).await.is_ok());
    }

    #[tokio::test]
    async fn release_instance_only_touches_the_resident_instance() {
        let mgr = manager(300, 30);
        let loader = Arc::new(CountingLoader::new());

        let first = mgr.acquire(&loader).await.unwrap();
        assert!(mgr.release_instance(&first));
        assert!(!mgr.release_instance(&first));
        drop(first);

        let second = mgr.acquire(&loader).await.unwrap();
        assert_eq!(second.episode(), 2);

        let other = manager(300, 30);
        let foreign = other.acquire(&loader).await.unwrap();
        assert!(!mgr.release_instance(&foreign));
        assert!(mgr.status().model_loaded);
    }

    #[tokio::test]
    async fn memory_is_reported_for_cuda_only() {
        let cuda = ResourceManager::new(
            ManagerConfig::default().with_probe(Arc::new(PinnedProbe(Device::Cuda))),
        );
        let loader = Arc::new(CountingLoader::new());
        let _lease = cuda.acquire(&loader).await.unwrap();
        let memory = cuda.status().memory.expect("cuda reports memory");
        assert_eq!(memory.reserved_mb, 20.0);

        let cpu = manager(300, 30);
        let _lease = cpu.acquire(&loader).await.unwrap();
        assert!(cpu.status().memory.is_none());
    }

    #[tokio::test]
    async fn shutdown_releases_and_refuses_acquire() {
        let mgr = manager(300, 30);
        let loader = Arc::new(CountingLoader::new());
        drop(mgr.acquire(&loader).await.unwrap());

        mgr.shutdown().await;

        let status = mgr.status();
        assert!(!status.model_loaded);
        assert!(!status.watchdog_running);
        assert_eq!(loader.dropped(), 1);
        assert_eq!(mgr.acquire(&loader).await.err(), Some(LoadError::ShutDown));
    }
}
