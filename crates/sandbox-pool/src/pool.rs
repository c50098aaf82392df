use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use sandbox::{ExecRequest, SandboxRuntime};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::lease::Lease;

/// Kills everything but the instance's init process. `kill -1` never
/// signals the caller itself.
const REAP_SCRIPT: &str = "kill -9 -1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Available,
    Busy,
    Removed,
}

/// Bookkeeping for one running instance.
#[derive(Debug, Clone)]
pub struct PoolInstance {
    pub id: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub use_count: u64,
    pub state: InstanceState,
    /// Pool generation the instance was created in; stale after `cleanup`.
    generation: u64,
}

impl PoolInstance {
    fn new(id: String, generation: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            use_count: 0,
            state: InstanceState::Available,
            generation,
        }
    }
}

/// Point-in-time counters, serialized as the `/stats` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub image: String,
    pub pool_size: usize,
    pub available: usize,
    pub busy: usize,
    pub total: usize,
    pub initialized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    Idle,
    Running,
    Ready,
}

struct PoolState {
    init: InitState,
    /// Bumped by `cleanup`; creations that finish under an older generation
    /// are discarded.
    generation: u64,
    available: VecDeque<PoolInstance>,
    busy: HashMap<String, PoolInstance>,
    /// Creations in flight, reserved against the ceiling before they start.
    creating: usize,
    /// Instances between release and re-availability.
    returning: usize,
    eviction: Option<CancellationToken>,
}

impl PoolState {
    fn total(&self) -> usize {
        self.available.len() + self.busy.len() + self.creating + self.returning
    }

    /// Reserve a creation slot if the ceiling allows it.
    fn try_reserve(&mut self, ceiling: usize) -> bool {
        if self.total() < ceiling {
            self.creating += 1;
            true
        } else {
            false
        }
    }
}

struct Inner {
    config: PoolConfig,
    runtime: Arc<dyn SandboxRuntime>,
    state: Mutex<PoolState>,
    /// Signalled whenever an instance becomes available or initialization ends.
    changed: Notify,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let remaining = state.available.len() + state.busy.len();
        if remaining > 0 {
            warn!(
                pool = %self.config.name,
                remaining,
                "container pool dropped without cleanup(), instances left running"
            );
        }
        if let Some(token) = state.eviction.take() {
            token.cancel();
        }
    }
}

/// Pre-warmed pool of sandbox instances for one image.
///
/// Cloning is cheap (reference count bump) and every clone drives the same
/// pool. All bookkeeping happens under one lock, so no instance is ever
/// handed to two callers; runtime calls are made with the lock released.
///
/// Lifecycle:
/// - [`initialize`](Self::initialize) starts `size` instances in parallel,
///   tolerating individual failures, then starts the idle sweep.
/// - [`acquire`](Self::acquire) hands out the oldest available instance,
///   creating one on demand while under the ceiling of `2 * size`.
/// - [`release`](Self::release) cleans the instance and checks it is still
///   running; unhealthy instances are replaced in the background.
/// - [`cleanup`](Self::cleanup) removes everything.
#[derive(Clone)]
pub struct ContainerPool {
    inner: Arc<Inner>,
}

impl ContainerPool {
    pub fn new(config: PoolConfig, runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                state: Mutex::new(PoolState {
                    init: InitState::Idle,
                    generation: 0,
                    available: VecDeque::new(),
                    busy: HashMap::new(),
                    creating: 0,
                    returning: 0,
                    eviction: None,
                }),
                changed: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Runtime the pool's instances live in, for running work on a leased id.
    pub fn runtime(&self) -> &Arc<dyn SandboxRuntime> {
        &self.inner.runtime
    }

    /// Pre-warm the pool.
    ///
    /// Runs at most once until the next [`cleanup`](Self::cleanup); a call
    /// while initialization is running or finished returns immediately.
    /// Failed creations are logged and leave the pool smaller than `size`.
    ///
    /// The work runs in its own task: cancelling the caller neither aborts
    /// in-flight creations nor leaves the pool stuck initializing.
    pub async fn initialize(&self) {
        let pool = self.clone();
        if let Err(e) = tokio::spawn(async move { pool.run_initialize().await }).await {
            error!(pool = %self.inner.config.name, error = %e, "initialization task failed");
        }
    }

    async fn run_initialize(&self) {
        let config = &self.inner.config;
        let generation = {
            let mut state = self.inner.state.lock().await;
            if state.init != InitState::Idle {
                return;
            }
            state.init = InitState::Running;
            state.generation
        };

        info!(
            pool = %config.name,
            image = %config.image,
            size = config.size,
            runtime = self.inner.runtime.name(),
            "initializing container pool"
        );

        if config.sweep_stale {
            self.remove_stale().await;
        }

        let reserved = {
            let mut state = self.inner.state.lock().await;
            let room = config.ceiling().saturating_sub(state.total());
            let count = config.size.min(room);
            state.creating += count;
            count
        };

        let mut join_set = JoinSet::new();
        for _ in 0..reserved {
            let pool = self.clone();
            join_set.spawn(async move { pool.create_reserved(generation).await });
        }

        let mut created = 0usize;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(_)) => created += 1,
                Ok(Err(e)) => error!(pool = %config.name, error = %e, "failed to pre-warm instance"),
                Err(e) => error!(pool = %config.name, error = %e, "pre-warm task panicked"),
            }
        }

        {
            let mut state = self.inner.state.lock().await;
            if state.generation != generation {
                debug!(pool = %config.name, "pool cleaned up during initialization");
                return;
            }
            state.init = InitState::Ready;
            if state.eviction.is_none() {
                let token = CancellationToken::new();
                self.spawn_eviction(token.clone());
                state.eviction = Some(token);
            }
        }
        self.inner.changed.notify_waiters();

        if created < config.size {
            warn!(
                pool = %config.name,
                created,
                requested = config.size,
                "container pool initialized below target size"
            );
        } else {
            info!(pool = %config.name, created, "container pool ready");
        }
    }

    /// Hand out an instance for exclusive use.
    ///
    /// Waits for a running initialization first. When nothing is available
    /// and the ceiling allows, one instance is created on demand (at most
    /// once per call); otherwise the call re-checks up to `acquire_attempts`
    /// times, woken early by releases, before failing with
    /// [`PoolError::Exhausted`].
    pub async fn acquire(&self) -> Result<String> {
        let config = &self.inner.config;

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().await.init != InitState::Running {
                break;
            }
            let _ = tokio::time::timeout(config.acquire_interval, notified).await;
        }

        let mut on_demand_tried = false;
        let mut last_error = None;
        let mut attempt = 0;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let reserved = {
                let mut state = self.inner.state.lock().await;
                if let Some(mut instance) = state.available.pop_front() {
                    instance.state = InstanceState::Busy;
                    instance.use_count += 1;
                    instance.last_used_at = Instant::now();
                    let id = instance.id.clone();
                    debug!(pool = %config.name, id = %id, uses = instance.use_count, "instance acquired");
                    state.busy.insert(id.clone(), instance);
                    return Ok(id);
                }
                if !on_demand_tried && state.try_reserve(config.ceiling()) {
                    Some(state.generation)
                } else {
                    None
                }
            };

            if let Some(generation) = reserved {
                on_demand_tried = true;
                info!(pool = %config.name, "no instance available, creating one on demand");
                if let Err(e) = self.create_detached(generation).await {
                    warn!(pool = %config.name, error = %e, "on-demand creation failed");
                    last_error = Some(e.to_string());
                }
                continue;
            }

            if attempt == config.acquire_attempts {
                break;
            }
            attempt += 1;
            let _ = tokio::time::timeout(config.acquire_interval, notified).await;
        }

        let waited = config.acquire_interval * config.acquire_attempts;
        let detail = match last_error {
            Some(e) => format!("gave up after {waited:?}, last creation error: {e}"),
            None => format!("gave up after {waited:?}"),
        };
        Err(PoolError::Exhausted {
            pool: config.name.clone(),
            image: config.image.clone(),
            detail,
        })
    }

    /// [`acquire`](Self::acquire) wrapped in a guard that releases on drop.
    pub async fn lease(&self) -> Result<Lease> {
        let id = self.acquire().await?;
        Ok(Lease::new(self.clone(), id))
    }

    /// Return an instance to the pool.
    ///
    /// Ids that are not currently busy are ignored, so a double release is
    /// harmless. The instance is cleaned, then health-checked; a healthy
    /// instance becomes available again, an unhealthy one is removed and,
    /// if the pool is below target, replaced in the background.
    ///
    /// The return runs in its own task, spawned before the first await, so
    /// a caller cancelled midway cannot strand the instance outside both
    /// the available and busy sets.
    pub async fn release(&self, id: &str) {
        let pool = self.clone();
        let owned = id.to_string();
        let task = tokio::spawn(async move { pool.return_instance(&owned).await });
        if let Err(e) = task.await {
            error!(pool = %self.inner.config.name, id = %id, error = %e, "release task failed");
        }
    }

    async fn return_instance(&self, id: &str) {
        let config = &self.inner.config;
        let instance = {
            let mut state = self.inner.state.lock().await;
            match state.busy.remove(id) {
                Some(instance) => {
                    state.returning += 1;
                    instance
                }
                None => {
                    debug!(pool = %config.name, id = %id, "release of an instance that is not busy ignored");
                    return;
                }
            }
        };

        self.clean(id).await;

        let healthy = match self.inner.runtime.is_running(id).await {
            Ok(running) => running,
            Err(e) => {
                warn!(pool = %config.name, id = %id, error = %e, "health check failed");
                false
            }
        };

        let mut instance = instance;
        let replacement = {
            let mut state = self.inner.state.lock().await;
            state.returning = state.returning.saturating_sub(1);

            if healthy && instance.generation == state.generation {
                instance.state = InstanceState::Available;
                instance.last_used_at = Instant::now();
                state.available.push_back(instance);
                drop(state);
                self.inner.changed.notify_one();
                debug!(pool = %config.name, id = %id, "instance returned");
                return;
            }

            instance.state = InstanceState::Removed;
            let wanted = instance.generation == state.generation
                && state.init == InitState::Ready
                && state.total() < config.size;
            if wanted && state.try_reserve(config.ceiling()) {
                Some(state.generation)
            } else {
                None
            }
        };

        if healthy {
            debug!(pool = %config.name, id = %id, "instance outlived its pool generation, removing");
        } else {
            warn!(pool = %config.name, id = %id, "instance unhealthy after use, removing");
        }
        if let Err(e) = self.inner.runtime.remove(id).await {
            warn!(pool = %config.name, id = %id, error = %e, "failed to remove instance");
        }

        if let Some(generation) = replacement {
            let pool = self.clone();
            tokio::spawn(async move {
                match pool.create_reserved(generation).await {
                    Ok(id) => info!(pool = %pool.inner.config.name, id = %id, "replacement instance ready"),
                    Err(e) => warn!(pool = %pool.inner.config.name, error = %e, "failed to create replacement instance"),
                }
            });
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let config = &self.inner.config;
        let state = self.inner.state.lock().await;
        PoolStats {
            image: config.image.clone(),
            pool_size: config.size,
            available: state.available.len(),
            busy: state.busy.len(),
            total: state.available.len() + state.busy.len(),
            initialized: state.init == InitState::Ready,
        }
    }

    /// Snapshot of the instances currently tracked, available first.
    pub async fn instances(&self) -> Vec<PoolInstance> {
        let state = self.inner.state.lock().await;
        state
            .available
            .iter()
            .chain(state.busy.values())
            .cloned()
            .collect()
    }

    /// Remove available instances idle for longer than `idle_timeout`.
    ///
    /// Busy instances are never touched. Returns how many were removed.
    pub async fn evict_idle(&self) -> usize {
        let config = &self.inner.config;
        let expired: Vec<PoolInstance> = {
            let mut state = self.inner.state.lock().await;
            let now = Instant::now();
            let (expired, kept): (VecDeque<_>, VecDeque<_>) = state
                .available
                .drain(..)
                .partition(|i| now.duration_since(i.last_used_at) > config.idle_timeout);
            state.available = kept;
            expired.into()
        };

        if expired.is_empty() {
            return 0;
        }
        info!(
            pool = %config.name,
            count = expired.len(),
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "removing idle instances"
        );
        self.remove_all(expired.into_iter().map(|i| i.id).collect())
            .await
    }

    /// Remove every instance, stop the idle sweep and reset the pool so
    /// [`initialize`](Self::initialize) can run again.
    pub async fn cleanup(&self) {
        let config = &self.inner.config;
        let (ids, token) = {
            let mut state = self.inner.state.lock().await;
            state.generation += 1;
            state.init = InitState::Idle;
            let mut ids: Vec<String> = state.available.drain(..).map(|i| i.id).collect();
            ids.extend(state.busy.drain().map(|(id, _)| id));
            (ids, state.eviction.take())
        };

        if let Some(token) = token {
            token.cancel();
        }
        self.inner.changed.notify_waiters();

        info!(pool = %config.name, count = ids.len(), "cleaning up container pool");
        let removed = self.remove_all(ids).await;
        debug!(pool = %config.name, removed, "container pool cleaned up");
    }

    /// [`create_reserved`](Self::create_reserved) in its own task, so the
    /// reservation is settled even if the caller is cancelled.
    async fn create_detached(&self, generation: u64) -> Result<String> {
        let pool = self.clone();
        tokio::spawn(async move { pool.create_reserved(generation).await })
            .await
            .unwrap_or_else(|e| {
                Err(PoolError::Task {
                    pool: self.inner.config.name.clone(),
                    detail: e.to_string(),
                })
            })
    }

    /// Start one instance against a slot already reserved in `creating`.
    ///
    /// On success the instance is queued as available, unless the pool was
    /// cleaned up meanwhile, in which case it is removed again.
    async fn create_reserved(&self, generation: u64) -> Result<String> {
        let spec = self.inner.config.instance_spec();
        let started = self.inner.runtime.start(&spec).await;

        let mut state = self.inner.state.lock().await;
        state.creating = state.creating.saturating_sub(1);
        let id = started?;

        if state.generation != generation {
            drop(state);
            debug!(pool = %self.inner.config.name, id = %id, "discarding instance created before cleanup");
            if let Err(e) = self.inner.runtime.remove(&id).await {
                warn!(pool = %self.inner.config.name, id = %id, error = %e, "failed to remove discarded instance");
            }
            return Err(PoolError::ShutDown(self.inner.config.name.clone()));
        }

        debug!(pool = %self.inner.config.name, id = %id, "instance created");
        state
            .available
            .push_back(PoolInstance::new(id.clone(), generation));
        drop(state);
        self.inner.changed.notify_one();
        Ok(id)
    }

    /// Best-effort reset of an instance's processes and scratch space.
    async fn clean(&self, id: &str) {
        let config = &self.inner.config;
        let runtime = &self.inner.runtime;

        if config.reap_processes {
            let argv = ["sh", "-c", REAP_SCRIPT];
            if let Err(e) = runtime.exec(id, &ExecRequest::new(&argv)).await {
                debug!(pool = %config.name, id = %id, error = %e, "process reap failed");
            }
        }

        if !config.scrub_dirs.is_empty() {
            let mut argv: Vec<&str> = vec!["find"];
            argv.extend(config.scrub_dirs.iter().map(String::as_str));
            argv.extend(["-mindepth", "1", "-delete"]);
            match runtime.exec(id, &ExecRequest::new(&argv)).await {
                Ok(result) if !result.success() => {
                    debug!(pool = %config.name, id = %id, stderr = %result.stderr.trim(), "scrub incomplete");
                }
                Ok(_) => {}
                Err(e) => debug!(pool = %config.name, id = %id, error = %e, "scrub failed"),
            }
        }
    }

    /// Remove instances carrying this pool's label that the pool does not
    /// track, i.e. leftovers from an earlier process.
    async fn remove_stale(&self) {
        let config = &self.inner.config;
        let tracked: HashSet<String> = {
            let state = self.inner.state.lock().await;
            state
                .available
                .iter()
                .map(|i| i.id.clone())
                .chain(state.busy.keys().cloned())
                .collect()
        };
        let listed = self.inner.runtime.list(&config.label()).await.map(|ids| {
            ids.into_iter()
                .filter(|id| !tracked.contains(id))
                .collect::<Vec<_>>()
        });
        match listed {
            Ok(ids) if !ids.is_empty() => {
                info!(pool = %config.name, count = ids.len(), "removing stale instances");
                self.remove_all(ids).await;
            }
            Ok(_) => {}
            Err(e) => warn!(pool = %config.name, error = %e, "failed to list stale instances"),
        }
    }

    /// Remove `ids` in parallel. Returns how many removals succeeded.
    async fn remove_all(&self, ids: Vec<String>) -> usize {
        let mut join_set = JoinSet::new();
        for id in ids {
            let runtime = Arc::clone(&self.inner.runtime);
            join_set.spawn(async move {
                let result = runtime.remove(&id).await;
                (id, result)
            });
        }

        let mut removed = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => removed += 1,
                Ok((id, Err(e))) => {
                    warn!(pool = %self.inner.config.name, id = %id, error = %e, "failed to remove instance")
                }
                Err(e) => error!(pool = %self.inner.config.name, error = %e, "removal task panicked"),
            }
        }
        removed
    }

    /// Periodic idle sweep. Holds only a weak reference so a dropped pool
    /// stops its sweeper.
    fn spawn_eviction(&self, token: CancellationToken) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.eviction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        ContainerPool { inner }.evict_idle().await;
                    }
                }
            }
        });
    }
}
