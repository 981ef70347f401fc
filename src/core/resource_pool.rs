//! Bounded, non-blocking pool of reusable objects.
//!
//! Resources are tracked in two disjoint sets: `available` (idle, already
//! reset) and `in_use` (handed out). Every mutation of the partition happens
//! under one `parking_lot::Mutex`; factory code (`create` / `reset`) always
//! runs with that lock released.

use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ResourcePoolConfig;

use super::{AppResult, ConfigError, ResourcePoolError};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Produces and recycles pooled resources.
pub trait ResourceFactory: Send + Sync {
    /// Resource type managed by the pool.
    type Resource: Send;

    /// Construct a new resource.
    fn create(&self) -> AppResult<Self::Resource>;

    /// Return a resource to a reusable state before it goes back to the pool.
    fn reset(&self, _resource: &mut Self::Resource) -> AppResult<()> {
        Ok(())
    }
}

/// A resource handed out by a [`ResourcePool`].
///
/// Carries the identity the pool uses to recognise it on release.
#[derive(Debug)]
pub struct Pooled<R> {
    pool_id: u64,
    id: u64,
    resource: R,
}

impl<R> Pooled<R> {
    /// Identifier of this resource within its pool.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

impl<R> Deref for Pooled<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.resource
    }
}

impl<R> DerefMut for Pooled<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.resource
    }
}

struct PoolState<R> {
    available: Vec<(u64, R)>,
    in_use: HashSet<u64>,
}

/// Slot reserved in `in_use` while factory code runs outside the lock.
/// Dropped without [`keep`](Self::keep), including during unwinding, it
/// removes the id again.
struct Reservation<'a, R> {
    state: &'a Mutex<PoolState<R>>,
    id: u64,
    armed: bool,
}

impl<'a, R> Reservation<'a, R> {
    const fn new(state: &'a Mutex<PoolState<R>>, id: u64) -> Self {
        Self {
            state,
            id,
            armed: true,
        }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl<R> Drop for Reservation<'_, R> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().in_use.remove(&self.id);
        }
    }
}

/// Generic bounded pool of reusable objects.
///
/// `acquire` never waits: it reuses an idle resource, creates one while
/// fewer than `max_size` are in use, or fails with
/// [`ResourcePoolError::Exhausted`].
pub struct ResourcePool<F: ResourceFactory> {
    pool_id: u64,
    config: ResourcePoolConfig,
    factory: F,
    state: Mutex<PoolState<F::Resource>>,
    next_resource_id: AtomicU64,
}

impl<F: ResourceFactory> fmt::Debug for ResourcePool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("pool_id", &self.pool_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<F: ResourceFactory> ResourcePool<F> {
    /// Create an empty pool.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(config: ResourcePoolConfig, factory: F) -> Result<Self, ConfigError> {
        config.validate().map_err(ConfigError)?;
        Ok(Self {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(PoolState {
                available: Vec::with_capacity(config.max_size.min(1024)),
                in_use: HashSet::new(),
            }),
            config,
            factory,
            next_resource_id: AtomicU64::new(0),
        })
    }

    /// Take a resource out of the pool.
    ///
    /// # Errors
    ///
    /// - [`ResourcePoolError::Exhausted`] if `max_size` resources are in use
    /// - [`ResourcePoolError::CreateFailed`] if the factory fails
    pub fn acquire(&self) -> Result<Pooled<F::Resource>, ResourcePoolError> {
        let id = {
            let mut state = self.state.lock();
            if let Some((id, resource)) = state.available.pop() {
                state.in_use.insert(id);
                return Ok(self.wrap(id, resource));
            }
            if state.in_use.len() >= self.config.max_size {
                debug!(pool_id = self.pool_id, in_use = state.in_use.len(), "resource pool exhausted");
                return Err(ResourcePoolError::Exhausted {
                    in_use: state.in_use.len(),
                    max_size: self.config.max_size,
                });
            }
            // Reserve the slot before running factory code outside the lock.
            let id = self.next_resource_id.fetch_add(1, Ordering::Relaxed);
            state.in_use.insert(id);
            id
        };

        // Gives the slot back if `create` fails or panics.
        let reservation = Reservation::new(&self.state, id);
        match self.factory.create() {
            Ok(resource) => {
                reservation.keep();
                debug!(pool_id = self.pool_id, resource_id = id, "created pooled resource");
                Ok(self.wrap(id, resource))
            }
            Err(e) => {
                drop(reservation);
                warn!(pool_id = self.pool_id, error = %e, "resource factory failed");
                Err(ResourcePoolError::CreateFailed(format!("{e:#}")))
            }
        }
    }

    /// Return a resource to the pool.
    ///
    /// Releasing a resource this pool does not currently track as in use
    /// (one from another pool, or one handed out before [`clear`](Self::clear))
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// [`ResourcePoolError::ResetFailed`] if the reset hook fails. The
    /// resource is then dropped instead of being made available again.
    pub fn release(&self, pooled: Pooled<F::Resource>) -> Result<(), ResourcePoolError> {
        let Pooled { pool_id, id, mut resource } = pooled;
        if pool_id != self.pool_id || !self.state.lock().in_use.contains(&id) {
            debug!(pool_id = self.pool_id, resource_id = id, "ignoring release of untracked resource");
            return Ok(());
        }

        // The resource stays counted as in use while its reset runs. A panic
        // in `reset` drops the resource and untracks it.
        let reservation = Reservation::new(&self.state, id);
        let reset = self.factory.reset(&mut resource);
        reservation.keep();

        let mut state = self.state.lock();
        if !state.in_use.remove(&id) {
            return Ok(());
        }
        match reset {
            Ok(()) => {
                state.available.push((id, resource));
                Ok(())
            }
            Err(e) => {
                drop(state);
                warn!(pool_id = self.pool_id, resource_id = id, error = %e, "resource reset failed; discarding");
                Err(ResourcePoolError::ResetFailed(format!("{e:#}")))
            }
        }
    }

    /// Acquire a resource wrapped in a guard that releases it on drop.
    ///
    /// # Errors
    ///
    /// Same as [`acquire`](Self::acquire).
    pub fn acquire_guard(&self) -> Result<PoolGuard<'_, F>, ResourcePoolError> {
        Ok(PoolGuard {
            pool: self,
            resource: Some(self.acquire()?),
        })
    }

    /// Run `f` with a pooled resource, releasing it on every exit path.
    ///
    /// If `f` panics the resource is released while unwinding and the panic
    /// continues.
    ///
    /// # Errors
    ///
    /// Acquisition errors, or [`ResourcePoolError::ResetFailed`] if the
    /// resource could not be reset after `f` returned.
    pub fn with_resource<T>(
        &self,
        f: impl FnOnce(&mut F::Resource) -> T,
    ) -> Result<T, ResourcePoolError> {
        let mut guard = self.acquire_guard()?;
        let out = f(&mut *guard);
        guard.release()?;
        Ok(out)
    }

    /// Forget every tracked resource. Idle resources are dropped; resources
    /// currently handed out become untracked, so releasing them later is a
    /// no-op.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.available.len();
        let orphaned = state.in_use.len();
        state.available.clear();
        state.in_use.clear();
        debug!(pool_id = self.pool_id, dropped, orphaned, "resource pool cleared");
    }

    /// Total tracked resources (`available + in_use`).
    #[must_use]
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        state.available.len() + state.in_use.len()
    }

    /// Idle resources ready for reuse.
    #[must_use]
    pub fn available(&self) -> usize {
        self.state.lock().available.len()
    }

    /// Resources currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use.len()
    }

    /// Configured maximum size.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.config.max_size
    }

    /// The factory backing this pool.
    #[must_use]
    pub const fn factory(&self) -> &F {
        &self.factory
    }

    fn wrap(&self, id: u64, resource: F::Resource) -> Pooled<F::Resource> {
        Pooled {
            pool_id: self.pool_id,
            id,
            resource,
        }
    }
}

/// Scoped acquisition: releases its resource back to the pool when dropped.
///
/// Holds no lock, so it can be kept across `.await` points.
pub struct PoolGuard<'a, F: ResourceFactory> {
    pool: &'a ResourcePool<F>,
    resource: Option<Pooled<F::Resource>>,
}

impl<F: ResourceFactory> PoolGuard<'_, F> {
    /// Release now and report reset failures, which `Drop` can only log.
    ///
    /// # Errors
    ///
    /// [`ResourcePoolError::ResetFailed`] if the reset hook fails.
    pub fn release(mut self) -> Result<(), ResourcePoolError> {
        match self.resource.take() {
            Some(resource) => self.pool.release(resource),
            None => Ok(()),
        }
    }
}

impl<F: ResourceFactory> Deref for PoolGuard<'_, F> {
    type Target = F::Resource;

    fn deref(&self) -> &F::Resource {
        self.resource
            .as_deref()
            .unwrap_or_else(|| unreachable!("guard resource is only taken on release"))
    }
}

impl<F: ResourceFactory> DerefMut for PoolGuard<'_, F> {
    fn deref_mut(&mut self) -> &mut F::Resource {
        self.resource
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("guard resource is only taken on release"))
    }
}

impl<F: ResourceFactory> Drop for PoolGuard<'_, F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            if let Err(e) = self.pool.release(resource) {
                warn!(error = %e, "failed to release guarded resource");
            }
        }
    }
}
