//! Recycling object pools.
//!
//! [`ObjectPool`] hands out shared handles and remembers every instance it
//! created, so that returning an object it does not own is caught as a
//! programming error. [`LockFreePool`] is the unchecked variant: owned boxes
//! go back on a lock-free stack and nothing is validated.
//!
//! Neither pool shrinks. Recycled capacity stays allocated for the lifetime of
//! the pool.

mod lock_free;

pub use lock_free::LockFreePool;

use std::collections::HashMap;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::PoolError;
use crate::sync::{LockFreeQueue, RawSpinlock, Spinlock};

struct Registered<T> {
    handle: Arc<T>,
    idle: bool,
}

/// A pool of reference-counted objects with identity validation.
///
/// ```
/// use tasktimer::ObjectPool;
///
/// let pool: ObjectPool<Vec<u8>> = ObjectPool::new("buffers");
/// let first = pool.create();
/// let addr = std::sync::Arc::as_ptr(&first);
/// pool.recycle(first);
///
/// let second = pool.create();
/// assert_eq!(std::sync::Arc::as_ptr(&second), addr);
/// assert_eq!(pool.constructed(), 1);
/// ```
pub struct ObjectPool<T> {
    name: &'static str,
    registry: Spinlock<HashMap<usize, Registered<T>>>,
    recycled: LockFreeQueue<Arc<T>>,
    constructed: AtomicUsize,
    high_water_mark: usize,
}

impl<T> ObjectPool<T> {
    /// Live-instance count above which every new construction is logged.
    pub const DEFAULT_HIGH_WATER_MARK: usize = 1000;

    /// Creates an empty pool with the default high-water mark.
    ///
    /// # Arguments
    /// * `name` - Label used in log records
    pub fn new(name: &'static str) -> Self {
        Self::with_high_water_mark(name, Self::DEFAULT_HIGH_WATER_MARK)
    }

    /// Creates an empty pool that warns once more than `high_water_mark` instances exist.
    pub fn with_high_water_mark(name: &'static str, high_water_mark: usize) -> Self {
        Self {
            name,
            registry: Spinlock::from_raw(RawSpinlock::named("object_pool"), HashMap::new()),
            recycled: LockFreeQueue::new(),
            constructed: AtomicUsize::new(0),
            high_water_mark,
        }
    }

    /// Returns an idle instance if one is available, otherwise builds one with `init`.
    pub fn create_with(&self, init: impl FnOnce() -> T) -> Arc<T> {
        if let Some(handle) = self.recycled.pop() {
            if let Some(entry) = self.registry.lock().get_mut(&address(&handle)) {
                entry.idle = false;
            }
            return handle;
        }

        let handle = Arc::new(init());
        let live = {
            let mut registry = self.registry.lock();
            registry.insert(
                address(&handle),
                Registered {
                    handle: handle.clone(),
                    idle: false,
                },
            );
            registry.len()
        };
        self.constructed.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(pool = self.name, object = address(&handle), "constructed pooled object");
        if live > self.high_water_mark {
            tracing::warn!(pool = self.name, live, "object pool above high-water mark");
        }

        handle
    }

    /// Returns `handle` to the pool.
    ///
    /// Aborts the process if the object was not created by this pool or is
    /// already idle: either means two owners believe they hold the same slot.
    pub fn recycle(&self, handle: Arc<T>) {
        if let Err(err) = self.try_recycle(handle) {
            tracing::error!(pool = self.name, %err, "invalid recycle");
            process::abort();
        }
    }

    /// Returns `handle` to the pool, reporting misuse instead of aborting.
    pub fn try_recycle(&self, handle: Arc<T>) -> Result<(), PoolError> {
        let addr = address(&handle);

        let owned = {
            let mut registry = self.registry.lock();
            match registry.get_mut(&addr) {
                None => return Err(PoolError::Foreign(addr)),
                Some(entry) if entry.idle => return Err(PoolError::AlreadyIdle(addr)),
                Some(entry) => {
                    entry.idle = true;
                    entry.handle.clone()
                }
            }
        };

        drop(handle);
        self.recycled.push(owned);
        Ok(())
    }

    /// Number of instances this pool has created.
    pub fn live(&self) -> usize {
        self.registry.lock().len()
    }

    /// Approximate number of instances waiting in the recycle queue.
    pub fn idle(&self) -> usize {
        self.recycled.size()
    }

    /// Total number of constructions since the pool was created.
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::Relaxed)
    }

    /// Calls `f` on every instance the pool created, idle or not.
    pub fn for_each_live(&self, mut f: impl FnMut(&Arc<T>)) {
        let handles: Vec<Arc<T>> = self
            .registry
            .lock()
            .values()
            .map(|entry| entry.handle.clone())
            .collect();

        for handle in &handles {
            f(handle);
        }
    }
}

impl<T: Default> ObjectPool<T> {
    /// Returns an idle instance if one is available, otherwise a default one.
    pub fn create(&self) -> Arc<T> {
        self.create_with(T::default)
    }
}

fn address<T>(handle: &Arc<T>) -> usize {
    Arc::as_ptr(handle) as usize
}
