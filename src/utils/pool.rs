//! # Object Pool
//!
//! Generic reusable-resource pool with an optional capacity gate and
//! take-out / take-in / remove hooks.
//!
//! The pool backs both the per-write I/O descriptors and whole channel
//! objects. An item is created lazily by the factory when the idle set is
//! empty, handed out by [`ObjectPool::get`] and handed back with
//! [`ObjectPool::release`].
//!
//! ## Capacity
//! - `capacity > 0`: at most `capacity` items are borrowed at once; further
//!   `get` calls wait (without timeout) until an item is released
//! - `capacity == 0`: unbounded, the pool is a concurrent free-list
//!
//! ## Hooks
//! - **take-out** runs on every `get`, whether the item was idle or new
//! - **take-in** runs on every `release`, before the item becomes idle
//! - **remove** runs for each idle item when the pool is cleared or disposed
//!
//! ## Usage
//! ```rust
//! use packet_channel::utils::pool::ObjectPool;
//!
//! # async fn demo() -> packet_channel::error::Result<()> {
//! let pool = ObjectPool::new(2, || Vec::<u8>::with_capacity(64))
//!     .with_take_in(|buf| buf.clear());
//!
//! let mut buf = pool.get().await?;
//! buf.extend_from_slice(b"scratch");
//! pool.release(buf)?;
//! assert_eq!(pool.idle_count(), 1);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, trace};

use crate::error::{ProtocolError, Result};
use crate::utils::metrics::global_metrics;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Hook<T> = Box<dyn Fn(&mut T) + Send + Sync>;
type RemoveHook<T> = Box<dyn Fn(T) + Send + Sync>;

/// Bounded, hook-driven pool of reusable `T`
pub struct ObjectPool<T> {
    idle: SegQueue<T>,
    factory: Factory<T>,
    take_out: Option<Hook<T>>,
    take_in: Option<Hook<T>>,
    remove: Option<RemoveHook<T>>,
    /// Counting gate, present only when the pool is bounded
    gate: Option<Semaphore>,
    capacity: usize,
    borrowed: AtomicUsize,
    disposed: AtomicBool,
}

impl<T> ObjectPool<T> {
    /// Create a pool. `capacity == 0` makes it unbounded.
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            idle: SegQueue::new(),
            factory: Box::new(factory),
            take_out: None,
            take_in: None,
            remove: None,
            gate: (capacity > 0).then(|| Semaphore::new(capacity)),
            capacity,
            borrowed: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    /// Hook run on every borrowed item, fresh or reused
    pub fn with_take_out<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.take_out = Some(Box::new(hook));
        self
    }

    /// Hook run on every returned item before it becomes idle
    pub fn with_take_in<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.take_in = Some(Box::new(hook));
        self
    }

    /// Disposal callback run on idle items when the pool is cleared or torn down
    pub fn with_remove<F>(mut self, hook: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.remove = Some(Box::new(hook));
        self
    }

    /// Borrow an item, waiting while a bounded pool is at capacity.
    ///
    /// # Errors
    /// Returns [`ProtocolError::PoolDisposed`] once the pool has been torn down,
    /// including when teardown happens while this call is waiting.
    pub async fn get(&self) -> Result<T> {
        self.ensure_live()?;

        if let Some(gate) = &self.gate {
            match gate.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(TryAcquireError::NoPermits) => {
                    global_metrics().pool_wait();
                    trace!(capacity = self.capacity, "Pool at capacity, waiting for a release");
                    gate.acquire()
                        .await
                        .map_err(|_| ProtocolError::PoolDisposed)?
                        .forget();
                }
                Err(TryAcquireError::Closed) => return Err(ProtocolError::PoolDisposed),
            }
        }

        Ok(self.checkout())
    }

    /// Borrow an item without waiting; `Ok(None)` when a bounded pool is at capacity.
    pub fn try_get(&self) -> Result<Option<T>> {
        self.ensure_live()?;

        if let Some(gate) = &self.gate {
            match gate.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(TryAcquireError::NoPermits) => return Ok(None),
                Err(TryAcquireError::Closed) => return Err(ProtocolError::PoolDisposed),
            }
        }

        Ok(Some(self.checkout()))
    }

    fn checkout(&self) -> T {
        let mut item = match self.idle.pop() {
            Some(item) => item,
            None => {
                trace!("Idle set empty, creating pooled item");
                (self.factory)()
            }
        };
        self.borrowed.fetch_add(1, Ordering::AcqRel);
        if let Some(hook) = &self.take_out {
            hook(&mut item);
        }
        item
    }

    /// Return a borrowed item to the idle set.
    ///
    /// # Errors
    /// Returns [`ProtocolError::PoolDisposed`] after teardown; the item is then
    /// handed to the remove hook instead of being kept.
    pub fn release(&self, mut item: T) -> Result<()> {
        let _ = self
            .borrowed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        if self.disposed.load(Ordering::Acquire) {
            self.discard(item);
            return Err(ProtocolError::PoolDisposed);
        }

        if let Some(hook) = &self.take_in {
            hook(&mut item);
        }
        self.idle.push(item);

        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }

        // A teardown that raced with this release must not leave the item idle.
        if self.disposed.load(Ordering::Acquire) {
            self.clear();
        }
        Ok(())
    }

    /// Drain the idle set through the remove hook. Borrowed items are untouched.
    ///
    /// Returns how many idle items were removed.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        while let Some(item) = self.idle.pop() {
            self.discard(item);
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "Object pool cleared");
        }
        removed
    }

    /// Tear the pool down: wake and fail waiters, then clear the idle set.
    /// Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(gate) = &self.gate {
            gate.close();
        }
        let removed = self.clear();
        debug!(removed, borrowed = self.borrowed_count(), "Object pool disposed");
    }

    fn discard(&self, item: T) {
        match &self.remove {
            Some(hook) => hook(item),
            None => drop(item),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(ProtocolError::PoolDisposed)
        } else {
            Ok(())
        }
    }

    /// Items currently waiting in the idle set
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Items currently borrowed
    pub fn borrowed_count(&self) -> usize {
        self.borrowed.load(Ordering::Acquire)
    }

    /// Configured bound, 0 when unbounded
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl<T> Drop for ObjectPool<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("capacity", &self.capacity)
            .field("idle", &self.idle.len())
            .field("borrowed", &self.borrowed_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
