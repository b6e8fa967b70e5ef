//! Bounded resource pool.
//!
//! A semaphore counts free slots and a mutex-guarded free list holds the idle
//! items. [`PoolGuard`] hands its item back when dropped, so release happens on
//! every exit path: normal return, `?`, panic unwinding and future cancellation.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The pool has no item to hand out.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("resource pool closed")]
pub struct PoolClosed;

struct Shared<T> {
    idle: Mutex<Vec<T>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// Fixed set of interchangeable resources shared between tasks.
pub struct Pool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.shared.capacity)
            .field("available", &self.available())
            .finish()
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Create a pool owning `items`. Capacity is the number of items.
    pub fn new(items: Vec<T>) -> Self {
        let capacity = items.len();
        Self {
            shared: Arc::new(Shared {
                idle: Mutex::new(items),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
            }),
        }
    }

    /// Wait for a free item.
    ///
    /// # Errors
    ///
    /// Returns [`PoolClosed`] if the semaphore was closed or the free list is
    /// out of step with it.
    pub async fn acquire(&self) -> Result<PoolGuard<T>, PoolClosed> {
        let permit = Arc::clone(&self.shared.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolClosed)?;
        self.checkout(permit)
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> Result<PoolGuard<T>, PoolClosed> {
        let item = self
            .shared
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(PoolClosed)?;

        Ok(PoolGuard {
            item: Some(item),
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }
}

impl<T> Pool<T> {
    /// Number of items currently idle.
    pub fn available(&self) -> usize {
        self.shared.permits.available_permits()
    }

    /// Total number of items.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Exclusive access to one pooled item.
pub struct PoolGuard<T> {
    item: Option<T>,
    shared: Arc<Shared<T>>,
    // Released after `drop` has returned the item to the free list.
    _permit: OwnedSemaphorePermit,
}

impl<T> fmt::Debug for PoolGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolGuard").finish_non_exhaustive()
    }
}

impl<T> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `drop` takes the item.
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.shared
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(item);
        }
    }
}
