use std::sync::Arc;

use parking_lot::Mutex;

/// Holds a lazily built client that can be thrown away and rebuilt.
///
/// Both the consumer and the producer adapters keep their librdkafka handle
/// here. A fatal error calls [`invalidate`](Self::invalidate); the next caller
/// of [`get_or_try_init`](Self::get_or_try_init) builds a fresh instance.
/// Callers already holding an `Arc` keep using the old instance until they drop it.
pub struct LazyClient<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> Default for LazyClient<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LazyClient<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Return the cached instance or build one with `build`.
    ///
    /// Construction happens under the lock so concurrent callers never build twice.
    pub fn get_or_try_init<E>(&self, build: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        if let Some(client) = self.slot.lock().as_ref() {
            return Ok(client.clone());
        }

        let mut slot = self.slot.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let client = Arc::new(build()?);
        *slot = Some(client.clone());
        Ok(client)
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.lock().clone()
    }

    /// Drop the cached instance. It is returned so the caller decides where the
    /// last reference is released, librdkafka handles block while closing.
    pub fn invalidate(&self) -> Option<Arc<T>> {
        self.slot.lock().take()
    }

    /// Drop the cached instance only if `stale` says it is the one that failed,
    /// so a late error from a replaced instance cannot discard its successor.
    pub fn invalidate_if(&self, stale: impl FnOnce(&Arc<T>) -> bool) -> Option<Arc<T>> {
        let mut slot = self.slot.lock();
        match slot.as_ref() {
            Some(cached) if stale(cached) => slot.take(),
            _ => None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.slot.lock().is_some()
    }
}
