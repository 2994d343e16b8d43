use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

/// A lazily built value that can be discarded and rebuilt.
///
/// The first [`get_or_try_init`](Self::get_or_try_init) after construction or
/// after a reset runs the initializer; concurrent callers wait for it and share
/// the result. A failed initializer leaves the slot empty.
pub struct ResettableSlot<T> {
    value: Mutex<Option<Arc<T>>>,
}

impl<T> Default for ResettableSlot<T> {
    fn default() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }
}

impl<T> ResettableSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_try_init<F, Fut, E>(&self, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut value = self.value.lock().await;
        if let Some(current) = value.as_ref() {
            return Ok(Arc::clone(current));
        }
        let built = Arc::new(init().await?);
        *value = Some(Arc::clone(&built));
        Ok(built)
    }

    pub async fn current(&self) -> Option<Arc<T>> {
        self.value.lock().await.clone()
    }

    pub async fn take(&self) -> Option<Arc<T>> {
        self.value.lock().await.take()
    }

    /// Empties the slot only if the held value satisfies `predicate`.
    ///
    /// Lets a watcher discard the instance it observed without clobbering a
    /// replacement built in the meantime.
    pub async fn take_if(&self, predicate: impl FnOnce(&T) -> bool) -> Option<Arc<T>> {
        let mut value = self.value.lock().await;
        if value.as_deref().is_some_and(predicate) {
            value.take()
        } else {
            None
        }
    }

    pub async fn clear(&self) {
        self.take().await;
    }

    pub async fn is_empty(&self) -> bool {
        self.value.lock().await.is_none()
    }
}
