use crate::observer::ObjectId;
use crate::observer_set::ObserverSet;
use crate::ref_ptr::{RefCounted, RefPtr};
use core::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Weak handle to a counted object.
///
/// Holds the object's observer set, never the object. `upgrade` succeeds
/// only while the object still has owners; it cannot revive an object whose
/// count has reached zero.
pub struct ObserverPtr<T: Send + Sync + 'static> {
    set: Arc<ObserverSet>,
    ptr: NonNull<RefCounted<T>>,
}

// SAFETY: `ptr` is only dereferenced after `try_acquire_object` succeeded.
unsafe impl<T: Send + Sync + 'static> Send for ObserverPtr<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for ObserverPtr<T> {}

impl<T: Send + Sync + 'static> ObserverPtr<T> {
    pub fn new(target: &RefPtr<T>) -> Self {
        Self {
            set: target.header().get_or_create_observer_set(),
            ptr: target.as_non_null(),
        }
    }

    pub fn upgrade(&self) -> Option<RefPtr<T>> {
        if self.set.try_acquire_object().is_none() {
            return None;
        }
        // SAFETY: a count was taken on the live object under the set lock.
        Some(unsafe { RefPtr::from_raw(self.ptr) })
    }

    /// False once the object has been (or is being) destroyed.
    pub fn is_alive(&self) -> bool {
        self.set.is_object_alive()
    }

    pub fn id(&self) -> ObjectId {
        self.set.object_id()
    }

    pub fn observer_set(&self) -> &Arc<ObserverSet> {
        &self.set
    }
}

impl<T: Send + Sync + 'static> Clone for ObserverPtr<T> {
    fn clone(&self) -> Self {
        Self {
            set: self.set.clone(),
            ptr: self.ptr,
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for ObserverPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverPtr")
            .field("id", &self.id())
            .field("alive", &self.is_alive())
            .finish()
    }
}
