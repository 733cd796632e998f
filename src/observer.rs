//! Weak-holder capability.

use crate::referenced::RefHeader;
use core::fmt;

/// Identity of a counted object. Stable for the object's lifetime and
/// never dereferenced; two live objects never share an id.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectId(usize);

impl ObjectId {
    pub(crate) fn of(header: *const RefHeader) -> Self {
        ObjectId(header as usize)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:#x})", self.0)
    }
}

/// Receives lifetime notifications for objects it was registered with.
///
/// Observers are held weakly by an `ObserverSet`; registering never keeps
/// the observer or the object alive.
///
/// Callbacks run with the object's observer-set lock held. They may call
/// `ObserverSet::add`/`remove` on the same set, but must not block on
/// another thread that is waiting for that set.
pub trait Observer: Send + Sync {
    /// The object's count reached zero; it is still alive.
    ///
    /// This is the only window in which `object.acquire()` (or
    /// `object.rescue()`) may legally revive it. A revived object is not
    /// destroyed and no `object_deleted` follows for this cycle.
    fn object_unreferenced(&self, _object: &RefHeader) {}

    /// The object is about to be destroyed. Only its identity remains.
    fn object_deleted(&self, _id: ObjectId) {}
}
