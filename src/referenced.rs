//! RefHeader: the intrusive counter at the front of every counted
//! allocation.
//!
//! State packing
//! - One `AtomicU64` holds the count in its low 32 bits and a revival
//!   epoch in the high 32 bits. The epoch is bumped on every 0 -> 1
//!   transition, which only an observer can legally cause (a rescue from
//!   `object_unreferenced`). A thread that takes the count to zero records
//!   the epoch it saw; that pair is its claim on running the protocol.
//! - Count overflow aborts the process, matching `Rc`/`Arc`.
//!
//! Ordering
//! - Decrements are `Release`; the zero transition is followed by an
//!   `Acquire` fence before any notification or destruction.
//! - The per-object lock is only taken to create the observer set. It may
//!   be taken while the observer-set lock is held (an observer creating the
//!   set from a callback), never the other way round.

use crate::context::RefContext;
use crate::delete_handler::{DeleteHandler, Deletion};
use crate::observer::ObjectId;
use crate::observer_set::{Claim, ObserverSet, Outcome};
use crate::ref_ptr::AnyRef;
use core::any::TypeId;
use core::fmt;
use parking_lot::Mutex;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

const COUNT_MASK: u64 = 0xFFFF_FFFF;
const EPOCH_ONE: u64 = 1 << 32;

pub(crate) type DropFn = unsafe fn(NonNull<RefHeader>);

pub struct RefHeader {
    state: AtomicU64,
    thread_safe: AtomicBool,
    // Allocated on demand; freed only when the header is dropped.
    ref_lock: AtomicPtr<Mutex<()>>,
    // Holds one strong count of the set, from `Arc::into_raw`.
    observers: AtomicPtr<ObserverSet>,
    // `None` for the process-wide context. Weak so that a handler holding
    // deletions never keeps its own context alive.
    context: Option<Weak<RefContext>>,
    // Pointer to this header with provenance over the whole allocation.
    this: NonNull<RefHeader>,
    value_type: TypeId,
    drop_fn: DropFn,
}

impl RefHeader {
    /// Build a header with count zero. The owner must call `bind` once the
    /// header has reached its final address.
    pub(crate) fn new(context: Option<&Arc<RefContext>>, value_type: TypeId, drop_fn: DropFn) -> Self {
        let thread_safe = match context {
            Some(ctx) => ctx.default_thread_safe(),
            None => RefContext::global().default_thread_safe(),
        };
        let ref_lock = if thread_safe {
            Box::into_raw(Box::new(Mutex::new(())))
        } else {
            ptr::null_mut()
        };
        Self {
            state: AtomicU64::new(0),
            thread_safe: AtomicBool::new(thread_safe),
            ref_lock: AtomicPtr::new(ref_lock),
            observers: AtomicPtr::new(ptr::null_mut()),
            context: context.map(Arc::downgrade),
            this: NonNull::dangling(),
            value_type,
            drop_fn,
        }
    }

    /// Record the header's final address.
    ///
    /// # Safety
    /// `this` must point to a header inside a live allocation that is not
    /// yet shared, with provenance over that whole allocation.
    pub(crate) unsafe fn bind(this: NonNull<RefHeader>) {
        unsafe { (*this.as_ptr()).this = this };
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::of(self)
    }

    /// Current number of owning references.
    pub fn count(&self) -> usize {
        (self.state.load(Ordering::Acquire) & COUNT_MASK) as usize
    }

    pub(crate) fn snapshot(&self) -> (usize, u32) {
        let s = self.state.load(Ordering::Acquire);
        ((s & COUNT_MASK) as usize, (s >> 32) as u32)
    }

    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe.load(Ordering::Acquire)
    }

    /// Whether this object currently uses a per-object lock.
    pub fn has_ref_lock(&self) -> bool {
        self.active_ref_lock().is_some()
    }

    /// `TypeId` of the value stored behind this header.
    pub fn value_type_id(&self) -> TypeId {
        self.value_type
    }

    /// The scoped context this object was created in, while it is alive.
    /// `None` for objects of the process-wide context.
    pub fn context(&self) -> Option<Arc<RefContext>> {
        self.context.as_ref().and_then(Weak::upgrade)
    }

    /// The handler that should receive this object once it is unreferenced.
    /// An object whose scoped context is gone is destroyed in place.
    fn delete_handler(&self) -> Option<Arc<dyn DeleteHandler>> {
        match &self.context {
            Some(ctx) => ctx.upgrade().and_then(|ctx| ctx.delete_handler()),
            None => RefContext::global().delete_handler(),
        }
    }

    pub(crate) fn drop_fn(&self) -> DropFn {
        self.drop_fn
    }

    /// Add one owning reference and return the new count.
    pub fn acquire(&self) -> usize {
        let old = self.state.fetch_add(1, Ordering::Relaxed);
        let count = old & COUNT_MASK;
        if count == COUNT_MASK {
            std::process::abort();
        }
        if count == 0 {
            self.state.fetch_add(EPOCH_ONE, Ordering::Relaxed);
        }
        (count + 1) as usize
    }

    /// Acquire and wrap the new reference in an owning handle.
    pub fn rescue(&self) -> AnyRef {
        self.acquire();
        // SAFETY: the count taken above is handed to the AnyRef.
        unsafe { AnyRef::from_raw(self.this) }
    }

    /// Acquire only if the object still has owners.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            let count = cur & COUNT_MASK;
            if count == 0 {
                return false;
            }
            if count == COUNT_MASK {
                std::process::abort();
            }
            match self.state.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Returns the count left behind and, on the transition to zero, the
    /// claim for the protocol run.
    fn decrement(&self, delete: bool) -> (usize, Option<Claim>) {
        let old = self.state.fetch_sub(1, Ordering::Release);
        let count = old & COUNT_MASK;
        if count == 0 {
            self.state.fetch_add(1, Ordering::Relaxed);
            log::error!("{:?}: release of an object with no references", self.id());
            return (0, None);
        }
        if count != 1 {
            return ((count - 1) as usize, None);
        }
        fence(Ordering::Acquire);
        let claim = Claim {
            epoch: (old >> 32) as u32,
            delete,
        };
        (0, Some(claim))
    }

    /// Drop one owning reference; on zero, notify observers and destroy the
    /// object unless one of them rescues it.
    ///
    /// # Safety
    /// `this` must point to a live header on which the caller owns one
    /// count. The caller must not use `this` afterwards.
    pub unsafe fn release(this: NonNull<RefHeader>) {
        let (_, claim) = unsafe { this.as_ref() }.decrement(true);
        if let Some(claim) = claim {
            unsafe { Self::unreference(this, claim) };
        }
    }

    /// Drop one owning reference without ever destroying the object. On
    /// zero, observers still receive "unreferenced". Returns the count left.
    pub fn release_no_delete(&self) -> usize {
        let (left, claim) = self.decrement(false);
        if let Some(claim) = claim {
            // SAFETY: a non-deleting claim never destroys the object.
            unsafe { Self::unreference(self.this, claim) };
        }
        left
    }

    /// Destroy the object now, whatever its count.
    ///
    /// Used by owners that manage the lifetime outside the count, for
    /// example after `release_no_delete`. Destroying an object that still
    /// has owners is logged and leaves those owners dangling.
    ///
    /// # Safety
    /// `this` must point to a live header, and no other code may use the
    /// object afterwards.
    pub unsafe fn delete_now(this: NonNull<RefHeader>) {
        let this = unsafe { this.as_ref() }.this;
        drop(unsafe { Deletion::new(this) });
    }

    unsafe fn unreference(this: NonNull<RefHeader>, claim: Claim) {
        // Callers may hold a pointer derived from `&RefHeader`; destruction
        // needs the one covering the whole allocation.
        let this = unsafe { this.as_ref() }.this;
        let outcome = {
            let header = unsafe { this.as_ref() };
            match header.observer_set() {
                Some(set) => set.unreference(header, claim),
                None if claim.delete => Outcome::Delete,
                None => Outcome::Unreferenced,
            }
        };
        if outcome != Outcome::Delete {
            return;
        }

        let handler = unsafe { this.as_ref() }.delete_handler();
        let deletion = unsafe { Deletion::new(this) };
        match handler {
            Some(handler) => {
                log::trace!("{:?}: handing over to delete handler", deletion.id());
                handler.request_delete(deletion);
            }
            None => drop(deletion),
        }
    }

    /// The observer set, if one has been created.
    pub fn observer_set(&self) -> Option<&ObserverSet> {
        let set = self.observers.load(Ordering::Acquire);
        // SAFETY: a non-null slot holds a strong count owned by this header.
        unsafe { set.as_ref() }
    }

    /// Return the observer set, creating it on first use.
    ///
    /// Concurrent first callers all get the same set. With thread safety
    /// enabled creation is serialized by the per-object lock; otherwise a
    /// compare-and-swap decides and losing candidates are discarded.
    pub fn get_or_create_observer_set(&self) -> Arc<ObserverSet> {
        let raw = match self.active_ref_lock() {
            Some(lock) => {
                let _g = lock.lock();
                self.install_observer_set()
            }
            None => self.install_observer_set(),
        };
        // SAFETY: `raw` came from `Arc::into_raw` and the header keeps that
        // strong count until it is dropped.
        unsafe {
            Arc::increment_strong_count(raw);
            Arc::from_raw(raw)
        }
    }

    fn install_observer_set(&self) -> *const ObserverSet {
        let current = self.observers.load(Ordering::Acquire);
        if !current.is_null() {
            return current;
        }
        let fresh = Arc::into_raw(Arc::new(ObserverSet::new(self.this))) as *mut ObserverSet;
        match self.observers.compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(winner) => {
                // SAFETY: `fresh` was never published.
                drop(unsafe { Arc::from_raw(fresh) });
                winner
            }
        }
    }

    fn active_ref_lock(&self) -> Option<&Mutex<()>> {
        if !self.is_thread_safe() {
            return None;
        }
        let lock = self.ref_lock.load(Ordering::Acquire);
        // SAFETY: the lock is only freed when the header is dropped.
        unsafe { lock.as_ref() }
    }

    /// Enable or disable the per-object lock.
    ///
    /// Enabling allocates the lock if it is absent. Disabling stops using it;
    /// the allocation itself is kept until the object is destroyed because
    /// another thread may be inside it.
    pub fn set_thread_safe(&self, thread_safe: bool) {
        if thread_safe && self.ref_lock.load(Ordering::Acquire).is_null() {
            let fresh = Box::into_raw(Box::new(Mutex::new(())));
            if self
                .ref_lock
                .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // SAFETY: `fresh` was never published.
                drop(unsafe { Box::from_raw(fresh) });
            }
        }
        self.thread_safe.store(thread_safe, Ordering::Release);
    }
}

impl Drop for RefHeader {
    fn drop(&mut self) {
        let count = *self.state.get_mut() & COUNT_MASK;
        if count > 0 {
            log::warn!(
                "deleting still referenced object {:?}; final reference count was {}, memory corruption possible",
                self.id(),
                count
            );
        }

        let set = *self.observers.get_mut();
        if !set.is_null() {
            // SAFETY: the slot owns one strong count from `Arc::into_raw`.
            let set = unsafe { Arc::from_raw(set) };
            set.object_destroyed();
        }

        let lock = *self.ref_lock.get_mut();
        if !lock.is_null() {
            // SAFETY: allocated with `Box::into_raw`; nobody else can reach it now.
            drop(unsafe { Box::from_raw(lock) });
        }
    }
}

impl fmt::Debug for RefHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (count, epoch) = self.snapshot();
        f.debug_struct("RefHeader")
            .field("id", &self.id())
            .field("count", &count)
            .field("epoch", &epoch)
            .field("thread_safe", &self.is_thread_safe())
            .field("observed", &self.observer_set().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RefConfig;
    use crate::ref_ptr::RefPtr;

    fn ctx(thread_safe: bool) -> Arc<RefContext> {
        Arc::new(RefContext::new(
            RefConfig::new().with_default_thread_safe(thread_safe),
        ))
    }

    #[test]
    fn epoch_bumps_only_on_revival() {
        let p = RefPtr::new_in(1u8, &ctx(false));
        let h = p.header();
        let (count, epoch) = h.snapshot();
        assert_eq!(count, 1);
        assert_eq!(h.acquire(), 2);
        assert_eq!(h.snapshot(), (2, epoch));
        assert_eq!(h.release_no_delete(), 1);
        assert_eq!(h.release_no_delete(), 0);
        assert_eq!(h.acquire(), 1);
        assert_eq!(h.snapshot(), (1, epoch.wrapping_add(1)));
    }

    #[test]
    fn try_acquire_refuses_zero() {
        let p = RefPtr::new_in(1u8, &ctx(false));
        let h = p.header();
        assert!(h.try_acquire());
        assert_eq!(h.count(), 2);
        h.release_no_delete();
        h.release_no_delete();
        assert!(!h.try_acquire());
        assert_eq!(h.count(), 0);
        h.acquire();
    }

    #[test]
    fn release_at_zero_is_ignored() {
        let p = RefPtr::new_in(1u8, &ctx(false));
        let h = p.header();
        h.release_no_delete();
        assert_eq!(h.release_no_delete(), 0);
        assert_eq!(h.count(), 0);
        h.acquire();
        assert_eq!(h.count(), 1);
    }

    #[test]
    fn thread_safety_follows_context_default() {
        let safe = RefPtr::new_in((), &ctx(true));
        assert!(safe.header().is_thread_safe());
        assert!(safe.header().has_ref_lock());

        let fast = RefPtr::new_in((), &ctx(false));
        assert!(!fast.header().is_thread_safe());
        assert!(!fast.header().has_ref_lock());
    }

    #[test]
    fn set_thread_safe_toggles_are_idempotent() {
        let p = RefPtr::new_in((), &ctx(false));
        let h = p.header();
        h.set_thread_safe(false);
        assert!(!h.has_ref_lock());
        h.set_thread_safe(true);
        h.set_thread_safe(true);
        assert!(h.is_thread_safe());
        assert!(h.has_ref_lock());
        h.set_thread_safe(false);
        assert!(!h.is_thread_safe());
        assert!(!h.has_ref_lock());
        h.set_thread_safe(true);
        assert!(h.has_ref_lock());
    }

    #[test]
    fn context_is_not_kept_alive_by_objects() {
        let context = ctx(false);
        let p = RefPtr::new_in(1u8, &context);
        assert!(Arc::ptr_eq(&p.header().context().unwrap(), &context));
        assert_eq!(Arc::strong_count(&context), 1);
        drop(context);
        assert!(p.header().context().is_none());
    }

    #[test]
    fn observer_set_is_created_once() {
        for thread_safe in [false, true] {
            let p = RefPtr::new_in(0u32, &ctx(thread_safe));
            assert!(p.header().observer_set().is_none());
            let a = p.header().get_or_create_observer_set();
            let b = p.header().get_or_create_observer_set();
            assert!(Arc::ptr_eq(&a, &b));
            assert_eq!(a.object_id(), p.id());
        }
    }
}
