//! ObserverSet: weak membership and the notification protocol for one
//! counted object.
//!
//! Layout follows a handle map: a `SlotMap` owns the registrations and a
//! `HashTable` indexes them by observer address, so registration is
//! idempotent and removal works either by observer or by key.
//!
//! All state sits behind one re-entrant mutex. The protocol in
//! `unreference` holds it for the whole notify/re-check/decide sequence,
//! and observers may call back into `add`/`remove` while it is held.
//! Every `RefCell` borrow is released before user code runs.

use crate::observer::{ObjectId, Observer};
use crate::referenced::RefHeader;
use core::cell::RefCell;
use core::fmt;
use core::hash::BuildHasher;
use hashbrown::HashTable;
use parking_lot::ReentrantMutex;
use slotmap::{new_key_type, SlotMap};
use std::collections::hash_map::RandomState;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

new_key_type! {
    /// Generational key of one registration in an `ObserverSet`.
    pub struct ObserverKey;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddError {
    /// The object's count reached zero and its destruction is underway.
    DeletionInProgress,
    /// The object has already been destroyed.
    ObjectDeleted,
}

impl fmt::Display for AddError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddError::DeletionInProgress => f.write_str("observed object is being deleted"),
            AddError::ObjectDeleted => f.write_str("observed object was deleted"),
        }
    }
}

impl std::error::Error for AddError {}

/// A zero transition of the count, identified by the revival epoch that
/// was current when it happened.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Claim {
    pub(crate) epoch: u32,
    pub(crate) delete: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Outcome {
    /// Zero transition raised from inside a callback on this thread; the
    /// outer protocol run picks it up.
    Deferred,
    /// An observer re-acquired the object.
    Rescued,
    /// Rescued and released again on another thread, which owns the
    /// newer claim.
    Superseded,
    /// Unreferenced delivered, destruction not requested.
    Unreferenced,
    /// Deleted delivered; the caller must destroy the object.
    Delete,
}

fn observer_addr<O: ?Sized>(ptr: *const O) -> usize {
    ptr as *const () as usize
}

struct Member {
    observer: Weak<dyn Observer>,
    addr: usize,
    hash: u64,
}

struct Members {
    hasher: RandomState,
    index: HashTable<ObserverKey>,
    slots: SlotMap<ObserverKey, Member>,
}

impl Members {
    fn new() -> Self {
        Self {
            hasher: RandomState::new(),
            index: HashTable::new(),
            slots: SlotMap::with_key(),
        }
    }

    fn find(&self, addr: usize) -> Option<ObserverKey> {
        let hash = self.hasher.hash_one(addr);
        self.index
            .find(hash, |&k| self.slots.get(k).map(|m| m.addr == addr).unwrap_or(false))
            .copied()
    }

    fn insert(&mut self, observer: Weak<dyn Observer>) -> ObserverKey {
        let addr = observer_addr(observer.as_ptr());
        if let Some(existing) = self.find(addr) {
            let live = self
                .slots
                .get(existing)
                .map(|m| m.observer.strong_count() > 0)
                .unwrap_or(false);
            if live {
                return existing;
            }
            // A dead registration whose address was reused by a new observer.
            self.remove(existing);
        }
        let hash = self.hasher.hash_one(addr);
        let key = self.slots.insert(Member {
            observer,
            addr,
            hash,
        });
        let slots = &self.slots;
        self.index
            .insert_unique(hash, key, |&k| slots.get(k).map(|m| m.hash).unwrap_or(0));
        key
    }

    fn remove(&mut self, key: ObserverKey) -> bool {
        let Some(member) = self.slots.remove(key) else {
            return false;
        };
        if let Ok(entry) = self.index.find_entry(member.hash, |&k| k == key) {
            entry.remove();
        }
        true
    }

    fn snapshot(&self) -> Vec<Weak<dyn Observer>> {
        self.slots.values().map(|m| m.observer.clone()).collect()
    }

    fn drain(&mut self) -> Vec<Weak<dyn Observer>> {
        self.index.clear();
        self.slots.drain().map(|(_, m)| m.observer).collect()
    }

    fn live_len(&self) -> usize {
        self.slots
            .values()
            .filter(|m| m.observer.strong_count() > 0)
            .count()
    }
}

struct SetState {
    members: Members,
    // Cleared under the lock before the object goes away.
    object: Option<NonNull<RefHeader>>,
    deleting: bool,
    in_protocol: bool,
    nested: Option<Claim>,
}

// SAFETY: `object` is only dereferenced with the set lock held and while it
// is `Some`; it is reset to `None` under that lock before the header is
// dropped. Everything else in the state is `Send`.
unsafe impl Send for SetState {}

/// The weak observers of one counted object.
///
/// Created lazily by `RefHeader::get_or_create_observer_set`; the object
/// holds one strong reference and releases it when it is destroyed, after
/// delivering "deleted". `ObserverPtr`s may keep the set itself alive
/// longer to learn that the object is gone.
pub struct ObserverSet {
    id: ObjectId,
    state: ReentrantMutex<RefCell<SetState>>,
}

impl ObserverSet {
    pub(crate) fn new(object: NonNull<RefHeader>) -> Self {
        Self {
            id: ObjectId::of(object.as_ptr()),
            state: ReentrantMutex::new(RefCell::new(SetState {
                members: Members::new(),
                object: Some(object),
                deleting: false,
                in_protocol: false,
                nested: None,
            })),
        }
    }

    /// Identity of the observed object.
    pub fn object_id(&self) -> ObjectId {
        self.id
    }

    /// False once "deleted" has been delivered.
    pub fn is_object_alive(&self) -> bool {
        self.state.lock().borrow().object.is_some()
    }

    /// True between the start of a deleting protocol run and either a
    /// rescue or the object's destruction.
    pub fn is_deleting(&self) -> bool {
        self.state.lock().borrow().deleting
    }

    /// Number of registered observers that are still alive.
    pub fn len(&self) -> usize {
        self.state.lock().borrow().members.live_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains<O: Observer + 'static>(&self, observer: &Arc<O>) -> bool {
        let addr = observer_addr(Arc::as_ptr(observer));
        self.state.lock().borrow().members.find(addr).is_some()
    }

    /// Register `observer` weakly. Registering twice returns the same key.
    pub fn add<O: Observer + 'static>(&self, observer: &Arc<O>) -> Result<ObserverKey, AddError> {
        let weak: Weak<O> = Arc::downgrade(observer);
        self.add_weak(weak)
    }

    pub fn add_weak(&self, observer: Weak<dyn Observer>) -> Result<ObserverKey, AddError> {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if st.object.is_none() {
            return Err(AddError::ObjectDeleted);
        }
        if st.deleting {
            return Err(AddError::DeletionInProgress);
        }
        Ok(st.members.insert(observer))
    }

    pub fn remove<O: Observer + 'static>(&self, observer: &Arc<O>) -> bool {
        let addr = observer_addr(Arc::as_ptr(observer));
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        match st.members.find(addr) {
            Some(key) => st.members.remove(key),
            None => false,
        }
    }

    pub fn remove_key(&self, key: ObserverKey) -> bool {
        let guard = self.state.lock();
        let removed = guard.borrow_mut().members.remove(key);
        removed
    }

    /// Deliver "unreferenced" to a snapshot of the current members.
    pub fn notify_unreferenced(&self, object: &RefHeader) {
        let guard = self.state.lock();
        let snapshot = guard.borrow().members.snapshot();
        for observer in snapshot.iter().filter_map(Weak::upgrade) {
            observer.object_unreferenced(object);
        }
    }

    /// Deliver "deleted" and drop all registrations. A second call finds no
    /// members and delivers nothing.
    pub fn notify_deleted(&self, id: ObjectId) {
        debug_assert_eq!(id, self.id);
        let guard = self.state.lock();
        let drained = {
            let mut st = guard.borrow_mut();
            st.object = None;
            st.members.drain()
        };
        for observer in drained.iter().filter_map(Weak::upgrade) {
            observer.object_deleted(id);
        }
    }

    /// Run the unreference protocol for one zero transition.
    ///
    /// Lock, notify, then re-check the count and epoch under the same lock
    /// before deciding. The caller destroys the object only on
    /// `Outcome::Delete`, after this returns and the lock is released.
    pub(crate) fn unreference(&self, object: &RefHeader, mut claim: Claim) -> Outcome {
        let guard = self.state.lock();
        {
            let mut st = guard.borrow_mut();
            if st.in_protocol {
                st.nested = Some(claim);
                return Outcome::Deferred;
            }
            st.in_protocol = true;
            st.deleting = claim.delete;
        }

        let outcome = loop {
            self.notify_unreferenced(object);

            let (count, epoch) = object.snapshot();
            if count != 0 {
                break Outcome::Rescued;
            }
            if epoch != claim.epoch {
                let mut st = guard.borrow_mut();
                match st.nested.take() {
                    Some(nested) if nested.epoch == epoch => {
                        claim = nested;
                        st.deleting = claim.delete;
                        continue;
                    }
                    _ => break Outcome::Superseded,
                }
            }
            break if claim.delete {
                Outcome::Delete
            } else {
                Outcome::Unreferenced
            };
        };

        match outcome {
            Outcome::Delete => self.notify_deleted(self.id),
            Outcome::Rescued | Outcome::Superseded => log::debug!(
                "{:?}: delete cancelled, object rescued during unreferenced notification",
                self.id
            ),
            _ => {}
        }

        {
            let mut st = guard.borrow_mut();
            st.in_protocol = false;
            st.nested = None;
            if outcome != Outcome::Delete {
                st.deleting = false;
            }
        }
        outcome
    }

    /// Final "deleted" pass from the object's destructor; delivers only if
    /// the protocol has not already done so.
    pub(crate) fn object_destroyed(&self) {
        let guard = self.state.lock();
        let pending = guard.borrow().object.is_some();
        if pending {
            self.notify_deleted(self.id);
        }
    }

    /// Acquire the observed object if it still has owners.
    ///
    /// Never revives a zero-count object; that is reserved for observers in
    /// the unreferenced window.
    pub(crate) fn try_acquire_object(&self) -> Option<NonNull<RefHeader>> {
        let guard = self.state.lock();
        let st = guard.borrow();
        let object = st.object?;
        // SAFETY: `object` is `Some`, so the header has not been dropped; it
        // cannot be dropped while we hold the lock.
        let acquired = unsafe { object.as_ref() }.try_acquire();
        acquired.then_some(object)
    }
}

impl fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSet")
            .field("object", &self.id)
            .finish_non_exhaustive()
    }
}
