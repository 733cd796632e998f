// Observer notification suite.
//
// Each test documents the behavior it verifies. Core invariants exercised:
// - Ordering: "unreferenced" always precedes "deleted" for one object.
// - Exactly once: one "deleted" per registered observer, one destruction.
// - Rescue: acquiring in the unreferenced window cancels destruction.
// - Membership: registration during deletion is rejected; removal during
//   notification neither skips nor repeats other observers.
use parking_lot::Mutex;
use referenced::{
    AddError, AnyRef, ObjectId, Observer, RefConfig, RefContext, RefHeader, RefPtr,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ctx() -> Arc<RefContext> {
    Arc::new(RefContext::new(RefConfig::new()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Event {
    Unreferenced { id: ObjectId, count: usize },
    Deleted(ObjectId),
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn deleted(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Deleted(_)))
            .count()
    }
}

impl Observer for Recorder {
    fn object_unreferenced(&self, object: &RefHeader) {
        self.events.lock().push(Event::Unreferenced {
            id: object.id(),
            count: object.count(),
        });
    }

    fn object_deleted(&self, id: ObjectId) {
        self.events.lock().push(Event::Deleted(id));
    }
}

struct Tracked(Arc<AtomicUsize>);

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// Test: last release delivers both notifications, in order.
// Verifies: observer sees Unreferenced (count 0) then Deleted, nothing else.
#[test]
fn last_release_notifies_unreferenced_then_deleted() {
    init_logging();
    let drops = Arc::new(AtomicUsize::new(0));
    let p = RefPtr::new_in(Tracked(drops.clone()), &ctx());
    let id = p.id();
    let rec = Arc::new(Recorder::default());
    p.header().get_or_create_observer_set().add(&rec).unwrap();

    let q = p.clone();
    drop(p);
    assert!(rec.events().is_empty(), "non-final release must be silent");

    drop(q);
    assert_eq!(
        rec.events(),
        vec![Event::Unreferenced { id, count: 0 }, Event::Deleted(id)]
    );
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

// Test: every registered observer gets exactly one "deleted".
#[test]
fn each_observer_is_told_once() {
    init_logging();
    let p = RefPtr::new_in(1u32, &ctx());
    let set = p.header().get_or_create_observer_set();
    let recs: Vec<_> = (0..5).map(|_| Arc::new(Recorder::default())).collect();
    for r in &recs {
        set.add(r).unwrap();
    }
    drop(p);
    for r in &recs {
        assert_eq!(r.deleted(), 1);
    }
    assert!(set.is_empty());
    assert!(!set.is_object_alive());
}

/// Rescues the object the first time it becomes unreferenced.
#[derive(Default)]
struct Rescuer {
    rescued: Mutex<Option<AnyRef>>,
    armed: AtomicBool,
    count_after_rescue: AtomicUsize,
    deleted: AtomicUsize,
}

impl Observer for Rescuer {
    fn object_unreferenced(&self, object: &RefHeader) {
        if self.armed.swap(false, Ordering::SeqCst) {
            let handle = object.rescue();
            self.count_after_rescue
                .store(object.count(), Ordering::SeqCst);
            *self.rescued.lock() = Some(handle);
        }
    }

    fn object_deleted(&self, _id: ObjectId) {
        self.deleted.fetch_add(1, Ordering::SeqCst);
    }
}

// Test: rescue during the unreferenced window.
// Assumes: the rescuing observer keeps the new reference.
// Verifies: no destruction and no "deleted" for that cycle; the count
// reflects the rescue; a later release without rescue destroys once.
#[test]
fn rescue_cancels_destruction() {
    init_logging();
    let drops = Arc::new(AtomicUsize::new(0));
    let p = RefPtr::new_in(Tracked(drops.clone()), &ctx());
    let rescuer = Arc::new(Rescuer::default());
    rescuer.armed.store(true, Ordering::SeqCst);
    let rec = Arc::new(Recorder::default());
    let set = p.header().get_or_create_observer_set();
    set.add(&rescuer).unwrap();
    set.add(&rec).unwrap();

    drop(p);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert_eq!(rescuer.count_after_rescue.load(Ordering::SeqCst), 1);
    assert_eq!(rescuer.deleted.load(Ordering::SeqCst), 0);
    assert_eq!(rec.deleted(), 0);
    assert!(set.is_object_alive());
    assert!(!set.is_deleting());

    let handle = rescuer.rescued.lock().take().unwrap();
    assert_eq!(handle.count(), 1);
    let typed = handle.downcast::<Tracked>().unwrap();
    drop(typed);

    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(rescuer.deleted.load(Ordering::SeqCst), 1);
    assert_eq!(rec.deleted(), 1);
}

/// Rescues and immediately lets go, inside the callback.
#[derive(Default)]
struct BounceBack {
    calls: AtomicUsize,
}

impl Observer for BounceBack {
    fn object_unreferenced(&self, object: &RefHeader) {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            let handle = object.rescue();
            drop(handle);
        }
    }
}

// Test: a rescue released again from within the callback.
// Verifies: the nested zero transition is folded into the running protocol;
// the object is destroyed exactly once and "deleted" arrives once.
#[test]
fn nested_rescue_and_release_destroys_once() {
    init_logging();
    let drops = Arc::new(AtomicUsize::new(0));
    let p = RefPtr::new_in(Tracked(drops.clone()), &ctx());
    let bounce = Arc::new(BounceBack::default());
    let rec = Arc::new(Recorder::default());
    let set = p.header().get_or_create_observer_set();
    set.add(&bounce).unwrap();
    set.add(&rec).unwrap();

    drop(p);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(bounce.calls.load(Ordering::SeqCst), 2);
    assert_eq!(rec.deleted(), 1);
    let events = rec.events();
    assert!(matches!(events.last(), Some(Event::Deleted(_))));
}

/// Tries to register another observer while the object is going away.
struct LateJoiner {
    newcomer: Arc<Recorder>,
    result: Mutex<Option<Result<(), AddError>>>,
}

impl Observer for LateJoiner {
    fn object_unreferenced(&self, object: &RefHeader) {
        let set = object.observer_set().expect("set exists while notifying");
        let res = set.add(&self.newcomer).map(|_| ());
        *self.result.lock() = Some(res);
    }
}

// Test: registration during the deletion-in-progress window.
// Verifies: add is rejected and the newcomer receives nothing.
#[test]
fn add_during_deletion_is_rejected() {
    init_logging();
    let p = RefPtr::new_in("doomed", &ctx());
    let joiner = Arc::new(LateJoiner {
        newcomer: Arc::new(Recorder::default()),
        result: Mutex::new(None),
    });
    p.header().get_or_create_observer_set().add(&joiner).unwrap();

    drop(p);
    assert_eq!(
        *joiner.result.lock(),
        Some(Err(AddError::DeletionInProgress))
    );
    assert!(joiner.newcomer.events().is_empty());
}

// Test: registration allowed again after a rescue.
#[test]
fn deleting_flag_clears_after_rescue() {
    init_logging();
    let p = RefPtr::new_in(0u8, &ctx());
    let rescuer = Arc::new(Rescuer::default());
    rescuer.armed.store(true, Ordering::SeqCst);
    let set = p.header().get_or_create_observer_set();
    set.add(&rescuer).unwrap();
    drop(p);

    let late = Arc::new(Recorder::default());
    assert!(set.add(&late).is_ok());
    drop(rescuer.rescued.lock().take());
    assert_eq!(late.deleted(), 1);
}

/// Unregisters itself from the set when notified.
struct Quitter {
    unreferenced: AtomicUsize,
    deleted: AtomicUsize,
    me: Mutex<Option<std::sync::Weak<Quitter>>>,
}

impl Observer for Quitter {
    fn object_unreferenced(&self, object: &RefHeader) {
        self.unreferenced.fetch_add(1, Ordering::SeqCst);
        let me = self.me.lock().as_ref().and_then(|w| w.upgrade());
        if let (Some(me), Some(set)) = (me, object.observer_set()) {
            assert!(set.remove(&me));
        }
    }

    fn object_deleted(&self, _id: ObjectId) {
        self.deleted.fetch_add(1, Ordering::SeqCst);
    }
}

// Test: an observer removing itself during notification.
// Verifies: the others are each visited exactly once; the quitter gets no
// "deleted" after leaving.
#[test]
fn self_removal_during_notification() {
    init_logging();
    let p = RefPtr::new_in(9i32, &ctx());
    let set = p.header().get_or_create_observer_set();
    let before = Arc::new(Recorder::default());
    let quitter = Arc::new(Quitter {
        unreferenced: AtomicUsize::new(0),
        deleted: AtomicUsize::new(0),
        me: Mutex::new(None),
    });
    *quitter.me.lock() = Some(Arc::downgrade(&quitter));
    let after = Arc::new(Recorder::default());
    set.add(&before).unwrap();
    set.add(&quitter).unwrap();
    set.add(&after).unwrap();

    drop(p);
    assert_eq!(quitter.unreferenced.load(Ordering::SeqCst), 1);
    assert_eq!(quitter.deleted.load(Ordering::SeqCst), 0);
    for r in [&before, &after] {
        assert_eq!(r.events().len(), 2);
        assert_eq!(r.deleted(), 1);
    }
}

// Test: release_no_delete only signals.
// Verifies: unreferenced without deleted; the object stays usable and is
// destroyed normally once re-acquired and released.
#[test]
fn release_no_delete_keeps_object() {
    init_logging();
    let drops = Arc::new(AtomicUsize::new(0));
    let p = RefPtr::new_in(Tracked(drops.clone()), &ctx());
    let id = p.id();
    let rec = Arc::new(Recorder::default());
    p.header().get_or_create_observer_set().add(&rec).unwrap();

    let raw = RefPtr::release_no_delete(p);
    assert_eq!(rec.events(), vec![Event::Unreferenced { id, count: 0 }]);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    let again = unsafe { RefPtr::acquire_raw(raw) };
    assert_eq!(again.count(), 1);
    drop(again);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(
        rec.events(),
        vec![
            Event::Unreferenced { id, count: 0 },
            Event::Unreferenced { id, count: 0 },
            Event::Deleted(id),
        ]
    );
}

// Test: explicit destruction after release_no_delete.
// Verifies: the destructor's final pass delivers "deleted" exactly once.
#[test]
fn delete_now_after_release_no_delete() {
    init_logging();
    let drops = Arc::new(AtomicUsize::new(0));
    let p = RefPtr::new_in(Tracked(drops.clone()), &ctx());
    let rec = Arc::new(Recorder::default());
    p.header().get_or_create_observer_set().add(&rec).unwrap();

    let raw = RefPtr::release_no_delete(p);
    unsafe { RefHeader::delete_now(raw.cast()) };
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(rec.deleted(), 1);
}

// Test: performance mode leaves nothing behind.
// Assumes: context default is not thread-safe.
// Verifies: an acquire/release cycle allocates neither lock nor set.
#[test]
fn unshared_objects_allocate_no_side_structures() {
    init_logging();
    let p = RefPtr::new_in(String::from("plain"), &ctx());
    for _ in 0..10 {
        let q = p.clone();
        drop(q);
    }
    assert!(!p.header().is_thread_safe());
    assert!(!p.header().has_ref_lock());
    assert!(p.header().observer_set().is_none());
    assert_eq!(p.count(), 1);
}

// Test: a dropped observer is simply skipped.
#[test]
fn dead_observers_are_skipped() {
    init_logging();
    let p = RefPtr::new_in((), &ctx());
    let set = p.header().get_or_create_observer_set();
    let gone = Arc::new(Recorder::default());
    set.add(&gone).unwrap();
    drop(gone);
    drop(p);
    assert!(!set.is_object_alive());
}

/// Fetches the object's observer set from inside the callback.
#[derive(Default)]
struct SetFetcher {
    seen: Mutex<Option<usize>>,
}

impl Observer for SetFetcher {
    fn object_unreferenced(&self, object: &RefHeader) {
        let set = object.get_or_create_observer_set();
        *self.seen.lock() = Some(Arc::as_ptr(&set) as usize);
    }
}

// Test: a callback takes the per-object lock while the set lock is held.
// Assumes: thread safety on, so set lookup goes through the per-object lock.
// Verifies: no deadlock; the callback gets the set it is registered in.
#[test]
fn callback_may_fetch_the_observer_set() {
    init_logging();
    let context = Arc::new(RefContext::new(
        RefConfig::new().with_default_thread_safe(true),
    ));
    let p = RefPtr::new_in(1u64, &context);
    assert!(p.header().has_ref_lock());
    let set = p.header().get_or_create_observer_set();
    let fetcher = Arc::new(SetFetcher::default());
    set.add(&fetcher).unwrap();

    drop(p);
    assert_eq!(*fetcher.seen.lock(), Some(Arc::as_ptr(&set) as usize));
    assert!(!set.is_object_alive());
}
