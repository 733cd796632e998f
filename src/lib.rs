//! referenced: intrusive reference counting with weak observers and a
//! pluggable deletion strategy, for objects shared across threads.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: let any value be owned by a changing number of holders on any
//!   thread, while other parties learn when it becomes unreferenced or is
//!   destroyed without owning it themselves.
//! - Layers:
//!   - RefHeader: the counter placed at the front of every allocation.
//!     Owns `acquire`/`release`, the lazily created observer set, the
//!     optional per-object lock and the unreference protocol.
//!   - ObserverSet: weak membership (slot map + identity index) behind a
//!     re-entrant lock; delivers "unreferenced" and "deleted".
//!   - RefPtr / AnyRef / ObserverPtr: typed owning, erased owning, and
//!     weak handles on top of the header.
//!   - RefContext + DeleteHandler: injected policy. Objects remember the
//!     context they were created in (weakly, so a handler holding deletions
//!     cannot keep its own context alive); `RefPtr::new` uses the
//!     process-wide one.
//!
//! Constraints
//! - Exactly one "deleted" notification and one destruction per object,
//!   however many threads release concurrently.
//! - Observer sets are created at most once per object, by lock or CAS.
//! - Objects that are never observed allocate nothing beyond themselves;
//!   objects that are not thread-safe carry no lock.
//! - Observers are never owned: the set stores `Weak<dyn Observer>`.
//!
//! Unreference protocol
//! - The thread whose decrement reaches zero locks the observer set,
//!   delivers "unreferenced", then re-checks the count under the same
//!   lock. An observer may rescue the object in that window by acquiring
//!   it; the destruction is then abandoned.
//! - A revival epoch packed next to the count tells a rescued-and-released
//!   object apart from an untouched one, so a stale zero transition never
//!   destroys an object someone else now owns.
//! - Otherwise "deleted" is delivered, the lock is released, and the
//!   object goes to the delete handler (or is dropped in place).
//!
//! Lock ordering
//! - The per-object lock guards observer-set creation only. It may nest
//!   inside the observer-set lock (a callback creating the set), never the
//!   reverse.
//!
//! Misuse
//! - Destroying an object with owners left, or releasing one with none,
//!   is logged through `log` and otherwise ignored. Count overflow aborts,
//!   matching `Rc`.
//!
//! Notes and non-goals
//! - No cycle detection or tracing collection; ownership is acyclic by
//!   convention.
//! - `RefHeader::release` and `delete_now` are `unsafe`: they end the
//!   caller's right to touch the object.

pub mod config;
pub mod context;
pub mod delete_handler;
pub mod observer;
pub mod observer_ptr;
pub mod observer_set;
pub mod ref_ptr;
pub mod referenced;

// Public surface
pub use config::{ConfigError, RefConfig, THREAD_SAFE_ENV};
pub use context::RefContext;
pub use delete_handler::{DeleteHandler, Deletion, RetainingDeleteHandler, ThreadedDeleteHandler};
pub use observer::{ObjectId, Observer};
pub use observer_ptr::ObserverPtr;
pub use observer_set::{AddError, ObserverKey, ObserverSet};
pub use ref_ptr::{AnyRef, RefCounted, RefPtr};
pub use referenced::RefHeader;
